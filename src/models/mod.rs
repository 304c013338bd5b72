//! Core data models for the upload service.
//!
//! `FileRecord` maps to the `files` table via `sqlx::FromRow`; session types
//! live only in memory. Everything serializes as JSON via `serde`.

pub mod file;
pub mod session;

pub use file::{FilePage, FileRecord, Metadata, UploadMeta};
pub use session::{
    ChunkAck, ChunkRecord, InitUpload, SessionDescriptor, SessionStatus, UploadSession,
};
