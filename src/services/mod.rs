//! Upload core: sessions, assembly, deduplication and the capabilities
//! they run on.

pub mod assembly;
pub mod blob_store;
pub mod clock;
pub mod dedup;
pub mod fs;
pub mod hasher;
pub mod reaper;
pub mod records;
pub mod sessions;
pub mod upload_service;
