//! Defines routes for chunked uploads and stored files.
//!
//! ## Structure
//! - **Upload sessions**
//!   - `POST   /uploads` — open a session
//!   - `GET    /uploads/{id}` — session progress
//!   - `DELETE /uploads/{id}` — cancel a session
//!   - `PUT    /uploads/{id}/chunks/{index}` — upload one chunk
//!   - `POST   /uploads/{id}/complete` — assemble the file
//!
//! - **Files**
//!   - `POST   /files` — whole-file upload
//!   - `GET    /files?context=` — list a context
//!   - `GET    /files/{id}` — download
//!   - `GET    /files/{id}/meta` — file record
//!   - `DELETE /files/{id}` — soft delete

use crate::{
    handlers::{
        file_handlers::{delete_file, get_file, get_file_meta, list_files, upload_file},
        health_handlers::{healthz, readyz},
        upload_handlers::{
            cancel_upload, complete_upload, create_upload, get_upload_status, upload_chunk,
        },
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post, put},
};

/// Build the router. Every handler shares the `UploadService` state.
///
/// Body size is bounded by the service itself (chunk size, max file size),
/// so axum's default request body limit is lifted.
pub fn routes() -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload sessions
        .route("/uploads", post(create_upload))
        .route(
            "/uploads/{id}",
            get(get_upload_status).delete(cancel_upload),
        )
        .route("/uploads/{id}/chunks/{index}", put(upload_chunk))
        .route("/uploads/{id}/complete", post(complete_upload))
        // Files
        .route("/files", post(upload_file).get(list_files))
        .route("/files/{id}", get(get_file).delete(delete_file))
        .route("/files/{id}/meta", get(get_file_meta))
        .layer(DefaultBodyLimit::disable())
}
