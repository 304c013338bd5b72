//! HTTP handlers for resumable chunked uploads.
//! Chunk bodies are streamed straight to disk; nothing is buffered in memory.

use crate::{
    errors::{AppError, UploadError},
    models::{ChunkAck, FileRecord, InitUpload, SessionDescriptor, SessionStatus},
    services::upload_service::UploadService,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use futures::StreamExt;
use std::io;
use uuid::Uuid;

const UPLOADER_HEADER: &str = "x-uploader";

/// Caller identity taken from `x-uploader`, `anonymous` when absent.
pub(crate) fn uploader_from(headers: &HeaderMap) -> String {
    headers
        .get(UPLOADER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

/// Request body as a byte stream the core can consume.
pub(crate) fn body_stream(body: Body) -> crate::services::fs::ByteStream<'static> {
    body.into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed()
}

/// POST `/uploads` — open a chunked upload session.
pub async fn create_upload(
    State(service): State<UploadService>,
    headers: HeaderMap,
    Json(mut request): Json<InitUpload>,
) -> Result<(StatusCode, Json<SessionDescriptor>), AppError> {
    if request.meta.uploader.is_empty() {
        request.meta.uploader = uploader_from(&headers);
    }
    let descriptor = service.init_upload(request).await?;
    Ok((StatusCode::CREATED, Json(descriptor)))
}

/// PUT `/uploads/{id}/chunks/{index}` — store one chunk.
///
/// `Content-Length` is the declared chunk size and is required.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    Path((session_id, index)): Path<(Uuid, u32)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ChunkAck>, AppError> {
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| AppError::new(StatusCode::LENGTH_REQUIRED, "Content-Length is required"))?;

    let ack = service
        .upload_chunk(session_id, index, body_stream(body), declared_size)
        .await?;
    Ok(Json(ack))
}

/// GET `/uploads/{id}` — session progress.
pub async fn get_upload_status(
    State(service): State<UploadService>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionStatus>, AppError> {
    Ok(Json(service.get_status(session_id).await?))
}

/// POST `/uploads/{id}/complete` — assemble the uploaded chunks.
pub async fn complete_upload(
    State(service): State<UploadService>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(service.complete_upload(session_id).await?))
}

/// DELETE `/uploads/{id}` — abandon a session.
pub async fn cancel_upload(
    State(service): State<UploadService>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    if !service.cancel_upload(session_id).await {
        return Err(UploadError::SessionNotFound(session_id).into());
    }
    Ok(StatusCode::NO_CONTENT)
}
