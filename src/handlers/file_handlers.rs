//! HTTP handlers for stored files: whole uploads, downloads, listing and
//! deletion.

use super::upload_handlers::{body_stream, uploader_from};
use crate::{
    errors::AppError,
    models::{FilePage, FileRecord, Metadata, UploadMeta},
    services::upload_service::UploadService,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

const META_HEADER_PREFIX: &str = "x-meta-";
const DEFAULT_PAGE_SIZE: usize = 100;

/// Query params accepted by `POST /files`.
#[derive(Debug, Deserialize)]
pub struct UploadFileQuery {
    pub filename: String,
    pub context: String,
    pub source: Option<String>,
}

/// Query params accepted by `GET /files`.
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub context: String,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

/// POST `/files` — store a complete file from the request body.
pub async fn upload_file(
    State(service): State<UploadService>,
    Query(q): Query<UploadFileQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<FileRecord>), AppError> {
    if q.filename.trim().is_empty() {
        return Err(AppError::bad_request("filename must not be empty"));
    }
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let meta = UploadMeta {
        original_filename: q.filename,
        mime_type,
        context: q.context,
        uploader: uploader_from(&headers),
        source: q.source,
        metadata: metadata_from(&headers),
    };
    let record = service.upload_whole(body_stream(body), meta).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET `/files?context=` — one page of a context.
pub async fn list_files(
    State(service): State<UploadService>,
    Query(q): Query<ListFilesQuery>,
) -> Result<Json<FilePage>, AppError> {
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let page = service
        .list_files(&q.context, q.cursor.as_deref(), limit)
        .await?;
    Ok(Json(page))
}

/// GET `/files/{id}` — stream the file content.
pub async fn get_file(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let (record, reader) = service.open_file(id).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &record);
    Ok(response)
}

/// GET `/files/{id}/meta` — the file record.
pub async fn get_file_meta(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(service.get_file(id).await?))
}

/// DELETE `/files/{id}` — soft delete.
pub async fn delete_file(
    State(service): State<UploadService>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    service.delete_file(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `x-meta-*` request headers as metadata, keyed without the prefix.
fn metadata_from(headers: &HeaderMap) -> Metadata {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
            let value = value.to_str().ok()?;
            Some((key.to_string(), Value::String(value.to_string())))
        })
        .collect()
}

fn set_file_headers(headers: &mut HeaderMap, record: &FileRecord) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&record.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(record.size()));

    let quoted = format!("\"{}\"", record.content_hash);
    if let Ok(value) = HeaderValue::from_str(&quoted) {
        headers.insert(header::ETAG, value);
    }

    let disposition = format!("inline; filename=\"{}\"", record.filename);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
