//! Represents a logical, user-facing file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use uuid::Uuid;

/// Free-form key/value metadata attached to uploads and files.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A single logical file.
///
/// Many `FileRecord`s may share one physical blob: every record whose
/// `content_hash` matches points at the same `storage_path`. The blob is
/// owned collectively and is only removed once no record references it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    /// Unique identifier, also the stable URL segment.
    pub id: Uuid,

    /// Sanitized name used when serving the file.
    pub filename: String,

    /// Name as supplied by the uploader.
    pub original_name: String,

    /// Physical blob path, shared with every record of the same hash.
    pub storage_path: String,

    /// Content type (MIME type).
    pub mime_type: String,

    /// Size in bytes.
    pub file_size: i64,

    /// Owning context (e.g. "avatars", "public").
    pub context: String,

    /// Identity of the uploader.
    pub uploader: String,

    /// Upload source tag ("direct", "chunked", ...).
    pub upload_source: String,

    /// Caller supplied metadata.
    pub metadata: Json<Metadata>,

    pub is_public: bool,

    /// Lowercase hex SHA-256 of the uploaded bytes.
    pub content_hash: String,

    pub access_count: i64,

    pub is_suspended: bool,

    pub suspension_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Set when soft-deleted; the row is purged after a grace period.
    pub deleted_at: Option<DateTime<Utc>>,

    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// File size as an unsigned byte count.
    pub fn size(&self) -> u64 {
        self.file_size.max(0) as u64
    }
}

/// Descriptive fields of an upload, shared by the whole-file and chunked paths.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct UploadMeta {
    pub original_filename: String,
    pub mime_type: String,
    pub context: String,
    /// Filled from the request identity when left empty.
    #[serde(default)]
    pub uploader: String,
    /// Defaults to "direct" for whole uploads and "chunked" for sessions.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// One page of a context listing.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FilePage {
    pub files: Vec<FileRecord>,
    /// Opaque cursor for the next page, absent on the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Reduce an uploaded name to something safe to serve back.
///
/// Path components are dropped and anything outside a conservative
/// character set becomes `_`. Empty results fall back to `file`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
