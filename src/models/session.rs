//! Resumable upload sessions and the chunks they receive.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};
use uuid::Uuid;

use super::file::{FileRecord, Metadata, UploadMeta};

/// Request to open a chunked upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUpload {
    #[serde(flatten)]
    pub meta: UploadMeta,

    /// Declared total size in bytes.
    pub total_size: u64,

    /// Requested chunk size; the configured default applies when absent.
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

/// Returned to the client after a session is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: Uuid,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub expires_at: DateTime<Utc>,
    /// Advisory upper bound on parallel chunk uploads.
    pub max_concurrent_chunks: u32,
}

/// Acknowledgement for one stored chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub chunk_index: u32,
    pub progress: f64,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    /// True once every index has a chunk recorded.
    pub is_now_complete: bool,
}

/// Snapshot answered by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    /// Indices still to upload, ascending.
    pub missing_chunks: Vec<u32>,
    pub uploaded_bytes: u64,
    pub progress: f64,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
}

/// Receipt of one chunk.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub index: u32,
    pub size: u64,
    /// Temporary file holding the chunk bytes.
    pub path: PathBuf,
    pub uploaded_at: DateTime<Utc>,
}

/// Server-side state of one resumable upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: Uuid,
    pub original_filename: String,
    pub total_size: u64,
    pub mime_type: String,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub context: String,
    pub uploader: String,
    pub upload_source: String,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Received chunks by index. A second write to an index replaces the first.
    pub chunks: BTreeMap<u32, ChunkRecord>,
    pub completed: bool,
    /// Set once assembly succeeded.
    pub file_record: Option<FileRecord>,
}

impl UploadSession {
    /// Build a session; `total_chunks` must already be validated.
    pub fn new(
        meta: UploadMeta,
        total_size: u64,
        chunk_size: u64,
        total_chunks: u32,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_filename: meta.original_filename,
            total_size,
            mime_type: meta.mime_type,
            chunk_size,
            total_chunks,
            context: meta.context,
            uploader: meta.uploader,
            upload_source: meta.source.unwrap_or_else(|| "chunked".to_string()),
            metadata: meta.metadata,
            created_at: now,
            expires_at: now + timeout,
            chunks: BTreeMap::new(),
            completed: false,
            file_record: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn uploaded_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Total bytes across the chunks currently recorded.
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks.values().map(|c| c.size).sum()
    }

    pub fn has_all_chunks(&self) -> bool {
        self.uploaded_count() == self.total_chunks
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.uploaded_count() as f64 / self.total_chunks as f64) * 100.0
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id,
            uploaded_chunks: self.uploaded_count(),
            total_chunks: self.total_chunks,
            missing_chunks: self.missing_chunks(),
            uploaded_bytes: self.uploaded_bytes(),
            progress: self.progress(),
            completed: self.completed,
            file_id: self.file_record.as_ref().map(|f| f.id),
            expires_at: self.expires_at,
        }
    }
}

/// `ceil(total_size / chunk_size)`; `None` when the count does not fit in `u32`.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return None;
    }
    u32::try_from(total_size.div_ceil(chunk_size)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total_size: u64, chunk_size: u64) -> UploadSession {
        let meta = UploadMeta {
            original_filename: "video.mp4".into(),
            mime_type: "video/mp4".into(),
            context: "media".into(),
            uploader: "alice".into(),
            ..Default::default()
        };
        let total = chunk_count(total_size, chunk_size).unwrap();
        UploadSession::new(meta, total_size, chunk_size, total, Utc::now(), Duration::hours(1))
    }

    fn record(index: u32, size: u64) -> ChunkRecord {
        ChunkRecord {
            index,
            size,
            path: PathBuf::from(format!("{index}.chunk")),
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(chunk_count(30_000_000, 10_000_000), Some(3));
        assert_eq!(chunk_count(30_000_001, 10_000_000), Some(4));
        assert_eq!(chunk_count(1, 10_000_000), Some(1));
        assert_eq!(chunk_count(10, 0), None);
        assert_eq!(chunk_count(u64::MAX, 1), None);
    }

    #[test]
    fn test_progress_and_missing() {
        let mut s = session(30, 10);
        assert_eq!(s.upload_source, "chunked");
        assert_eq!(s.missing_chunks(), vec![0, 1, 2]);

        s.chunks.insert(2, record(2, 10));
        s.chunks.insert(0, record(0, 10));
        assert_eq!(s.missing_chunks(), vec![1]);
        assert!((s.progress() - 66.666).abs() < 0.01);
        assert!(!s.has_all_chunks());
    }

    #[test]
    fn test_overwrite_recomputes_bytes() {
        let mut s = session(25, 10);
        s.chunks.insert(2, record(2, 10));
        s.chunks.insert(2, record(2, 5));
        assert_eq!(s.uploaded_count(), 1);
        assert_eq!(s.uploaded_bytes(), 5);
    }

    #[test]
    fn test_expiry_boundary() {
        let s = session(10, 10);
        assert!(!s.is_expired(s.created_at));
        assert!(s.is_expired(s.expires_at));
    }
}
