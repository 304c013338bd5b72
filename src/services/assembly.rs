//! Turns a fully uploaded session into a single file and hands it to the
//! dedup layer.

use futures::{StreamExt, TryStreamExt, stream};
use serde_json::Value;
use std::{path::PathBuf, sync::Arc};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    clock::Clock,
    dedup::{DedupResolver, ResolveRequest},
    fs::{ByteStream, FileSystem},
    records::FileRecordStore,
    sessions::SessionManager,
};
use crate::{
    errors::{UploadError, UploadResult},
    models::FileRecord,
};

#[derive(Clone)]
pub struct Assembler {
    sessions: SessionManager,
    resolver: DedupResolver,
    records: Arc<dyn FileRecordStore>,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
}

impl Assembler {
    pub fn new(
        sessions: SessionManager,
        resolver: DedupResolver,
        records: Arc<dyn FileRecordStore>,
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            resolver,
            records,
            fs,
            clock,
        }
    }

    /// Concatenate the chunks of session `id` in index order and resolve the
    /// result into a `FileRecord`.
    ///
    /// At most one assembly runs per session. Once a session has completed,
    /// further calls return the same record until the session is reaped.
    /// On failure the chunks are left in place so the caller can retry.
    pub async fn assemble(&self, id: Uuid) -> UploadResult<FileRecord> {
        let slot = self.sessions.live_slot(id).await?;
        let _assembling = slot.lock_assembly().await;

        let (paths, total_size, request) = {
            let session = slot.session().await;
            if session.completed {
                if let Some(record) = &session.file_record {
                    return Ok(record.clone());
                }
            }
            let missing = session.missing_chunks();
            if !missing.is_empty() {
                return Err(UploadError::MissingChunks(missing));
            }

            let paths: Vec<PathBuf> = session.chunks.values().map(|c| c.path.clone()).collect();
            let mut metadata = session.metadata.clone();
            metadata.insert(
                "chunked_session_id".to_string(),
                Value::String(session.id.to_string()),
            );
            let request = ResolveRequest {
                original_filename: session.original_filename.clone(),
                mime_type: session.mime_type.clone(),
                declared_size: session.total_size,
                context: session.context.clone(),
                uploader: session.uploader.clone(),
                source: session.upload_source.clone(),
                metadata,
            };
            (paths, session.total_size, request)
        };
        if slot.is_closed() {
            return Err(UploadError::SessionNotFound(id));
        }

        let temp = self
            .sessions
            .settings()
            .temp_dir
            .join("assembly")
            .join(format!("{id}-{}.part", Uuid::new_v4().simple()));
        let written = match self.fs.write_stream(&temp, self.chunk_stream(paths)).await {
            Ok(written) => written,
            // Chunk files vanish when the session is cancelled mid-assembly.
            Err(_) if slot.is_closed() => return Err(UploadError::SessionNotFound(id)),
            Err(err) => return Err(err.into()),
        };
        if written != total_size {
            self.discard(&temp).await;
            return Err(UploadError::SizeMismatch {
                expected: total_size,
                actual: written,
            });
        }

        let record = match self.resolver.resolve(&temp, request).await {
            Ok(record) => record,
            Err(err) => {
                self.discard(&temp).await;
                return Err(err);
            }
        };

        if !self.sessions.mark_completed(&slot, &record).await {
            // Cancelled or reaped while we were assembling.
            warn!(
                session_id = %id,
                file_id = %record.id,
                "session closed during assembly, dropping file"
            );
            if let Err(err) = self.records.soft_delete(record.id, self.clock.now()).await {
                warn!(file_id = %record.id, error = %err, "failed to drop orphaned file");
            }
            return Err(UploadError::SessionNotFound(id));
        }
        self.sessions.release_chunks(id).await;

        info!(
            session_id = %id,
            file_id = %record.id,
            size = record.file_size,
            "Assembled chunked upload"
        );
        Ok(record)
    }

    /// All chunk files back to back, read one at a time.
    fn chunk_stream(&self, paths: Vec<PathBuf>) -> ByteStream<'static> {
        let fs = self.fs.clone();
        stream::iter(paths)
            .then(move |path| {
                let fs = fs.clone();
                async move { fs.read(&path).await }
            })
            .map_ok(ReaderStream::new)
            .try_flatten()
            .boxed()
    }

    async fn discard(&self, temp: &std::path::Path) {
        if let Err(err) = self.fs.delete(temp).await {
            warn!(path = %temp.display(), error = %err, "failed to delete assembly file");
        }
    }
}
