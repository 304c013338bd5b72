//! UploadService: the facade the HTTP edge talks to.
//!
//! Wires the session manager, the assembler and the dedup resolver together
//! and adds the file-level operations (whole uploads, reads, deletes,
//! moderation, listing).

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    sync::{Arc, atomic::Ordering},
};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    assembly::Assembler,
    blob_store::BlobStore,
    clock::{Clock, SystemClock},
    dedup::{ContentTransform, DedupResolver, ResolveRequest},
    fs::{BoxReader, ByteStream, FileSystem, LocalFs, bytes_stream, limit_stream},
    reaper::Reaper,
    records::{FileRecordStore, SqliteFileRecords},
    sessions::SessionManager,
};
use crate::{
    config::UploadSettings,
    errors::{UploadError, UploadResult},
    models::{
        ChunkAck, FilePage, FileRecord, InitUpload, SessionDescriptor, SessionStatus, UploadMeta,
    },
};

const MAX_PAGE_SIZE: usize = 1000;

#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite pool, also used by the readiness check.
    pub db: Arc<SqlitePool>,
    settings: Arc<UploadSettings>,
    sessions: SessionManager,
    assembler: Assembler,
    resolver: DedupResolver,
    records: Arc<dyn FileRecordStore>,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
}

impl UploadService {
    /// Service on the local disk and the wall clock.
    pub fn new(db: Arc<SqlitePool>, settings: UploadSettings) -> Self {
        Self::with_clock(db, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: Arc<SqlitePool>,
        settings: UploadSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFs);
        let records: Arc<dyn FileRecordStore> = Arc::new(SqliteFileRecords::new(db.clone()));
        let blobs = BlobStore::new(&settings.blob_dir, fs.clone());
        let resolver = DedupResolver::new(
            records.clone(),
            blobs,
            fs.clone(),
            clock.clone(),
            &settings,
        );
        let sessions = SessionManager::new(fs.clone(), clock.clone(), settings.clone());
        let assembler = Assembler::new(
            sessions.clone(),
            resolver.clone(),
            records.clone(),
            fs.clone(),
            clock.clone(),
        );

        Self {
            db,
            settings: Arc::new(settings),
            sessions,
            assembler,
            resolver,
            records,
            fs,
            clock,
        }
    }

    /// Register a content transform for newly stored blobs.
    pub fn with_transform(mut self, transform: Arc<dyn ContentTransform>) -> Self {
        self.resolver = self.resolver.with_transform(transform);
        self.assembler = Assembler::new(
            self.sessions.clone(),
            self.resolver.clone(),
            self.records.clone(),
            self.fs.clone(),
            self.clock.clone(),
        );
        self
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    // ========================================================================
    // Chunked uploads
    // ========================================================================

    pub async fn init_upload(&self, request: InitUpload) -> UploadResult<SessionDescriptor> {
        self.sessions.init(request).await
    }

    /// Store one chunk. When it completes the set and auto-completion is on,
    /// assembly starts in the background.
    pub async fn upload_chunk(
        &self,
        session_id: Uuid,
        index: u32,
        body: ByteStream<'_>,
        declared_size: u64,
    ) -> UploadResult<ChunkAck> {
        let ack = self
            .sessions
            .put_chunk(session_id, index, body, declared_size)
            .await?;

        if ack.is_now_complete && self.settings.auto_complete {
            let assembler = self.assembler.clone();
            tokio::spawn(async move {
                match assembler.assemble(session_id).await {
                    Ok(record) => {
                        debug!(
                            session_id = %session_id,
                            file_id = %record.id,
                            "auto-completed upload"
                        )
                    }
                    Err(err) => {
                        warn!(session_id = %session_id, error = %err, "background assembly failed")
                    }
                }
            });
        }
        Ok(ack)
    }

    pub async fn get_status(&self, session_id: Uuid) -> UploadResult<SessionStatus> {
        self.sessions.status(session_id).await
    }

    pub async fn complete_upload(&self, session_id: Uuid) -> UploadResult<FileRecord> {
        self.assembler.assemble(session_id).await
    }

    pub async fn cancel_upload(&self, session_id: Uuid) -> bool {
        self.sessions.cancel(session_id).await
    }

    // ========================================================================
    // Whole-file uploads
    // ========================================================================

    /// Store a complete file from a single stream.
    pub async fn upload_whole(
        &self,
        body: ByteStream<'_>,
        meta: UploadMeta,
    ) -> UploadResult<FileRecord> {
        let max = self.settings.max_file_size;
        let temp = self
            .settings
            .temp_dir
            .join("incoming")
            .join(format!("{}.part", Uuid::new_v4().simple()));

        let (limited, seen) = limit_stream(body, max);
        let written = match self.fs.write_stream(&temp, limited).await {
            Ok(written) => written,
            Err(_) if seen.load(Ordering::Relaxed) > max => {
                return Err(UploadError::invalid_size(
                    seen.load(Ordering::Relaxed),
                    format!("exceeds the maximum of {max} bytes"),
                ));
            }
            Err(err) => return Err(err.into()),
        };
        if written == 0 {
            if let Err(err) = self.fs.delete(&temp).await {
                warn!(path = %temp.display(), error = %err, "failed to delete empty upload");
            }
            return Err(UploadError::invalid_size(0, "file must not be empty"));
        }

        let request = ResolveRequest {
            original_filename: meta.original_filename,
            mime_type: meta.mime_type,
            declared_size: written,
            context: meta.context,
            uploader: meta.uploader,
            source: meta.source.unwrap_or_else(|| "direct".to_string()),
            metadata: meta.metadata,
        };
        match self.resolver.resolve(&temp, request).await {
            Ok(record) => Ok(record),
            Err(err) => {
                if let Err(cleanup) = self.fs.delete(&temp).await {
                    warn!(path = %temp.display(), error = %cleanup, "failed to delete upload");
                }
                Err(err)
            }
        }
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// A live (not deleted) file record.
    pub async fn get_file(&self, id: Uuid) -> UploadResult<FileRecord> {
        match self.records.get(id).await? {
            Some(record) if !record.is_deleted() => Ok(record),
            _ => Err(UploadError::FileNotFound(id)),
        }
    }

    /// Open a file for reading and count the access.
    pub async fn open_file(&self, id: Uuid) -> UploadResult<(FileRecord, BoxReader)> {
        let record = self.get_file(id).await?;
        if record.is_suspended {
            return Err(UploadError::FileSuspended {
                id,
                reason: record.suspension_reason.clone().unwrap_or_default(),
            });
        }

        let reader = match self.fs.read(std::path::Path::new(&record.storage_path)).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(file_id = %id, path = %record.storage_path, "blob missing on read");
                return Err(UploadError::FileNotFound(id));
            }
            Err(err) => return Err(err.into()),
        };
        self.records.record_access(id, self.clock.now()).await?;
        Ok((record, reader))
    }

    /// Soft-delete a file. The blob is reclaimed by the reaper once the
    /// grace period passed and nothing else references it.
    pub async fn delete_file(&self, id: Uuid) -> UploadResult<()> {
        if !self.records.soft_delete(id, self.clock.now()).await? {
            return Err(UploadError::FileNotFound(id));
        }
        info!(file_id = %id, "File deleted");
        Ok(())
    }

    pub async fn suspend_file(&self, id: Uuid, reason: &str) -> UploadResult<()> {
        if !self.records.set_suspension(id, Some(reason)).await? {
            return Err(UploadError::FileNotFound(id));
        }
        info!(file_id = %id, reason, "File suspended");
        Ok(())
    }

    pub async fn unsuspend_file(&self, id: Uuid) -> UploadResult<()> {
        if !self.records.set_suspension(id, None).await? {
            return Err(UploadError::FileNotFound(id));
        }
        info!(file_id = %id, "File unsuspended");
        Ok(())
    }

    /// One page of live files in `context`, ordered by id.
    ///
    /// `cursor` is the opaque value returned as `next_cursor` by the
    /// previous page. An unreadable cursor is rejected as `InvalidCursor`.
    pub async fn list_files(
        &self,
        context: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> UploadResult<FilePage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let after = cursor.map(decode_cursor).transpose()?;

        let mut files = self
            .records
            .list_by_context(context, after, limit + 1)
            .await?;
        let next_cursor = if files.len() > limit {
            files.truncate(limit);
            files.last().map(|last| encode_cursor(last.id))
        } else {
            None
        };
        Ok(FilePage { files, next_cursor })
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    pub async fn check_database(&self) -> Result<(), sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
            .map(|_| ())
    }

    /// Round-trip a marker file through the temp dir, where every upload lands first.
    pub async fn check_storage(&self) -> io::Result<()> {
        const MARKER: &[u8] = b"readyz";
        let marker = self
            .settings
            .temp_dir
            .join(format!(".readyz-{}", Uuid::new_v4().simple()));

        self.fs.write_stream(&marker, bytes_stream(MARKER)).await?;
        let mut read_back = Vec::new();
        let read = match self.fs.read(&marker).await {
            Ok(mut reader) => reader.read_to_end(&mut read_back).await.map(|_| ()),
            Err(err) => Err(err),
        };
        self.fs.delete(&marker).await?;
        read?;
        if read_back != MARKER {
            return Err(io::Error::new(ErrorKind::InvalidData, "readiness marker mismatch"));
        }
        Ok(())
    }

    // ========================================================================
    // Background work
    // ========================================================================

    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.sessions.clone(),
            self.resolver.clone(),
            self.clock.clone(),
        )
    }

    /// Start the periodic reaper; it stops when `shutdown` is cancelled.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        info!(
            interval_secs = self.settings.reaper_interval.as_secs(),
            "Starting reaper"
        );
        self.reaper().spawn(shutdown)
    }
}

fn encode_cursor(id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(id.as_bytes())
}

fn decode_cursor(cursor: &str) -> UploadResult<Uuid> {
    URL_SAFE_NO_PAD
        .decode(cursor)
        .ok()
        .and_then(|bytes| Uuid::from_slice(&bytes).ok())
        .ok_or_else(|| UploadError::InvalidCursor(cursor.to_string()))
}
