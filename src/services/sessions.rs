//! Upload Session Manager
//!
//! Owns the table of in-flight chunked uploads:
//! - sessions are held in memory, one async mutex per session
//! - chunk bytes land in `temp_dir/sessions/{id}/`, one file per index
//! - expired sessions are purged lazily on access and by the reaper
//!
//! The table lives as long as the owning service; nothing survives a restart.

use chrono::Duration;
use dashmap::DashMap;
use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    clock::Clock,
    fs::{ByteStream, FileSystem, limit_stream},
};
use crate::{
    config::UploadSettings,
    errors::{UploadError, UploadResult},
    models::{
        ChunkAck, ChunkRecord, FileRecord, InitUpload, SessionDescriptor, SessionStatus,
        UploadSession, session::chunk_count,
    },
};

/// One session plus the locks guarding it.
pub struct SessionSlot {
    /// Session state. Held only for short critical sections, never across disk I/O.
    session: Mutex<UploadSession>,
    /// Serializes assembly of this session.
    assembly: Mutex<()>,
    /// Set once the session left the table; late writers must back off.
    closed: AtomicBool,
}

impl SessionSlot {
    fn new(session: UploadSession) -> Self {
        Self {
            session: Mutex::new(session),
            assembly: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn session(&self) -> MutexGuard<'_, UploadSession> {
        self.session.lock().await
    }

    pub async fn lock_assembly(&self) -> MutexGuard<'_, ()> {
        self.assembly.lock().await
    }

    /// True while an assembly holds this session.
    pub fn is_assembling(&self) -> bool {
        self.assembly.try_lock().is_err()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Outcome of one expiry sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionSweep {
    pub expired: usize,
    /// Chunk directories with no session behind them.
    pub orphans_removed: usize,
    pub failures: usize,
}

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    /// Active sessions indexed by ID
    sessions: DashMap<Uuid, Arc<SessionSlot>>,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    settings: UploadSettings,
}

enum Recorded {
    Ack(ChunkAck, Option<ChunkRecord>),
    Closed,
    Completed,
    Assembling,
}

impl SessionManager {
    pub fn new(fs: Arc<dyn FileSystem>, clock: Arc<dyn Clock>, settings: UploadSettings) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                sessions: DashMap::new(),
                fs,
                clock,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.inner.settings
    }

    /// Directory holding the chunk files of one session.
    pub fn session_dir(&self, id: Uuid) -> PathBuf {
        self.sessions_root().join(id.to_string())
    }

    fn sessions_root(&self) -> PathBuf {
        self.inner.settings.temp_dir.join("sessions")
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Open a new chunked upload.
    pub async fn init(&self, request: InitUpload) -> UploadResult<SessionDescriptor> {
        let settings = &self.inner.settings;
        let total_size = request.total_size;
        if total_size == 0 {
            return Err(UploadError::invalid_size(0, "total size must be positive"));
        }
        if total_size > settings.max_file_size {
            return Err(UploadError::invalid_size(
                total_size,
                format!("exceeds the maximum of {} bytes", settings.max_file_size),
            ));
        }

        let chunk_size = request.chunk_size.unwrap_or(settings.chunk_size);
        if chunk_size == 0 {
            return Err(UploadError::invalid_size(0, "chunk size must be positive"));
        }
        let total_chunks = chunk_count(total_size, chunk_size)
            .filter(|count| *count <= settings.max_chunks)
            .ok_or_else(|| {
                UploadError::invalid_size(
                    total_size,
                    format!(
                        "needs more than {} chunks of {chunk_size} bytes",
                        settings.max_chunks
                    ),
                )
            })?;

        let session = UploadSession::new(
            request.meta,
            total_size,
            chunk_size,
            total_chunks,
            self.inner.clock.now(),
            settings.session_timeout,
        );
        let descriptor = SessionDescriptor {
            session_id: session.id,
            chunk_size,
            total_chunks,
            expires_at: session.expires_at,
            max_concurrent_chunks: settings.max_concurrent_chunks,
        };

        info!(
            session_id = %session.id,
            file_name = %session.original_filename,
            total_size,
            total_chunks,
            "Created upload session"
        );
        self.inner
            .sessions
            .insert(session.id, Arc::new(SessionSlot::new(session)));

        Ok(descriptor)
    }

    /// Store one chunk.
    ///
    /// The body is streamed to a fresh file; nothing is recorded unless the
    /// whole body arrived and matches `declared_size`. A second upload of the
    /// same index replaces the first.
    pub async fn put_chunk(
        &self,
        id: Uuid,
        index: u32,
        stream: ByteStream<'_>,
        declared_size: u64,
    ) -> UploadResult<ChunkAck> {
        let slot = self.live_slot(id).await?;
        let chunk_size = {
            let session = slot.session().await;
            if session.completed {
                return Err(UploadError::SessionCompleted(id));
            }
            if slot.is_assembling() {
                return Err(UploadError::AssemblyInProgress(id));
            }
            if index >= session.total_chunks {
                return Err(UploadError::ChunkIndexOutOfRange {
                    index,
                    total: session.total_chunks,
                });
            }
            session.chunk_size
        };
        if declared_size == 0 {
            return Err(UploadError::invalid_size(0, "chunk must not be empty"));
        }
        if declared_size > chunk_size {
            return Err(UploadError::invalid_size(
                declared_size,
                format!("chunk exceeds the session chunk size of {chunk_size} bytes"),
            ));
        }

        let path = self
            .session_dir(id)
            .join(format!("{index:08}-{}.chunk", Uuid::new_v4().simple()));
        let (limited, seen) = limit_stream(stream, declared_size);
        let written = match self.inner.fs.write_stream(&path, limited).await {
            Ok(written) => written,
            Err(_) if seen.load(Ordering::Relaxed) > declared_size => {
                return Err(UploadError::SizeMismatch {
                    expected: declared_size,
                    actual: seen.load(Ordering::Relaxed),
                });
            }
            Err(err) => return Err(err.into()),
        };
        if written != declared_size {
            self.discard(&path).await;
            return Err(UploadError::SizeMismatch {
                expected: declared_size,
                actual: written,
            });
        }

        let recorded = {
            let mut session = slot.session().await;
            if slot.is_closed() {
                Recorded::Closed
            } else if session.completed {
                Recorded::Completed
            } else if slot.is_assembling() {
                // The assembler already took its copy of the chunk map.
                Recorded::Assembling
            } else {
                let replaced = session.chunks.insert(
                    index,
                    ChunkRecord {
                        index,
                        size: written,
                        path: path.clone(),
                        uploaded_at: self.inner.clock.now(),
                    },
                );
                let ack = ChunkAck {
                    chunk_index: index,
                    progress: session.progress(),
                    uploaded_chunks: session.uploaded_count(),
                    total_chunks: session.total_chunks,
                    is_now_complete: session.has_all_chunks(),
                };
                Recorded::Ack(ack, replaced)
            }
        };

        match recorded {
            Recorded::Ack(ack, replaced) => {
                if let Some(old) = replaced {
                    debug!(session_id = %id, chunk_index = index, "replaced chunk");
                    self.discard(&old.path).await;
                }
                debug!(
                    session_id = %id,
                    chunk_index = index,
                    size = written,
                    uploaded = ack.uploaded_chunks,
                    total = ack.total_chunks,
                    "stored chunk"
                );
                Ok(ack)
            }
            Recorded::Closed => {
                self.discard(&path).await;
                if let Err(err) = self.inner.fs.delete_dir(&self.session_dir(id)).await {
                    warn!(session_id = %id, error = %err, "failed to remove chunk directory");
                }
                Err(UploadError::SessionNotFound(id))
            }
            Recorded::Completed => {
                self.discard(&path).await;
                Err(UploadError::SessionCompleted(id))
            }
            Recorded::Assembling => {
                self.discard(&path).await;
                Err(UploadError::AssemblyInProgress(id))
            }
        }
    }

    /// Progress of a session.
    pub async fn status(&self, id: Uuid) -> UploadResult<SessionStatus> {
        let slot = self.live_slot(id).await?;
        let session = slot.session().await;
        Ok(session.status())
    }

    /// Drop a session and its chunk files. Returns false if it did not exist
    /// (or had already expired).
    pub async fn cancel(&self, id: Uuid) -> bool {
        let Some((_, slot)) = self.inner.sessions.remove(&id) else {
            return false;
        };
        slot.close();
        let expired = slot.session().await.is_expired(self.inner.clock.now());

        if let Err(err) = self.inner.fs.delete_dir(&self.session_dir(id)).await {
            warn!(session_id = %id, error = %err, "failed to remove chunk directory");
        }
        if expired {
            debug!(session_id = %id, "cancel hit an expired session");
            return false;
        }

        info!(session_id = %id, "Upload session cancelled");
        true
    }

    /// Look up a session that is neither expired nor closed.
    ///
    /// An expired session is purged here and reported as not found.
    pub async fn live_slot(&self, id: Uuid) -> UploadResult<Arc<SessionSlot>> {
        let slot = self
            .inner
            .sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(UploadError::SessionNotFound(id))?;

        let expired = slot.session().await.is_expired(self.inner.clock.now());
        if expired {
            if let Err(err) = self.purge(id, &slot).await {
                warn!(session_id = %id, error = %err, "failed to purge expired session");
            }
            debug!(session_id = %id, "session expired on access");
            return Err(UploadError::SessionNotFound(id));
        }
        if slot.is_closed() {
            return Err(UploadError::SessionNotFound(id));
        }
        Ok(slot)
    }

    /// Record a successful assembly. The session stays queryable for the
    /// completed-retention window. Returns false if the session was closed
    /// in the meantime.
    pub async fn mark_completed(&self, slot: &SessionSlot, record: &FileRecord) -> bool {
        let mut session = slot.session().await;
        if slot.is_closed() {
            return false;
        }
        session.completed = true;
        session.file_record = Some(record.clone());
        session.expires_at = self.inner.clock.now() + self.completed_retention();
        true
    }

    fn completed_retention(&self) -> Duration {
        self.inner.settings.completed_retention
    }

    /// Delete the chunk files of a session, keeping the session itself.
    pub async fn release_chunks(&self, id: Uuid) {
        if let Err(err) = self.inner.fs.delete_dir(&self.session_dir(id)).await {
            warn!(session_id = %id, error = %err, "failed to remove chunk directory");
        }
    }

    async fn purge(&self, id: Uuid, slot: &Arc<SessionSlot>) -> io::Result<()> {
        self.inner
            .sessions
            .remove_if(&id, |_, current| Arc::ptr_eq(current, slot));
        slot.close();
        self.inner.fs.delete_dir(&self.session_dir(id)).await
    }

    async fn discard(&self, path: &std::path::Path) {
        if let Err(err) = self.inner.fs.delete(path).await {
            warn!(path = %path.display(), error = %err, "failed to delete chunk file");
        }
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Purge every session past its expiry, completed or not, then remove
    /// chunk directories that no session owns. Individual failures are
    /// logged and counted; the sweep always visits every session.
    pub async fn expire_stale(&self) -> SessionSweep {
        let now = self.inner.clock.now();
        let mut sweep = SessionSweep::default();

        let slots: Vec<(Uuid, Arc<SessionSlot>)> = self
            .inner
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (id, slot) in slots {
            let expired = slot.session().await.is_expired(now);
            if !expired {
                continue;
            }
            match self.purge(id, &slot).await {
                Ok(()) => {
                    sweep.expired += 1;
                    debug!(session_id = %id, "Cleaned up expired session");
                }
                Err(err) => {
                    sweep.failures += 1;
                    warn!(session_id = %id, error = %err, "failed to clean up expired session");
                }
            }
        }

        match self.inner.fs.list_dir(&self.sessions_root()).await {
            Ok(dirs) => {
                for dir in dirs {
                    let owned = dir
                        .file_name()
                        .and_then(|name| name.to_str())
                        .and_then(|name| Uuid::parse_str(name).ok())
                        .is_some_and(|id| self.inner.sessions.contains_key(&id));
                    if owned {
                        continue;
                    }
                    match self.inner.fs.delete_dir(&dir).await {
                        Ok(()) => sweep.orphans_removed += 1,
                        Err(err) => {
                            sweep.failures += 1;
                            warn!(
                                path = %dir.display(),
                                error = %err,
                                "failed to remove orphaned chunks"
                            );
                        }
                    }
                }
            }
            Err(err) => {
                sweep.failures += 1;
                warn!(error = %err, "failed to scan session directories");
            }
        }

        if sweep.expired > 0 || sweep.orphans_removed > 0 {
            info!(
                expired = sweep.expired,
                orphans = sweep.orphans_removed,
                "Cleaned up expired upload sessions"
            );
        }
        sweep
    }
}

// ============================================================================
// Tests
// ============================================================================
