//! Background cleanup: expired sessions, orphaned chunk directories and
//! soft-deleted files past their grace period.

use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    clock::Clock,
    dedup::{DedupResolver, PurgeReport},
    sessions::{SessionManager, SessionSweep},
};

/// What one pass of the reaper did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: SessionSweep,
    pub files: PurgeReport,
}

#[derive(Clone)]
pub struct Reaper {
    sessions: SessionManager,
    resolver: DedupResolver,
    clock: Arc<dyn Clock>,
    grace: Duration,
    interval: std::time::Duration,
}

impl Reaper {
    pub fn new(sessions: SessionManager, resolver: DedupResolver, clock: Arc<dyn Clock>) -> Self {
        let settings = sessions.settings();
        let grace = settings.deleted_file_grace;
        let interval = settings.reaper_interval;
        Self {
            sessions,
            resolver,
            clock,
            grace,
            interval,
        }
    }

    /// Run one sweep. Failures are counted, never propagated.
    pub async fn run_once(&self) -> SweepReport {
        let sessions = self.sessions.expire_stale().await;
        let cutoff = self.clock.now() - self.grace;
        let files = match self.resolver.purge_deleted(cutoff).await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "failed to list deleted files");
                PurgeReport {
                    failures: 1,
                    ..Default::default()
                }
            }
        };

        if files.files_purged > 0 {
            info!(
                purged = files.files_purged,
                blobs_removed = files.blobs_removed,
                "Purged deleted files"
            );
        }
        SweepReport { sessions, files }
    }

    /// Sweep every interval until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let report = self.run_once().await;
                        debug!(?report, "reaper pass finished");
                    }
                }
            }
            info!("Reaper stopped");
        })
    }
}
