//! Periodic compaction of update logs into snapshots.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pagewiki_types::{PageId, Snapshot};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::{self, MergeEngine};
use crate::error::Result;
use crate::retention::RetentionPolicy;
use crate::store::{SnapshotStore, UpdateLog};

/// Summary of one pass over every page with history.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Pages that got a new snapshot, with the version written.
    pub snapshotted: Vec<(PageId, u64)>,
    pub failed: Vec<PageId>,
    /// Pages whose latest snapshot already covers their log.
    pub skipped: usize,
    pub cancelled: bool,
}

enum Outcome {
    Written(u64),
    UpToDate,
    Cancelled,
}

pub struct SnapshotWorker {
    log: Arc<dyn UpdateLog>,
    snapshots: Arc<dyn SnapshotStore>,
    engine: Arc<dyn MergeEngine>,
    interval: Duration,
    retention: RetentionPolicy,
    index_tx: Option<mpsc::Sender<PageId>>,
}

impl SnapshotWorker {
    pub fn new(
        log: Arc<dyn UpdateLog>,
        snapshots: Arc<dyn SnapshotStore>,
        engine: Arc<dyn MergeEngine>,
        interval: Duration,
    ) -> Self {
        Self {
            log,
            snapshots,
            engine,
            interval,
            retention: RetentionPolicy::default(),
            index_tx: None,
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Notify the indexing worker after each snapshot written.
    pub fn with_index_trigger(mut self, tx: mpsc::Sender<PageId>) -> Self {
        self.index_tx = Some(tx);
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, retention = ?self.retention, "snapshot worker started");
        let mut tick = interval_at(Instant::now() + self.interval, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let report = self.run_pass(&cancel).await;
                    if !report.snapshotted.is_empty() || !report.failed.is_empty() {
                        info!(
                            written = report.snapshotted.len(),
                            failed = report.failed.len(),
                            skipped = report.skipped,
                            "snapshot pass finished"
                        );
                    }
                }
            }
        }
        info!("snapshot worker stopped");
    }

    /// Snapshot every page whose log grew since its latest snapshot. A page
    /// that fails is logged and left for the next pass.
    #[instrument(skip_all, name = "snapshot_pass")]
    pub async fn run_pass(&self, cancel: &CancellationToken) -> PassReport {
        let mut report = PassReport::default();
        let heads = match self.log.page_heads().await {
            Ok(heads) => heads,
            Err(err) => {
                warn!(error = %err, "could not list pages");
                return report;
            }
        };

        for (page, head) in heads {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.compact_page(&page, head, cancel).await {
                Ok(Outcome::Written(version)) => report.snapshotted.push((page, version)),
                Ok(Outcome::UpToDate) => report.skipped += 1,
                Ok(Outcome::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(err) => {
                    warn!(%page, error = %err, kind = err.kind(), "snapshot failed");
                    report.failed.push(page);
                }
            }
        }
        report
    }

    async fn compact_page(
        &self,
        page: &PageId,
        head: u64,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let base = self.snapshots.latest(page).await?;
        let covered = base.as_ref().map_or(0, |s| s.covered_seq);
        if head <= covered {
            return Ok(Outcome::UpToDate);
        }

        let tail = self.log.updates_after(page, covered).await?;
        let merged = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
            merged = engine::materialize(self.engine.as_ref(), base.as_ref(), &tail) => merged?,
        };

        let version = base.as_ref().map_or(1, |s| s.version + 1);
        let snapshot = Snapshot {
            page_id: page.clone(),
            version,
            covered_seq: merged.covered_seq,
            state: merged.state,
            created_at: Utc::now(),
        };
        self.snapshots.insert(&snapshot).await?;
        info!(%page, version, covered_seq = snapshot.covered_seq, "snapshot written");

        match self
            .retention
            .apply(page, self.log.as_ref(), self.snapshots.as_ref())
            .await
        {
            Ok(Some(pruned)) => debug!(
                %page,
                through_seq = pruned.through_seq,
                records = pruned.records,
                "history pruned"
            ),
            Ok(None) => {}
            Err(err) => warn!(%page, error = %err, "retention failed"),
        }

        if let Some(tx) = &self.index_tx {
            if tx.try_send(page.clone()).is_err() {
                debug!(%page, "index trigger not queued");
            }
        }
        Ok(Outcome::Written(version))
    }
}
