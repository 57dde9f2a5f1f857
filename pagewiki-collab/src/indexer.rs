//! Keeps search blocks in step with the latest snapshot of each page.
//!
//! Runs on its own schedule and also reacts to triggers sent by the snapshot
//! worker. Extraction is a pure function of the snapshot state, so a page is
//! only re-indexed when its latest snapshot version is newer than the one
//! its current block set came from.

use std::sync::Arc;
use std::time::Duration;

use pagewiki_types::PageId;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::MergeEngine;
use crate::error::Result;
use crate::store::{SearchIndex, SnapshotStore};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexReport {
    /// Pages re-indexed, with the snapshot version the blocks came from.
    pub indexed: Vec<(PageId, u64)>,
    pub failed: Vec<PageId>,
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed { version: u64, blocks: usize },
    UpToDate,
    Cancelled,
}

pub struct IndexingWorker {
    snapshots: Arc<dyn SnapshotStore>,
    index: Arc<dyn SearchIndex>,
    engine: Arc<dyn MergeEngine>,
    interval: Duration,
    triggers: Option<mpsc::Receiver<PageId>>,
}

impl IndexingWorker {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        index: Arc<dyn SearchIndex>,
        engine: Arc<dyn MergeEngine>,
        interval: Duration,
    ) -> Self {
        Self {
            snapshots,
            index,
            engine,
            interval,
            triggers: None,
        }
    }

    pub fn with_triggers(mut self, rx: mpsc::Receiver<PageId>) -> Self {
        self.triggers = Some(rx);
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "indexing worker started");
        let mut triggers = self.triggers.take();
        let mut triggers_open = triggers.is_some();
        let mut tick = interval_at(Instant::now() + self.interval, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                page = next_trigger(&mut triggers), if triggers_open => match page {
                    Some(page) => {
                        if let Err(err) = self.index_page(&page, &cancel).await {
                            warn!(%page, error = %err, "triggered indexing failed");
                        }
                    }
                    None => triggers_open = false,
                },
                _ = tick.tick() => {
                    let report = self.run_pass(&cancel).await;
                    if !report.indexed.is_empty() || !report.failed.is_empty() {
                        info!(
                            indexed = report.indexed.len(),
                            failed = report.failed.len(),
                            skipped = report.skipped,
                            "index pass finished"
                        );
                    }
                }
            }
        }
        info!("indexing worker stopped");
    }

    /// Re-index every page whose search blocks lag its latest snapshot.
    #[instrument(skip_all, name = "index_pass")]
    pub async fn run_pass(&self, cancel: &CancellationToken) -> IndexReport {
        let mut report = IndexReport::default();
        let heads = match self.snapshots.snapshot_heads().await {
            Ok(heads) => heads,
            Err(err) => {
                warn!(error = %err, "could not list snapshotted pages");
                return report;
            }
        };

        for (page, _) in heads {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.index_page(&page, cancel).await {
                Ok(IndexOutcome::Indexed { version, .. }) => report.indexed.push((page, version)),
                Ok(IndexOutcome::UpToDate) => report.skipped += 1,
                Ok(IndexOutcome::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(err) => {
                    warn!(%page, error = %err, kind = err.kind(), "indexing failed");
                    report.failed.push(page);
                }
            }
        }
        report
    }

    pub async fn index_page(&self, page: &PageId, cancel: &CancellationToken) -> Result<IndexOutcome> {
        let Some(snapshot) = self.snapshots.latest(page).await? else {
            return Ok(IndexOutcome::UpToDate);
        };
        if self
            .index
            .indexed_version(page)
            .await?
            .is_some_and(|v| v >= snapshot.version)
        {
            return Ok(IndexOutcome::UpToDate);
        }

        let blocks = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(IndexOutcome::Cancelled),
            blocks = self.engine.extract_blocks(&snapshot.state) => blocks?,
        };
        self.index
            .replace_blocks(page, snapshot.version, &blocks)
            .await?;
        debug!(%page, version = snapshot.version, blocks = blocks.len(), "page indexed");
        Ok(IndexOutcome::Indexed {
            version: snapshot.version,
            blocks: blocks.len(),
        })
    }
}

async fn next_trigger(rx: &mut Option<mpsc::Receiver<PageId>>) -> Option<PageId> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
