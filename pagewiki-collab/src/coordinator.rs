//! Per-page authority for ordering, persisting and relaying edits.
//!
//! Each page has one async lock. Sequence assignment, the durable append and
//! the broadcast all happen while holding it, so the log order of a page is
//! exactly the order in which its room sees the updates. Joins and resyncs
//! take the same lock, which keeps a join-state and the live stream that
//! follows it from overlapping or leaving a gap.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use pagewiki_types::{PageId, SessionId, UpdateRecord, UserId};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::engine::{self, Materialized, MergeEngine};
use crate::error::Result;
use crate::manager::{Delivery, ManagerHandle, Registration, SessionHandle};
use crate::protocol::ServerFrame;
use crate::store::{SnapshotStore, StoreError, UpdateLog};

const MATERIALIZE_ATTEMPTS: usize = 3;

#[derive(Debug, Default)]
struct PageCursor {
    /// Next sequence to assign. `None` until recovered from the stores.
    next_seq: Option<u64>,
}

pub struct DocumentCoordinator {
    log: Arc<dyn UpdateLog>,
    snapshots: Arc<dyn SnapshotStore>,
    engine: Arc<dyn MergeEngine>,
    manager: ManagerHandle,
    pages: parking_lot::Mutex<HashMap<PageId, Arc<AsyncMutex<PageCursor>>>>,
}

impl DocumentCoordinator {
    pub fn new(
        log: Arc<dyn UpdateLog>,
        snapshots: Arc<dyn SnapshotStore>,
        engine: Arc<dyn MergeEngine>,
        manager: ManagerHandle,
    ) -> Self {
        Self {
            log,
            snapshots,
            engine,
            manager,
            pages: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &ManagerHandle {
        &self.manager
    }

    fn page(&self, page: &PageId) -> Arc<AsyncMutex<PageCursor>> {
        self.pages.lock().entry(page.clone()).or_default().clone()
    }

    /// Number of pages with a cached cursor.
    pub fn tracked_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// Forget a page's cursor once its room is empty and no operation holds
    /// it. The next join or submit recovers the sequence from the stores.
    pub async fn release(&self, page: &PageId) -> Result<bool> {
        if self.manager.room_size(page).await? > 0 {
            return Ok(false);
        }
        // Every clone is taken under this lock, so a count of one means idle.
        let mut pages = self.pages.lock();
        match pages.get(page) {
            Some(cursor) if Arc::strong_count(cursor) == 1 => {
                pages.remove(page);
                debug!(%page, "page cursor released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Send the current join-state to a new session, then attach it to the
    /// room. Returns the sequence the join-state covers.
    pub async fn join(&self, handle: SessionHandle) -> Result<u64> {
        let page = handle.room.clone();
        let cursor = self.page(&page);
        let _guard = cursor.lock().await;

        let Materialized { state, covered_seq } = self.materialize(&page).await?;
        // The queue is fresh, so this cannot be dropped.
        if handle.try_deliver(Arc::new(ServerFrame::JoinState {
            state,
            seq: covered_seq,
        })) != Delivery::Delivered
        {
            warn!(session = %handle.id, %page, "join-state not queued");
        }

        let session = handle.id;
        if self.manager.register(handle).await? == Registration::AlreadyRegistered {
            warn!(%session, %page, "join for a session that is already live");
        }
        debug!(%session, %page, seq = covered_seq, "session joined");
        Ok(covered_seq)
    }

    /// Order, persist and relay one fragment. The returned sequence is only
    /// produced once the record is durable.
    pub async fn submit(
        &self,
        page: &PageId,
        session: SessionId,
        author: &UserId,
        fragment: Vec<u8>,
    ) -> Result<u64> {
        let cursor = self.page(page);
        let mut cursor = cursor.lock().await;

        let seq = match cursor.next_seq {
            Some(seq) => seq,
            None => self.recover_next_seq(page).await?,
        };
        let record = UpdateRecord {
            page_id: page.clone(),
            seq,
            author: author.clone(),
            fragment,
            created_at: Utc::now(),
        };

        if let Err(err) = self.log.append(&record).await {
            // Re-read the head next time rather than trusting the cache.
            cursor.next_seq = None;
            warn!(%page, seq, %session, error = %err, "append failed");
            return Err(err.into());
        }
        cursor.next_seq = Some(seq + 1);

        let frame = ServerFrame::Update {
            seq,
            author: record.author,
            fragment: record.fragment,
        };
        match self.manager.broadcast(page, frame, Some(session)).await {
            Ok(report) => debug!(
                %page,
                seq,
                delivered = report.delivered,
                dropped = report.dropped,
                "update relayed"
            ),
            Err(err) => warn!(%page, seq, error = %err, "update persisted but not relayed"),
        }
        Ok(seq)
    }

    /// Recompute the join-state and queue it for an already-live session.
    pub async fn resync(&self, page: &PageId, session: SessionId) -> Result<u64> {
        let cursor = self.page(page);
        let _guard = cursor.lock().await;

        let Materialized { state, covered_seq } = self.materialize(page).await?;
        let delivery = self
            .manager
            .send_to(
                session,
                ServerFrame::JoinState {
                    state,
                    seq: covered_seq,
                },
            )
            .await?;
        debug!(%page, %session, seq = covered_seq, ?delivery, "resync");
        Ok(covered_seq)
    }

    /// Latest snapshot merged with every update recorded after it.
    pub async fn materialize(&self, page: &PageId) -> Result<Materialized> {
        for _ in 0..MATERIALIZE_ATTEMPTS {
            let base = self.snapshots.latest(page).await?;
            let after = base.as_ref().map_or(0, |s| s.covered_seq);
            let tail = self.log.updates_after(page, after).await?;

            // Retention may prune the tail between the two reads; a newer
            // snapshot then covers what went missing.
            let current = self.snapshots.latest(page).await?.map(|s| s.version);
            if current == base.as_ref().map(|s| s.version) {
                return Ok(engine::materialize(self.engine.as_ref(), base.as_ref(), &tail).await?);
            }
            debug!(%page, "snapshot advanced during read, retrying");
        }
        Err(StoreError::Contended(page.to_string()).into())
    }

    async fn recover_next_seq(&self, page: &PageId) -> Result<u64> {
        let last = self.log.last_seq(page).await?.unwrap_or(0);
        let covered = self
            .snapshots
            .latest(page)
            .await?
            .map_or(0, |s| s.covered_seq);
        Ok(last.max(covered) + 1)
    }
}
