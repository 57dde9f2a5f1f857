//! What to delete once a page has been compacted into a snapshot.

use pagewiki_types::PageId;
use serde::Serialize;

use crate::store::{SnapshotStore, StoreResult, UpdateLog};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "keep", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Never delete snapshots or update records.
    #[default]
    KeepAll,
    /// Keep the newest `n` snapshots and drop update records already covered
    /// by the oldest one kept.
    KeepSnapshots(usize),
}

/// What one application of a policy removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pruned {
    pub through_seq: u64,
    pub records: usize,
}

impl RetentionPolicy {
    /// `0` means keep full history.
    pub fn from_keep(keep: usize) -> Self {
        match keep {
            0 => RetentionPolicy::KeepAll,
            n => RetentionPolicy::KeepSnapshots(n),
        }
    }

    pub async fn apply(
        &self,
        page: &PageId,
        log: &dyn UpdateLog,
        snapshots: &dyn SnapshotStore,
    ) -> StoreResult<Option<Pruned>> {
        let RetentionPolicy::KeepSnapshots(keep) = *self else {
            return Ok(None);
        };
        let Some(through_seq) = snapshots.retain_latest(page, keep).await? else {
            return Ok(None);
        };
        let records = log.prune_through(page, through_seq).await?;
        Ok(Some(Pruned {
            through_seq,
            records,
        }))
    }
}
