//! In-process doubles shared by unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pagewiki_types::{ExtractedBlock, PageId, UpdateRecord};
use parking_lot::Mutex;

use crate::engine::{EngineError, MergeEngine};
use crate::store::{StoreError, StoreResult, UpdateLog};

/// Deterministic engine: merging concatenates, extraction emits one
/// paragraph per non-empty line.
#[derive(Default)]
pub struct ConcatEngine {
    pub apply_calls: AtomicUsize,
    pub extract_calls: AtomicUsize,
    /// States whose merge or extraction fails.
    pub poisoned: Mutex<HashSet<Vec<u8>>>,
    pub down: AtomicBool,
}

impl ConcatEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn poison(&self, fragment: &[u8]) {
        self.poisoned.lock().insert(fragment.to_vec());
    }

    fn check(&self, parts: &[&[u8]]) -> Result<(), EngineError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(EngineError::Status {
                status: 503,
                body: "down".into(),
            });
        }
        let poisoned = self.poisoned.lock();
        if parts.iter().any(|p| poisoned.contains(*p)) {
            return Err(EngineError::Status {
                status: 422,
                body: "poisoned".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MergeEngine for ConcatEngine {
    async fn apply_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let parts: Vec<&[u8]> = updates.iter().map(Vec::as_slice).collect();
        self.check(&parts)?;
        Ok(updates.concat())
    }

    async fn extract_blocks(&self, state: &[u8]) -> Result<Vec<ExtractedBlock>, EngineError> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        self.check(&[state])?;
        Ok(String::from_utf8_lossy(state)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, line)| ExtractedBlock {
                block_type: "paragraph".into(),
                level: 0,
                headings_path: Vec::new(),
                plain_text: line.to_string(),
                canonical_json: serde_json::json!({ "type": "paragraph", "text": line }),
                position: i as u32,
            })
            .collect())
    }

    async fn health(&self) -> Result<(), EngineError> {
        self.check(&[])
    }
}

/// Update log wrapper whose appends can be switched to fail.
pub struct FlakyLog<L> {
    pub inner: L,
    pub failing: AtomicBool,
}

impl<L> FlakyLog<L> {
    pub fn new(inner: L) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl<L: UpdateLog> UpdateLog for FlakyLog<L> {
    async fn append(&self, record: &UpdateRecord) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt("injected append failure".into()));
        }
        self.inner.append(record).await
    }

    async fn last_seq(&self, page: &PageId) -> StoreResult<Option<u64>> {
        self.inner.last_seq(page).await
    }

    async fn updates_after(&self, page: &PageId, after: u64) -> StoreResult<Vec<UpdateRecord>> {
        self.inner.updates_after(page, after).await
    }

    async fn page_heads(&self) -> StoreResult<Vec<(PageId, u64)>> {
        self.inner.page_heads().await
    }

    async fn prune_through(&self, page: &PageId, through: u64) -> StoreResult<usize> {
        self.inner.prune_through(page, through).await
    }
}
