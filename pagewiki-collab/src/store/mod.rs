//! Persistence for the update log, snapshots and search blocks.
//!
//! The coordinator and the background workers only see the traits below;
//! [`SqliteStore`] implements all three over a single SQLite database.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use pagewiki_types::{ExtractedBlock, PageId, SearchBlock, SearchHit, Snapshot, UpdateRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("sequence {seq} already exists for page {page}")]
    DuplicateSequence { page: String, seq: u64 },

    #[error("snapshot version conflict for page {page}: expected {expected}, got {got}")]
    VersionConflict { page: String, expected: u64, got: u64 },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("page {0} kept changing while it was read")]
    Contended(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Append-only, per-page ordered log of edit fragments.
#[async_trait]
pub trait UpdateLog: Send + Sync {
    /// Durably append one record. Fails if `(page_id, seq)` already exists.
    async fn append(&self, record: &UpdateRecord) -> StoreResult<()>;

    /// Highest sequence number stored for a page, if any.
    async fn last_seq(&self, page: &PageId) -> StoreResult<Option<u64>>;

    /// All records with `seq > after`, in sequence order.
    async fn updates_after(&self, page: &PageId, after: u64) -> StoreResult<Vec<UpdateRecord>>;

    /// Every page with at least one record, paired with its highest sequence.
    async fn page_heads(&self) -> StoreResult<Vec<(PageId, u64)>>;

    /// Delete records with `seq <= through`. Returns the number removed.
    async fn prune_through(&self, page: &PageId, through: u64) -> StoreResult<usize>;
}

/// Versioned, immutable materialized states per page.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn latest(&self, page: &PageId) -> StoreResult<Option<Snapshot>>;

    /// Insert a snapshot whose version must be exactly `latest + 1` (or 1).
    async fn insert(&self, snapshot: &Snapshot) -> StoreResult<()>;

    /// Keep the newest `keep` snapshots, delete the rest. Returns the oldest
    /// retained snapshot's covered sequence, if any snapshot remains.
    async fn retain_latest(&self, page: &PageId, keep: usize) -> StoreResult<Option<u64>>;

    /// Every page with a snapshot, paired with its latest version.
    async fn snapshot_heads(&self) -> StoreResult<Vec<(PageId, u64)>>;
}

/// Derived, wholesale-replaceable search blocks per page.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Atomically swap the page's block set for `blocks`, tagged with the
    /// snapshot version they were extracted from.
    async fn replace_blocks(
        &self,
        page: &PageId,
        snapshot_version: u64,
        blocks: &[ExtractedBlock],
    ) -> StoreResult<()>;

    async fn blocks(&self, page: &PageId) -> StoreResult<Vec<SearchBlock>>;

    /// Snapshot version the current block set was extracted from.
    async fn indexed_version(&self, page: &PageId) -> StoreResult<Option<u64>>;

    /// Case-insensitive substring search over block plain text.
    async fn search(&self, query: &str, limit: usize) -> StoreResult<Vec<SearchHit>>;
}
