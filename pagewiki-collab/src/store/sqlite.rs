//! SQLite persistence for the update log, snapshots and search blocks.
//!
//! Append-only `updates` table keyed by (page, seq), immutable `snapshots`
//! keyed by (page, version), and a `search_blocks` set swapped per indexing
//! pass. The connection is shared behind a mutex and every call runs on the
//! blocking pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagewiki_types::{
    ExtractedBlock, PageId, SearchBlock, SearchHit, Snapshot, UpdateRecord, UserId,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use super::{SearchIndex, SnapshotStore, StoreError, StoreResult, UpdateLog};

const SCHEMA: &str = r#"
-- Edit fragments (append-only, immutable)
CREATE TABLE IF NOT EXISTS updates (
    page_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    author_id TEXT NOT NULL,
    fragment BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (page_id, seq)
);

-- Materialized states (immutable, strictly increasing version per page)
CREATE TABLE IF NOT EXISTS snapshots (
    page_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    covered_seq INTEGER NOT NULL,
    state BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (page_id, version)
);

-- Search blocks (replaced wholesale per indexing pass)
CREATE TABLE IF NOT EXISTS search_blocks (
    page_id TEXT NOT NULL,
    snapshot_version INTEGER NOT NULL,
    position INTEGER NOT NULL,
    block_type TEXT NOT NULL,
    level INTEGER NOT NULL,
    headings_path TEXT NOT NULL,
    plain_text TEXT NOT NULL,
    -- Unicode-lowercased plain_text; LIKE only folds ASCII
    folded_text TEXT NOT NULL,
    canonical_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_search_blocks_page ON search_blocks(page_id, position);

CREATE TABLE IF NOT EXISTS search_index_state (
    page_id TEXT PRIMARY KEY,
    snapshot_version INTEGER NOT NULL,
    indexed_at INTEGER NOT NULL
);
"#;

/// Database handle implementing every store trait.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path. `:memory:` is accepted.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }
}

/// Databases created before `folded_text` existed get their search blocks
/// dropped; the next indexing pass rebuilds them.
fn migrate(conn: &Connection) -> StoreResult<()> {
    let folded: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info('search_blocks') WHERE name = 'folded_text'",
        [],
        |row| row.get(0),
    )?;
    if folded == 0 {
        conn.execute_batch("DROP TABLE search_blocks; DELETE FROM search_index_state;")?;
        conn.execute_batch(SCHEMA)?;
    }
    Ok(())
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn escape_like(query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 2);
    out.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn read_snapshot(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let version: i64 = row.get(1)?;
    let covered: i64 = row.get(2)?;
    Ok(Snapshot {
        page_id: PageId(row.get(0)?),
        version: version as u64,
        covered_seq: covered as u64,
        state: row.get(3)?,
        created_at: timestamp(row, 4)?,
    })
}

#[async_trait]
impl UpdateLog for SqliteStore {
    async fn append(&self, record: &UpdateRecord) -> StoreResult<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let res = conn.execute(
                "INSERT INTO updates (page_id, seq, author_id, fragment, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.page_id.as_str(),
                    record.seq as i64,
                    record.author.as_str(),
                    record.fragment,
                    record.created_at.timestamp_millis(),
                ],
            );
            match res {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(StoreError::DuplicateSequence {
                    page: record.page_id.0.clone(),
                    seq: record.seq,
                }),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn last_seq(&self, page: &PageId) -> StoreResult<Option<u64>> {
        let page = page.clone();
        self.with_conn(move |conn| {
            let max: Option<i64> = conn.query_row(
                "SELECT MAX(seq) FROM updates WHERE page_id = ?1",
                params![page.as_str()],
                |row| row.get(0),
            )?;
            Ok(max.map(|s| s as u64))
        })
        .await
    }

    async fn updates_after(&self, page: &PageId, after: u64) -> StoreResult<Vec<UpdateRecord>> {
        let page = page.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT page_id, seq, author_id, fragment, created_at
                 FROM updates WHERE page_id = ?1 AND seq > ?2 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![page.as_str(), after as i64], |row| {
                let seq: i64 = row.get(1)?;
                Ok(UpdateRecord {
                    page_id: PageId(row.get(0)?),
                    seq: seq as u64,
                    author: UserId(row.get(2)?),
                    fragment: row.get(3)?,
                    created_at: timestamp(row, 4)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn page_heads(&self) -> StoreResult<Vec<(PageId, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT page_id, MAX(seq) FROM updates GROUP BY page_id ORDER BY page_id",
            )?;
            let rows = stmt.query_map([], |row| {
                let head: i64 = row.get(1)?;
                Ok((PageId(row.get(0)?), head as u64))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn prune_through(&self, page: &PageId, through: u64) -> StoreResult<usize> {
        let page = page.clone();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "DELETE FROM updates WHERE page_id = ?1 AND seq <= ?2",
                params![page.as_str(), through as i64],
            )?)
        })
        .await
    }
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn latest(&self, page: &PageId) -> StoreResult<Option<Snapshot>> {
        let page = page.clone();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT page_id, version, covered_seq, state, created_at
                     FROM snapshots WHERE page_id = ?1 ORDER BY version DESC LIMIT 1",
                    params![page.as_str()],
                    read_snapshot,
                )
                .optional()?)
        })
        .await
    }

    async fn insert(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let snapshot = snapshot.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let current: Option<i64> = tx.query_row(
                "SELECT MAX(version) FROM snapshots WHERE page_id = ?1",
                params![snapshot.page_id.as_str()],
                |row| row.get(0),
            )?;
            let expected = current.map(|v| v as u64 + 1).unwrap_or(1);
            if snapshot.version != expected {
                return Err(StoreError::VersionConflict {
                    page: snapshot.page_id.0.clone(),
                    expected,
                    got: snapshot.version,
                });
            }

            let res = tx.execute(
                "INSERT INTO snapshots (page_id, version, covered_seq, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    snapshot.page_id.as_str(),
                    snapshot.version as i64,
                    snapshot.covered_seq as i64,
                    snapshot.state,
                    snapshot.created_at.timestamp_millis(),
                ],
            );
            match res {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(StoreError::VersionConflict {
                        page: snapshot.page_id.0.clone(),
                        expected,
                        got: snapshot.version,
                    })
                }
                Err(e) => return Err(e.into()),
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn retain_latest(&self, page: &PageId, keep: usize) -> StoreResult<Option<u64>> {
        let page = page.clone();
        let keep = keep.max(1);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let retained: Vec<(i64, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT version, covered_seq FROM snapshots
                     WHERE page_id = ?1 ORDER BY version DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![page.as_str(), keep as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let Some(&(oldest_version, oldest_covered)) = retained.last() else {
                return Ok(None);
            };
            tx.execute(
                "DELETE FROM snapshots WHERE page_id = ?1 AND version < ?2",
                params![page.as_str(), oldest_version],
            )?;
            tx.commit()?;
            Ok(Some(oldest_covered as u64))
        })
        .await
    }

    async fn snapshot_heads(&self) -> StoreResult<Vec<(PageId, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT page_id, MAX(version) FROM snapshots GROUP BY page_id ORDER BY page_id",
            )?;
            let rows = stmt.query_map([], |row| {
                let version: i64 = row.get(1)?;
                Ok((PageId(row.get(0)?), version as u64))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[async_trait]
impl SearchIndex for SqliteStore {
    async fn replace_blocks(
        &self,
        page: &PageId,
        snapshot_version: u64,
        blocks: &[ExtractedBlock],
    ) -> StoreResult<()> {
        let page = page.clone();
        let rows = blocks
            .iter()
            .map(|b| {
                let path = serde_json::to_string(&b.headings_path)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                let canonical = serde_json::to_string(&b.canonical_json)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok((b.clone(), path, canonical))
            })
            .collect::<StoreResult<Vec<_>>>()?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM search_blocks WHERE page_id = ?1",
                params![page.as_str()],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO search_blocks
                     (page_id, snapshot_version, position, block_type, level,
                      headings_path, plain_text, folded_text, canonical_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for (block, path, canonical) in &rows {
                    stmt.execute(params![
                        page.as_str(),
                        snapshot_version as i64,
                        block.position,
                        block.block_type,
                        block.level,
                        path,
                        block.plain_text,
                        block.plain_text.to_lowercase(),
                        canonical,
                    ])?;
                }
            }
            tx.execute(
                "INSERT INTO search_index_state (page_id, snapshot_version, indexed_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(page_id) DO UPDATE SET
                     snapshot_version = excluded.snapshot_version,
                     indexed_at = excluded.indexed_at",
                params![
                    page.as_str(),
                    snapshot_version as i64,
                    Utc::now().timestamp_millis()
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn blocks(&self, page: &PageId) -> StoreResult<Vec<SearchBlock>> {
        let page = page.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT page_id, snapshot_version, position, block_type, level,
                        headings_path, plain_text, canonical_json
                 FROM search_blocks WHERE page_id = ?1 ORDER BY position, rowid",
            )?;
            let rows = stmt.query_map(params![page.as_str()], |row| {
                let version: i64 = row.get(1)?;
                let path: String = row.get(5)?;
                let canonical: String = row.get(7)?;
                Ok((
                    PageId(row.get(0)?),
                    version as u64,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    path,
                    row.get::<_, String>(6)?,
                    canonical,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (page_id, version, position, block_type, level, path, text, canonical) = row?;
                out.push(SearchBlock {
                    page_id,
                    snapshot_version: version,
                    block: ExtractedBlock {
                        block_type,
                        level,
                        headings_path: serde_json::from_str(&path)
                            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                        plain_text: text,
                        canonical_json: serde_json::from_str(&canonical)
                            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                        position,
                    },
                });
            }
            Ok(out)
        })
        .await
    }

    async fn indexed_version(&self, page: &PageId) -> StoreResult<Option<u64>> {
        let page = page.clone();
        self.with_conn(move |conn| {
            let version: Option<i64> = conn
                .query_row(
                    "SELECT snapshot_version FROM search_index_state WHERE page_id = ?1",
                    params![page.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(version.map(|v| v as u64))
        })
        .await
    }

    async fn search(&self, query: &str, limit: usize) -> StoreResult<Vec<SearchHit>> {
        let pattern = escape_like(&query.trim().to_lowercase());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT page_id, position, block_type, headings_path, plain_text
                 FROM search_blocks WHERE folded_text LIKE ?1 ESCAPE '\\'
                 ORDER BY page_id, position LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![pattern, limit as i64], |row| {
                Ok((
                    PageId(row.get(0)?),
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut hits = Vec::new();
            for row in rows {
                let (page_id, position, block_type, path, plain_text) = row?;
                hits.push(SearchHit {
                    page_id,
                    position,
                    block_type,
                    headings_path: serde_json::from_str(&path)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    plain_text,
                });
            }
            Ok(hits)
        })
        .await
    }
}
