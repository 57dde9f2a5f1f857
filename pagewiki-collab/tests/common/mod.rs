//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{routing::get, routing::post, Json, Router};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use pagewiki_collab::engine::{
    ApplyUpdatesRequest, ApplyUpdatesResponse, EngineError, ExtractBlocksRequest,
    ExtractBlocksResponse, MergeEngine,
};
use pagewiki_collab::manager::{Outbound, RoomManager, SessionHandle};
use pagewiki_collab::protocol::ServerFrame;
use pagewiki_collab::store::{StoreError, StoreResult, UpdateLog};
use pagewiki_types::{ExtractedBlock, PageId, SessionId, UpdateRecord, UserId};
use tokio::sync::mpsc;

/// Deterministic merge: concatenate in order. Extraction: one paragraph per
/// non-empty line.
pub struct ConcatEngine;

pub fn concat(updates: &[Vec<u8>]) -> Vec<u8> {
    updates.concat()
}

pub fn line_blocks(state: &[u8]) -> Vec<ExtractedBlock> {
    String::from_utf8_lossy(state)
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
        .collect()
}

#[async_trait]
impl MergeEngine for ConcatEngine {
    async fn apply_updates(&self, updates: &[Vec<u8>]) -> Result<Vec<u8>, EngineError> {
        Ok(concat(updates))
    }

    async fn extract_blocks(&self, state: &[u8]) -> Result<Vec<ExtractedBlock>, EngineError> {
        Ok(line_blocks(state))
    }

    async fn health(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// The same engine served over HTTP, for end-to-end tests.
pub async fn spawn_http_engine() -> String {
    async fn apply(Json(req): Json<ApplyUpdatesRequest>) -> Json<ApplyUpdatesResponse> {
        let updates: Vec<Vec<u8>> = req
            .updates
            .iter()
            .map(|u| B64.decode(u).unwrap())
            .collect();
        Json(ApplyUpdatesResponse {
            state: B64.encode(concat(&updates)),
        })
    }

    async fn extract(Json(req): Json<ExtractBlocksRequest>) -> Json<ExtractBlocksResponse> {
        let state = B64.decode(req.state).unwrap();
        Json(ExtractBlocksResponse {
            blocks: line_blocks(&state),
        })
    }

    let router = Router::new()
        .route("/apply-updates", post(apply))
        .route("/extract-blocks", post(extract))
        .route("/health", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Update log whose appends can be switched to fail.
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

/// A test peer: its manager handle goes to the coordinator, the receiver
/// stays here.
pub struct Peer {
    pub id: SessionId,
    pub user: UserId,
    pub page: PageId,
    pub rx: mpsc::Receiver<Outbound>,
}

pub fn peer(id: u64, page: &str) -> (Peer, SessionHandle) {
    let user = UserId::new(format!("user-{id}"));
    let (handle, rx) = SessionHandle::new(SessionId::new(id), user.clone(), PageId::new(page), 32);
    (
        Peer {
            id: SessionId::new(id),
            user,
            page: PageId::new(page),
            rx,
        },
        handle,
    )
}

impl Peer {
    pub async fn next(&mut self) -> ServerFrame {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("no frame in time")
            .expect("queue closed");
        (*frame).clone()
    }

    pub fn assert_idle(&mut self) {
        assert!(self.rx.try_recv().is_err(), "peer {} got an unexpected frame", self.id);
    }
}

pub fn spawn_manager() -> (
    pagewiki_collab::manager::ManagerHandle,
    tokio_util::sync::CancellationToken,
) {
    let cancel = tokio_util::sync::CancellationToken::new();
    let (handle, _task) = RoomManager::spawn(Duration::from_secs(30), cancel.clone());
    (handle, cancel)
}
