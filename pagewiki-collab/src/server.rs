use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use futures::{SinkExt, StreamExt};
use pagewiki_types::{PageId, SearchBlock, SearchHit, SessionId, UserId};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthError, AuthState, Capability, Identity, MaybeClaims},
    config::CollabConfig,
    coordinator::DocumentCoordinator,
    engine::{HttpMergeEngine, MergeEngine},
    indexer::IndexingWorker,
    manager::{ManagerStats, RoomManager},
    protocol::{self, ServerFrame},
    retention::RetentionPolicy,
    session::{Session, SessionLimits},
    snapshot::SnapshotWorker,
    store::{SearchIndex, SnapshotStore, SqliteStore, UpdateLog},
};

const MAX_PAGE_ID_LEN: usize = 512;
const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 100;
/// Pending index triggers; extra ones are dropped and caught by the next pass.
const INDEX_TRIGGER_BUFFER: usize = 64;

/// The three persistence seams, usually one SQLite database.
#[derive(Clone)]
pub struct Stores {
    pub log: Arc<dyn UpdateLog>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub index: Arc<dyn SearchIndex>,
}

impl Stores {
    pub fn sqlite(store: SqliteStore) -> Self {
        Self {
            log: Arc::new(store.clone()),
            snapshots: Arc::new(store.clone()),
            index: Arc::new(store),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<DocumentCoordinator>,
    pub index: Arc<dyn SearchIndex>,
    pub engine: Arc<dyn MergeEngine>,
    pub limits: SessionLimits,
    pub retention: RetentionPolicy,
    pub cancel: CancellationToken,
    next_session: Arc<AtomicU64>,
}

/// Background tasks behind the HTTP surface: the room manager and both
/// workers, all stopped by one cancellation token.
pub struct CollabRuntime {
    pub state: AppState,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl CollabRuntime {
    pub fn start(
        config: &CollabConfig,
        stores: Stores,
        engine: Arc<dyn MergeEngine>,
        cancel: CancellationToken,
    ) -> Self {
        let (manager, manager_task) = RoomManager::spawn(config.manager_tick, cancel.clone());
        let coordinator = Arc::new(DocumentCoordinator::new(
            stores.log.clone(),
            stores.snapshots.clone(),
            engine.clone(),
            manager,
        ));

        let (index_tx, index_rx) = tokio::sync::mpsc::channel(INDEX_TRIGGER_BUFFER);
        let snapshots = SnapshotWorker::new(
            stores.log.clone(),
            stores.snapshots.clone(),
            engine.clone(),
            config.snapshot_interval,
        )
        .with_retention(config.retention)
        .with_index_trigger(index_tx);
        let indexer = IndexingWorker::new(
            stores.snapshots.clone(),
            stores.index.clone(),
            engine.clone(),
            config.index_interval,
        )
        .with_triggers(index_rx);

        let tasks = vec![
            manager_task,
            tokio::spawn(snapshots.run(cancel.clone())),
            tokio::spawn(indexer.run(cancel.clone())),
        ];

        let state = AppState {
            coordinator,
            index: stores.index,
            engine,
            limits: config.limits,
            retention: config.retention,
            cancel: cancel.clone(),
            next_session: Arc::new(AtomicU64::new(1)),
        };
        Self {
            state,
            cancel,
            tasks,
        }
    }

    /// Cancel everything and wait for the background tasks to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
    }
}

pub fn router(state: AppState, auth_state: AuthState) -> Router {
    Router::new()
        // Public endpoints (no auth required)
        .route("/healthz", get(healthz))
        // Authenticated endpoints
        .route("/api/status", get(status))
        .route("/api/search", get(search))
        .route("/api/rooms/{*page_id}", get(room))
        .route("/api/blocks/{*page_id}", get(page_blocks))
        .route("/ws/page/{*page_id}", get(ws_page))
        .layer(Extension(auth_state))
        .with_state(state)
}

pub async fn serve(config: CollabConfig) -> Result<()> {
    let auth_state = AuthState {
        keystore: Arc::new(config.auth.build_keystore()),
        require_auth: config.auth.require_auth,
    };
    if auth_state.require_auth && !auth_state.keystore.has_keys() {
        bail!("--require-auth needs --auth-secret");
    }

    let store = SqliteStore::open(&config.database)?;
    info!(database = %config.database.display(), "store opened");

    let engine = Arc::new(HttpMergeEngine::new(
        config.engine_url.clone(),
        config.engine_timeout,
    )?);
    match engine.health().await {
        Ok(()) => info!(url = %engine.base_url(), "merge engine reachable"),
        Err(err) => warn!(url = %engine.base_url(), error = %err, "merge engine not reachable yet"),
    }

    let cancel = CancellationToken::new();
    let runtime = CollabRuntime::start(&config, Stores::sqlite(store), engine, cancel.clone());
    let app = router(runtime.state.clone(), auth_state);

    info!(addr = %config.listen_addr, "pagewiki-collab listening");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    runtime.shutdown().await;
    info!("pagewiki-collab stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                warn!(error = %err, "could not listen for ctrl-c");
                // Without a signal handler, only an explicit cancel stops us.
                cancel.cancelled().await;
            }
        }
        _ = cancel.cancelled() => {}
    }
    info!("shutting down");
    cancel.cancel();
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

fn parse_page_id(raw: &str) -> Option<PageId> {
    let raw = raw.trim_matches('/');
    if raw.is_empty() || raw.len() > MAX_PAGE_ID_LEN {
        return None;
    }
    Some(PageId::new(raw))
}

#[derive(Serialize)]
struct StatusPayload {
    rooms: usize,
    sessions: usize,
    /// Pages with a cached sequence cursor.
    pages: usize,
    engine: String,
    retention: RetentionPolicy,
}

async fn status(
    State(state): State<AppState>,
    MaybeClaims(claims): MaybeClaims,
) -> Result<Response, AuthError> {
    Identity::from_claims(claims).authorize(Capability::Read, None)?;

    let ManagerStats { rooms, sessions } = match state.coordinator.manager().stats().await {
        Ok(stats) => stats,
        Err(err) => {
            return Ok((StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response());
        }
    };
    let engine = match state.engine.health().await {
        Ok(()) => "ok".to_string(),
        Err(err) => err.to_string(),
    };

    Ok(Json(StatusPayload {
        rooms,
        sessions,
        pages: state.coordinator.tracked_pages(),
        engine,
        retention: state.retention,
    })
    .into_response())
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    hits: Vec<SearchHit>,
}

async fn search(
    State(state): State<AppState>,
    MaybeClaims(claims): MaybeClaims,
    Query(params): Query<SearchParams>,
) -> Result<Response, AuthError> {
    let identity = Identity::from_claims(claims);
    identity.authorize(Capability::Search, None)?;

    let query = params.q.trim().to_string();
    if query.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, "empty query").into_response());
    }
    let limit = params
        .limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);

    match state.index.search(&query, limit).await {
        Ok(hits) => {
            // Page allow-lists apply to results too.
            let hits = hits
                .into_iter()
                .filter(|h| {
                    identity
                        .authorize(Capability::Search, Some(h.page_id.as_str()))
                        .is_ok()
                })
                .collect();
            Ok(Json(SearchResponse { query, hits }).into_response())
        }
        Err(err) => {
            warn!(%query, error = %err, "search failed");
            Ok((StatusCode::INTERNAL_SERVER_ERROR, "search failed").into_response())
        }
    }
}

#[derive(Serialize)]
struct RoomPayload {
    page_id: PageId,
    sessions: usize,
}

async fn room(
    Path(raw): Path<String>,
    State(state): State<AppState>,
    MaybeClaims(claims): MaybeClaims,
) -> Result<Response, AuthError> {
    let Some(page_id) = parse_page_id(&raw) else {
        return Ok((StatusCode::BAD_REQUEST, "invalid page id").into_response());
    };
    Identity::from_claims(claims).authorize(Capability::Read, Some(page_id.as_str()))?;

    match state.coordinator.manager().room_size(&page_id).await {
        Ok(sessions) => Ok(Json(RoomPayload { page_id, sessions }).into_response()),
        Err(err) => Ok((StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()),
    }
}

#[derive(Serialize)]
struct BlocksPayload {
    page_id: PageId,
    snapshot_version: Option<u64>,
    blocks: Vec<SearchBlock>,
}

/// The indexed blocks of one page, in document order.
async fn page_blocks(
    Path(raw): Path<String>,
    State(state): State<AppState>,
    MaybeClaims(claims): MaybeClaims,
) -> Result<Response, AuthError> {
    let Some(page_id) = parse_page_id(&raw) else {
        return Ok((StatusCode::BAD_REQUEST, "invalid page id").into_response());
    };
    Identity::from_claims(claims).authorize(Capability::Read, Some(page_id.as_str()))?;

    let listing = match state.index.indexed_version(&page_id).await {
        Ok(version) => state.index.blocks(&page_id).await.map(|b| (version, b)),
        Err(err) => Err(err),
    };
    match listing {
        Ok((snapshot_version, blocks)) => Ok(Json(BlocksPayload {
            page_id,
            snapshot_version,
            blocks,
        })
        .into_response()),
        Err(err) => {
            warn!(page = %page_id, error = %err, "block listing failed");
            Ok((StatusCode::INTERNAL_SERVER_ERROR, "block listing failed").into_response())
        }
    }
}

async fn ws_page(
    Path(raw): Path<String>,
    State(state): State<AppState>,
    MaybeClaims(claims): MaybeClaims,
    ws: WebSocketUpgrade,
) -> Result<Response, AuthError> {
    let Some(page_id) = parse_page_id(&raw) else {
        return Ok((StatusCode::BAD_REQUEST, "invalid page id").into_response());
    };
    let identity = Identity::from_claims(claims);
    identity.authorize(Capability::Read, Some(page_id.as_str()))?;
    let can_edit = identity
        .authorize(Capability::Edit, Some(page_id.as_str()))
        .is_ok();

    // Hard transport cap; the session enforces the exact limit and reports it.
    let transport_cap = state.limits.max_frame_bytes.saturating_mul(2);
    Ok(ws
        .max_message_size(transport_cap)
        .on_upgrade(move |socket| handle_ws(socket, page_id, identity.user, can_edit, state)))
}

async fn handle_ws(socket: WebSocket, page: PageId, user: UserId, can_edit: bool, state: AppState) {
    let id = SessionId::new(state.next_session.fetch_add(1, Ordering::Relaxed));
    let (session, handle) = Session::new(id, user, page.clone(), can_edit, state.limits);
    let (mut sink, stream) = socket.split();

    if let Err(err) = state.coordinator.join(handle).await {
        warn!(session = %id, %page, error = %err, "join failed");
        if let Ok(text) = protocol::encode(&ServerFrame::error(&err)) {
            let _ = sink.send(WsMessage::Text(text.into())).await;
        }
        let _ = sink.send(WsMessage::Close(None)).await;
        if let Err(err) = state.coordinator.release(&page).await {
            debug!(%page, error = %err, "page cursor not released");
        }
        return;
    }

    session
        .run(stream, sink, state.coordinator.clone(), state.cancel.clone())
        .await;
}
