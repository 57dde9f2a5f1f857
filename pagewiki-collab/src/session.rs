//! One live connection: a read loop, a write loop and a bounded outbound
//! queue between the room manager and the socket.
//!
//! The read loop runs on the caller's task and owns the inbound half. The
//! write loop is spawned and owns the outbound half; it drains the queue the
//! manager delivers into and sends heartbeat pings. The queue closing (the
//! manager dropped the session) ends the write loop, which closes the socket
//! and cancels the session token so the read loop stops as well.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use pagewiki_types::{PageId, SessionId, UserId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::DocumentCoordinator;
use crate::error::{CollabError, ConnectionError, ProtocolError};
use crate::manager::{ManagerHandle, Outbound, SessionHandle};
use crate::protocol::{self, ClientFrame, ServerFrame};

const MIN_PING_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_frame_bytes: usize,
    pub outbound_capacity: usize,
    /// Interval between heartbeat pings. Must be shorter than `pong_wait`.
    pub ping_interval: Duration,
    /// Read deadline, refreshed by every pong.
    pub pong_wait: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            outbound_capacity: 256,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
        }
    }
}

pub struct Session {
    id: SessionId,
    user: UserId,
    page: PageId,
    can_edit: bool,
    limits: SessionLimits,
    state: Arc<Mutex<SessionState>>,
    outbound: mpsc::Receiver<Outbound>,
}

impl Session {
    /// Create a session in `Connecting` state plus the handle the manager
    /// will own once it is registered.
    pub fn new(
        id: SessionId,
        user: UserId,
        page: PageId,
        can_edit: bool,
        limits: SessionLimits,
    ) -> (Self, SessionHandle) {
        let (handle, outbound) =
            SessionHandle::new(id, user.clone(), page.clone(), limits.outbound_capacity);
        let session = Self {
            id,
            user,
            page,
            can_edit,
            limits,
            state: Arc::new(Mutex::new(SessionState::Connecting)),
            outbound,
        };
        (session, handle)
    }

    /// Shared view of the lifecycle state.
    pub fn state(&self) -> Arc<Mutex<SessionState>> {
        self.state.clone()
    }

    /// Drive the session until the peer goes away, a fatal error occurs or
    /// `shutdown` fires. The session must already be registered.
    pub async fn run<S, K>(
        self,
        mut stream: S,
        sink: K,
        coordinator: Arc<DocumentCoordinator>,
        shutdown: CancellationToken,
    ) where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
        K: Sink<Message> + Unpin + Send + 'static,
        K::Error: Display + Send,
    {
        let Session {
            id,
            user,
            page,
            can_edit,
            limits,
            state,
            outbound,
        } = self;
        let manager = coordinator.manager().clone();
        let token = shutdown.child_token();

        *state.lock() = SessionState::Open;
        info!(session = %id, %user, %page, "session open");

        let writer = tokio::spawn(write_loop(sink, outbound, limits.ping_interval, token.clone(), id));

        let ctx = ReadContext {
            id,
            user: &user,
            page: &page,
            can_edit,
            coordinator: coordinator.as_ref(),
            manager: &manager,
        };
        let reason = read_loop(&mut stream, &limits, &token, &ctx).await;

        *state.lock() = SessionState::Closing;
        if let Some(err) = &reason {
            debug!(session = %id, error = %err, kind = err.kind(), "closing session");
            let _ = manager.send_to(id, ServerFrame::error(err)).await;
        }
        if manager.unregister(id).await.is_err() {
            token.cancel();
        }
        if let Err(err) = writer.await {
            warn!(session = %id, error = %err, "write loop panicked");
        }
        if let Err(err) = coordinator.release(&page).await {
            debug!(session = %id, %page, error = %err, "page cursor not released");
        }
        *state.lock() = SessionState::Closed;
        info!(session = %id, %page, "session closed");
    }
}

struct ReadContext<'a> {
    id: SessionId,
    user: &'a UserId,
    page: &'a PageId,
    can_edit: bool,
    coordinator: &'a DocumentCoordinator,
    manager: &'a ManagerHandle,
}

impl ReadContext<'_> {
    /// Handle one decoded frame. Only errors that must end the session are
    /// returned; the rest are reported back to the peer.
    async fn dispatch(&self, frame: ClientFrame) -> Result<(), CollabError> {
        let outcome = match frame {
            ClientFrame::Update(fragment) => {
                if !self.can_edit {
                    Err(CollabError::Forbidden)
                } else {
                    match self
                        .coordinator
                        .submit(self.page, self.id, self.user, fragment)
                        .await
                    {
                        Ok(seq) => self
                            .manager
                            .send_to(self.id, ServerFrame::Ack { seq })
                            .await
                            .map(|_| ()),
                        Err(err) => Err(err),
                    }
                }
            }
            ClientFrame::Sync => self
                .coordinator
                .resync(self.page, self.id)
                .await
                .map(|_| ()),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal_for_session() => Err(err),
            Err(err) => {
                warn!(session = %self.id, page = %self.page, error = %err, "request failed");
                self.manager
                    .send_to(self.id, ServerFrame::error(&err))
                    .await
                    .map(|_| ())
            }
        }
    }
}

/// Returns the error that ended the loop, or `None` for a clean close.
async fn read_loop<S>(
    stream: &mut S,
    limits: &SessionLimits,
    token: &CancellationToken,
    ctx: &ReadContext<'_>,
) -> Option<CollabError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut deadline = Instant::now() + limits.pong_wait;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return None,
            next = timeout_at(deadline, stream.next()) => next,
        };
        let msg = match next {
            Err(_) => return Some(ConnectionError::IdleTimeout(limits.pong_wait).into()),
            Ok(None) => return None,
            Ok(Some(Err(err))) => return Some(ConnectionError::Transport(err.to_string()).into()),
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                let text = text.as_str();
                if text.len() > limits.max_frame_bytes {
                    return Some(too_large(text.len(), limits));
                }
                let frame = match protocol::decode_client(text) {
                    Ok(frame) => frame,
                    Err(err) => return Some(err.into()),
                };
                if let Err(err) = ctx.dispatch(frame).await {
                    return Some(err);
                }
            }
            Message::Binary(data) => {
                if data.len() > limits.max_frame_bytes {
                    return Some(too_large(data.len(), limits));
                }
                return Some(ProtocolError::BinaryFrame.into());
            }
            Message::Pong(_) => deadline = Instant::now() + limits.pong_wait,
            Message::Ping(_) => {}
            Message::Close(_) => return None,
        }
    }
}

fn too_large(len: usize, limits: &SessionLimits) -> CollabError {
    ConnectionError::FrameTooLarge {
        len,
        max: limits.max_frame_bytes,
    }
    .into()
}

async fn write_loop<K>(
    mut sink: K,
    mut outbound: mpsc::Receiver<Outbound>,
    ping_interval: Duration,
    token: CancellationToken,
    id: SessionId,
) where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    // `interval_at` panics on a zero period.
    let ping_interval = ping_interval.max(MIN_PING_INTERVAL);
    let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = outbound.recv() => {
                let Some(frame) = next else {
                    // Unregistered: flush is done, say goodbye.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = match protocol::encode(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(session = %id, error = %err, "could not encode frame");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text.into())).await {
                    debug!(session = %id, error = %err, "write failed");
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(err) = sink.send(Message::Ping(Bytes::new())).await {
                    debug!(session = %id, error = %err, "ping failed");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    token.cancel();
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc as chan;

    use super::*;
    use crate::manager::RoomManager;
    use crate::store::{SqliteStore, UpdateLog};
    use crate::test_support::{ConcatEngine, FlakyLog};

    type Inbound = chan::UnboundedSender<Result<Message, axum::Error>>;
    type Wire = chan::UnboundedReceiver<Message>;

    struct Harness {
        coordinator: Arc<DocumentCoordinator>,
        log: Arc<FlakyLog<SqliteStore>>,
        shutdown: CancellationToken,
    }

    fn harness() -> Harness {
        let store = SqliteStore::in_memory().unwrap();
        let log = FlakyLog::new(store.clone());
        let shutdown = CancellationToken::new();
        let (manager, _task) = RoomManager::spawn(Duration::from_secs(30), shutdown.clone());
        let coordinator = Arc::new(DocumentCoordinator::new(
            log.clone(),
            Arc::new(store),
            ConcatEngine::new(),
            manager,
        ));
        Harness {
            coordinator,
            log,
            shutdown,
        }
    }

    fn limits() -> SessionLimits {
        SessionLimits {
            max_frame_bytes: 64,
            outbound_capacity: 16,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
        }
    }

    /// Join and start a session; returns the client ends of the socket.
    async fn connect(
        h: &Harness,
        id: u64,
        can_edit: bool,
        limits: SessionLimits,
    ) -> (Inbound, Wire, tokio::task::JoinHandle<()>, Arc<Mutex<SessionState>>) {
        let (session, handle) = Session::new(
            SessionId::new(id),
            UserId::new(format!("user-{id}")),
            PageId::new("page-42"),
            can_edit,
            limits,
        );
        let state = session.state();
        assert_eq!(*state.lock(), SessionState::Connecting);
        h.coordinator.join(handle).await.unwrap();

        let (in_tx, in_rx) = chan::unbounded();
        let (out_tx, out_rx) = chan::unbounded();
        let task = tokio::spawn(session.run(in_rx, out_tx, h.coordinator.clone(), h.shutdown.clone()));
        (in_tx, out_rx, task, state)
    }

    fn text(frame: &str) -> Result<Message, axum::Error> {
        Ok(Message::Text(frame.to_string().into()))
    }

    async fn next_frame(wire: &mut Wire) -> ServerFrame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), wire.next())
                .await
                .expect("no frame in time")
                .expect("wire closed");
            if let Message::Text(t) = msg {
                return serde_json::from_str(t.as_str()).unwrap();
            }
        }
    }

    async fn drain_until_close(wire: &mut Wire) -> Vec<Message> {
        let mut seen = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_secs(5), wire.next()).await {
            let done = matches!(msg, Message::Close(_));
            seen.push(msg);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_update_is_acked_and_relayed() {
        let h = harness();
        let (a_in, mut a_wire, _a, _) = connect(&h, 1, true, limits()).await;
        let (_b_in, mut b_wire, _b, _) = connect(&h, 2, true, limits()).await;
        assert!(matches!(next_frame(&mut a_wire).await, ServerFrame::JoinState { seq: 0, .. }));
        assert!(matches!(next_frame(&mut b_wire).await, ServerFrame::JoinState { seq: 0, .. }));

        a_in.unbounded_send(text(r#"{"type":"update","payload":"VTE="}"#)).unwrap();

        assert_eq!(next_frame(&mut a_wire).await, ServerFrame::Ack { seq: 1 });
        assert_eq!(
            next_frame(&mut b_wire).await,
            ServerFrame::Update {
                seq: 1,
                author: UserId::new("user-1"),
                fragment: b"U1".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn test_sync_sends_fresh_join_state() {
        let h = harness();
        let (a_in, mut a_wire, _a, _) = connect(&h, 1, true, limits()).await;
        next_frame(&mut a_wire).await;

        a_in.unbounded_send(text(r#"{"type":"update","payload":"eA=="}"#)).unwrap();
        assert_eq!(next_frame(&mut a_wire).await, ServerFrame::Ack { seq: 1 });
        a_in.unbounded_send(text(r#"{"type":"sync"}"#)).unwrap();
        assert_eq!(
            next_frame(&mut a_wire).await,
            ServerFrame::JoinState {
                state: b"x".to_vec(),
                seq: 1
            }
        );
    }

    #[tokio::test]
    async fn test_read_only_session_cannot_submit() {
        let h = harness();
        let (a_in, mut a_wire, _a, _) = connect(&h, 1, false, limits()).await;
        next_frame(&mut a_wire).await;

        a_in.unbounded_send(text(r#"{"type":"update","payload":"eA=="}"#)).unwrap();
        match next_frame(&mut a_wire).await {
            ServerFrame::Error { kind, .. } => assert_eq!(kind, "forbidden"),
            other => panic!("expected error frame, got {other:?}"),
        }
        let page = PageId::new("page-42");
        assert_eq!(h.log.inner.last_seq(&page).await.unwrap(), None);

        // Still connected and able to resync.
        a_in.unbounded_send(text(r#"{"type":"sync"}"#)).unwrap();
        assert!(matches!(next_frame(&mut a_wire).await, ServerFrame::JoinState { .. }));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_reported_only_to_submitter() {
        let h = harness();
        let (a_in, mut a_wire, _a, a_state) = connect(&h, 1, true, limits()).await;
        let (_b_in, mut b_wire, _b, _) = connect(&h, 2, true, limits()).await;
        next_frame(&mut a_wire).await;
        next_frame(&mut b_wire).await;

        h.log.set_failing(true);
        a_in.unbounded_send(text(r#"{"type":"update","payload":"eA=="}"#)).unwrap();
        match next_frame(&mut a_wire).await {
            ServerFrame::Error { kind, .. } => assert_eq!(kind, "persistence"),
            other => panic!("expected error frame, got {other:?}"),
        }
        assert_eq!(*a_state.lock(), SessionState::Open);
        assert!(b_wire.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_session() {
        let h = harness();
        let (a_in, mut a_wire, a_task, a_state) = connect(&h, 1, true, limits()).await;
        next_frame(&mut a_wire).await;

        a_in.unbounded_send(text(r#"{"type":"explode"}"#)).unwrap();
        a_task.await.unwrap();

        let rest = drain_until_close(&mut a_wire).await;
        assert!(matches!(rest.last(), Some(Message::Close(_))));
        let error_frame = rest.iter().find_map(|m| match m {
            Message::Text(t) => serde_json::from_str::<ServerFrame>(t.as_str()).ok(),
            _ => None,
        });
        assert!(matches!(error_frame, Some(ServerFrame::Error { ref kind, .. }) if kind == "protocol"));

        assert_eq!(*a_state.lock(), SessionState::Closed);
        let room = PageId::new("page-42");
        assert_eq!(h.coordinator.manager().room_size(&room).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oversized_and_binary_frames_close_session() {
        let h = harness();
        let (a_in, mut a_wire, a_task, _) = connect(&h, 1, true, limits()).await;
        next_frame(&mut a_wire).await;
        a_in.unbounded_send(text(&"x".repeat(65))).unwrap();
        a_task.await.unwrap();
        match next_frame(&mut a_wire).await {
            ServerFrame::Error { kind, .. } => assert_eq!(kind, "connection"),
            other => panic!("expected error frame, got {other:?}"),
        }

        let (b_in, mut b_wire, b_task, _) = connect(&h, 2, true, limits()).await;
        next_frame(&mut b_wire).await;
        b_in.unbounded_send(Ok(Message::Binary(Bytes::from_static(b"raw")))).unwrap();
        b_task.await.unwrap();
        match next_frame(&mut b_wire).await {
            ServerFrame::Error { kind, .. } => assert_eq!(kind, "protocol"),
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_unregisters() {
        let h = harness();
        let (a_in, mut a_wire, a_task, a_state) = connect(&h, 1, true, limits()).await;
        next_frame(&mut a_wire).await;

        a_in.unbounded_send(Ok(Message::Close(None))).unwrap();
        a_task.await.unwrap();
        assert_eq!(*a_state.lock(), SessionState::Closed);
        let room = PageId::new("page-42");
        assert_eq!(h.coordinator.manager().room_size(&room).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_loop_pings_and_idle_peer_times_out() {
        let h = harness();
        let limits = SessionLimits {
            ping_interval: Duration::from_secs(3),
            pong_wait: Duration::from_secs(8),
            ..limits()
        };
        let (_a_in, mut a_wire, a_task, _) = connect(&h, 1, true, limits).await;
        next_frame(&mut a_wire).await;

        let seen = drain_until_close(&mut a_wire).await;
        assert!(seen.iter().any(|m| matches!(m, Message::Ping(_))));
        a_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_session_alive() {
        let h = harness();
        let limits = SessionLimits {
            ping_interval: Duration::from_secs(3),
            pong_wait: Duration::from_secs(8),
            ..limits()
        };
        let (a_in, mut a_wire, a_task, a_state) = connect(&h, 1, true, limits).await;
        next_frame(&mut a_wire).await;

        // Four pong waits' worth of time, answering every few seconds.
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(4)).await;
            a_in.unbounded_send(Ok(Message::Pong(Bytes::new()))).unwrap();
        }
        tokio::task::yield_now().await;
        assert_eq!(*a_state.lock(), SessionState::Open);
        assert!(!a_task.is_finished());
        let room = PageId::new("page-42");
        assert_eq!(h.coordinator.manager().room_size(&room).await.unwrap(), 1);

        // Silence lets the deadline lapse.
        let seen = drain_until_close(&mut a_wire).await;
        assert!(matches!(seen.last(), Some(Message::Close(_))));
        a_task.await.unwrap();
        assert_eq!(*a_state.lock(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_zero_ping_interval_still_delivers() {
        let h = harness();
        let limits = SessionLimits {
            ping_interval: Duration::ZERO,
            ..limits()
        };
        let (a_in, mut a_wire, a_task, a_state) = connect(&h, 1, true, limits).await;
        assert!(matches!(next_frame(&mut a_wire).await, ServerFrame::JoinState { .. }));

        a_in.unbounded_send(text(r#"{"type":"update","payload":"eA=="}"#)).unwrap();
        assert_eq!(next_frame(&mut a_wire).await, ServerFrame::Ack { seq: 1 });
        assert_eq!(*a_state.lock(), SessionState::Open);

        h.shutdown.cancel();
        a_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let h = harness();
        let (_a_in, mut a_wire, a_task, a_state) = connect(&h, 1, true, limits()).await;
        next_frame(&mut a_wire).await;

        h.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), a_task)
            .await
            .expect("session did not stop")
            .unwrap();
        assert_eq!(*a_state.lock(), SessionState::Closed);
    }
}
