//! Room/connection manager.
//!
//! A single task owns the room registry. Every mutation and every broadcast
//! arrives as a [`Command`] over one channel, so registry state is never
//! shared. Delivery to a session is a non-blocking `try_send` into its
//! bounded outbound queue; a full queue drops that one frame for that one
//! recipient.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pagewiki_types::{PageId, SessionId, UserId};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CollabError, Result};
use crate::protocol::ServerFrame;

/// Frames are shared between every recipient of a broadcast.
pub type Outbound = Arc<ServerFrame>;

const COMMAND_BUFFER: usize = 1024;

/// The manager's view of a live session: identity plus the sending half of
/// its outbound queue. Dropping the handle closes the queue.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub user: UserId,
    pub room: PageId,
    tx: mpsc::Sender<Outbound>,
}

/// Result of offering one frame to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Queue was full; the frame was discarded for this recipient.
    Dropped,
    /// The session's writer is gone.
    Closed,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        user: UserId,
        room: PageId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id,
                user,
                room,
                tx,
            },
            rx,
        )
    }

    pub fn try_deliver(&self, frame: Outbound) -> Delivery {
        match self.tx.try_send(frame) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    /// The session id was already present; the original entry is kept.
    AlreadyRegistered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub rooms: usize,
    pub sessions: usize,
}

enum Command {
    Register {
        handle: SessionHandle,
        reply: oneshot::Sender<Registration>,
    },
    Unregister {
        session: SessionId,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        room: PageId,
        frame: Outbound,
        exclude: Option<SessionId>,
        reply: oneshot::Sender<BroadcastReport>,
    },
    SendTo {
        session: SessionId,
        frame: Outbound,
        reply: oneshot::Sender<Delivery>,
    },
    RoomSize {
        room: PageId,
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<ManagerStats>,
    },
}

/// Cloneable front door to the manager task.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl ManagerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| CollabError::ManagerClosed)?;
        rx.await.map_err(|_| CollabError::ManagerClosed)
    }

    /// Add a session to its room, creating the room if needed.
    pub async fn register(&self, handle: SessionHandle) -> Result<Registration> {
        self.request(|reply| Command::Register { handle, reply }).await
    }

    /// Remove a session and close its outbound queue. Returns `false` if it
    /// was not registered.
    pub async fn unregister(&self, session: SessionId) -> Result<bool> {
        self.request(|reply| Command::Unregister { session, reply })
            .await
    }

    /// Offer `frame` to every member of `room` except `exclude`.
    pub async fn broadcast(
        &self,
        room: &PageId,
        frame: ServerFrame,
        exclude: Option<SessionId>,
    ) -> Result<BroadcastReport> {
        let room = room.clone();
        let frame = Arc::new(frame);
        self.request(|reply| Command::Broadcast {
            room,
            frame,
            exclude,
            reply,
        })
        .await
    }

    /// Offer `frame` to a single registered session.
    pub async fn send_to(&self, session: SessionId, frame: ServerFrame) -> Result<Delivery> {
        let frame = Arc::new(frame);
        self.request(|reply| Command::SendTo {
            session,
            frame,
            reply,
        })
        .await
    }

    pub async fn room_size(&self, room: &PageId) -> Result<usize> {
        let room = room.clone();
        self.request(|reply| Command::RoomSize { room, reply }).await
    }

    pub async fn stats(&self) -> Result<ManagerStats> {
        self.request(|reply| Command::Stats { reply }).await
    }
}

#[derive(Default)]
struct Registry {
    rooms: HashMap<PageId, HashMap<SessionId, SessionHandle>>,
    session_rooms: HashMap<SessionId, PageId>,
}

impl Registry {
    fn register(&mut self, handle: SessionHandle) -> Registration {
        if self.session_rooms.contains_key(&handle.id) {
            return Registration::AlreadyRegistered;
        }
        self.session_rooms.insert(handle.id, handle.room.clone());
        self.rooms
            .entry(handle.room.clone())
            .or_default()
            .insert(handle.id, handle);
        Registration::Registered
    }

    fn unregister(&mut self, session: SessionId) -> Option<SessionHandle> {
        let room = self.session_rooms.remove(&session)?;
        let members = self.rooms.get_mut(&room)?;
        let handle = members.remove(&session);
        if members.is_empty() {
            self.rooms.remove(&room);
            debug!(%room, "room emptied");
        }
        handle
    }

    fn broadcast(
        &self,
        room: &PageId,
        frame: &Outbound,
        exclude: Option<SessionId>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let Some(members) = self.rooms.get(room) else {
            return report;
        };
        for (id, handle) in members {
            if Some(*id) == exclude {
                continue;
            }
            match handle.try_deliver(frame.clone()) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Dropped => {
                    report.dropped += 1;
                    debug!(session = %id, %room, "outbound queue full, frame dropped");
                }
                Delivery::Closed => {}
            }
        }
        report
    }

    fn send_to(&self, session: SessionId, frame: Outbound) -> Delivery {
        self.session_rooms
            .get(&session)
            .and_then(|room| self.rooms.get(room))
            .and_then(|members| members.get(&session))
            .map(|handle| handle.try_deliver(frame))
            .unwrap_or(Delivery::Closed)
    }

    /// Drop members whose writer has already gone away.
    fn prune_closed(&mut self) -> usize {
        let stale: Vec<SessionId> = self
            .rooms
            .values()
            .flat_map(|members| members.values())
            .filter(|handle| handle.is_closed())
            .map(|handle| handle.id)
            .collect();
        for id in &stale {
            self.unregister(*id);
        }
        stale.len()
    }

    fn stats(&self) -> ManagerStats {
        ManagerStats {
            rooms: self.rooms.len(),
            sessions: self.session_rooms.len(),
        }
    }
}

pub struct RoomManager {
    rx: mpsc::Receiver<Command>,
    registry: Registry,
    tick_interval: Duration,
}

impl RoomManager {
    /// Start the manager task. It stops when `cancel` fires or every
    /// [`ManagerHandle`] is dropped; either way all queues are closed.
    pub fn spawn(
        tick_interval: Duration,
        cancel: CancellationToken,
    ) -> (ManagerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let manager = RoomManager {
            rx,
            registry: Registry::default(),
            tick_interval,
        };
        let task = tokio::spawn(manager.run(cancel));
        (ManagerHandle { tx }, task)
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.tick_interval,
            self.tick_interval,
        );
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tick.tick() => {
                    let pruned = self.registry.prune_closed();
                    let stats = self.registry.stats();
                    debug!(rooms = stats.rooms, sessions = stats.sessions, pruned, "manager tick");
                }
            }
        }

        let stats = self.registry.stats();
        // Dropping every handle closes every outbound queue.
        self.registry = Registry::default();
        info!(rooms = stats.rooms, sessions = stats.sessions, "room manager stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register { handle, reply } => {
                let (id, room) = (handle.id, handle.room.clone());
                let outcome = self.registry.register(handle);
                if outcome == Registration::AlreadyRegistered {
                    warn!(session = %id, %room, "session already registered");
                } else {
                    debug!(session = %id, %room, "session registered");
                }
                let _ = reply.send(outcome);
            }
            Command::Unregister { session, reply } => {
                let removed = self.registry.unregister(session).is_some();
                if removed {
                    debug!(%session, "session unregistered");
                }
                let _ = reply.send(removed);
            }
            Command::Broadcast {
                room,
                frame,
                exclude,
                reply,
            } => {
                let _ = reply.send(self.registry.broadcast(&room, &frame, exclude));
            }
            Command::SendTo {
                session,
                frame,
                reply,
            } => {
                let _ = reply.send(self.registry.send_to(session, frame));
            }
            Command::RoomSize { room, reply } => {
                let size = self.registry.rooms.get(&room).map_or(0, HashMap::len);
                let _ = reply.send(size);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.registry.stats());
            }
        }
    }
}
