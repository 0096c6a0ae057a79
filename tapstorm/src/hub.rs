//! Broadcast hub: live connection registry and per-room fan-out.
//!
//! The hub never blocks a room's critical path. Every connection owns a
//! bounded outbound queue; fan-out uses `try_send` and a full queue drops
//! the connection instead of backpressuring the room. One live connection
//! per user: a reconnect replaces the previous registration and the stale
//! session's cleanup becomes a no-op.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use dashmap::DashMap;
use tapstorm_utils::{unix_ms, RoomId, UserId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use warp::ws::Message;

use crate::{metrics, protocol::ServerMessage};

pub struct ClientConnection {
    pub user: UserId,
    pub seq: u64,
    outbound: mpsc::Sender<Message>,
    close: Mutex<Option<oneshot::Sender<()>>>,
    last_seen_ms: AtomicU64,
}

impl ClientConnection {
    pub fn touch(&self) {
        self.last_seen_ms.store(unix_ms(), Ordering::Release);
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen_ms.load(Ordering::Acquire))
    }

    /// Queue a frame without blocking. `false` means the queue was full or
    /// the session is gone.
    fn try_send(&self, message: Message) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    /// Ask the session's writer task to close the socket.
    pub fn force_close(&self) {
        let sender = self.close.lock().ok().and_then(|mut guard| guard.take());
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

pub struct SessionChannels {
    pub connection: Arc<ClientConnection>,
    pub outbound: mpsc::Receiver<Message>,
    pub close: oneshot::Receiver<()>,
}

pub struct BroadcastHub {
    connections: DashMap<UserId, Arc<ClientConnection>>,
    members: DashMap<RoomId, HashSet<UserId>>,
    queue_size: usize,
    next_seq: AtomicU64,
}

impl BroadcastHub {
    pub fn new(queue_size: usize) -> Self {
        Self {
            connections: DashMap::new(),
            members: DashMap::new(),
            queue_size,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Register a live connection for `user`. The newest connection wins:
    /// any previous one is closed and replaced.
    pub fn register(&self, user: UserId) -> SessionChannels {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.queue_size);
        let (close_tx, close_rx) = oneshot::channel();
        let connection = Arc::new(ClientConnection {
            user,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            outbound: outbound_tx,
            close: Mutex::new(Some(close_tx)),
            last_seen_ms: AtomicU64::new(unix_ms()),
        });
        if let Some(previous) = self.connections.insert(user, connection.clone()) {
            debug!(%user, "replacing existing connection");
            previous.force_close();
        } else {
            metrics::CONNECTED_CLIENTS.inc();
        }
        SessionChannels {
            connection,
            outbound: outbound_rx,
            close: close_rx,
        }
    }

    /// Drop the registration owned by `seq`. Returns the rooms the user was
    /// joined to so the caller can run best-effort leave cleanup; an empty
    /// list means a newer connection took over and nothing should be torn
    /// down.
    pub fn unregister(&self, user: UserId, seq: u64) -> Vec<RoomId> {
        let removed = self
            .connections
            .remove_if(&user, |_, connection| connection.seq == seq);
        if removed.is_none() {
            return Vec::new();
        }
        metrics::CONNECTED_CLIENTS.dec();
        let rooms = self.rooms_of(user);
        for room in &rooms {
            self.leave_room(*room, user);
        }
        rooms
    }

    pub fn connection(&self, user: UserId) -> Option<Arc<ClientConnection>> {
        self.connections.get(&user).map(|c| c.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn join_room(&self, room: RoomId, user: UserId) {
        self.members.entry(room).or_default().insert(user);
    }

    pub fn leave_room(&self, room: RoomId, user: UserId) {
        if let Some(mut members) = self.members.get_mut(&room) {
            members.remove(&user);
        }
    }

    /// Forget a room entirely (deletion or settlement).
    pub fn drop_room(&self, room: RoomId) {
        self.members.remove(&room);
    }

    pub fn members_of(&self, room: RoomId) -> Vec<UserId> {
        self.members
            .get(&room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, user: UserId) -> Vec<RoomId> {
        self.members
            .iter()
            .filter(|entry| entry.value().contains(&user))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Fan an event out to every live connection in the room. Serializes
    /// once; connections that cannot keep up are dropped.
    pub fn broadcast(&self, room: RoomId, message: &ServerMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%room, "failed to serialize broadcast: {e}");
                return;
            }
        };
        for user in self.members_of(room) {
            if let Some(connection) = self.connection(user) {
                if !connection.try_send(Message::text(payload.clone())) {
                    metrics::BROADCAST_DROPPED.inc();
                    warn!(%room, %user, "outbound queue full, dropping connection");
                    connection.force_close();
                }
            }
        }
    }

    /// Send to a single user, e.g. soft error replies.
    pub fn send_to(&self, user: UserId, message: &ServerMessage) -> bool {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(_) => return false,
        };
        match self.connection(user) {
            Some(connection) => connection.try_send(Message::text(payload)),
            None => false,
        }
    }

    /// Periodic liveness probing: ping every connection and forcibly close
    /// any that have been silent past the timeout. The closed session's own
    /// task performs the disconnect cleanup.
    pub async fn run_liveness(self: Arc<Self>, ping_interval: Duration, timeout: Duration) {
        let mut interval = tokio::time::interval(ping_interval);
        loop {
            interval.tick().await;
            let now_ms = unix_ms();
            let connections: Vec<Arc<ClientConnection>> =
                self.connections.iter().map(|c| c.value().clone()).collect();
            for connection in connections {
                if connection.idle_ms(now_ms) > timeout.as_millis() as u64 {
                    debug!(user = %connection.user, "liveness timeout, closing connection");
                    connection.force_close();
                } else {
                    connection.try_send(Message::ping(Vec::new()));
                }
            }
        }
    }
}
