use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Serialized outbound frame, shared between every recipient of one event.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Connection {
    user_id: Uuid,
    outbox: mpsc::Sender<Frame>,
    rooms: HashSet<Uuid>,
}

/// A subscribed connection as seen by one broadcast.
#[derive(Clone)]
pub(crate) struct Recipient {
    pub(crate) id: ConnectionId,
    pub(crate) user_id: Uuid,
    pub(crate) outbox: mpsc::Sender<Frame>,
}

#[derive(Default)]
struct Index {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<Uuid, HashSet<ConnectionId>>,
    users: HashMap<Uuid, HashSet<ConnectionId>>,
}

impl Index {
    fn detach(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;

        for room_id in &connection.rooms {
            if let Some(subscribers) = self.rooms.get_mut(room_id) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    self.rooms.remove(room_id);
                }
            }
        }

        if let Some(owned) = self.users.get_mut(&connection.user_id) {
            owned.remove(&id);
            if owned.is_empty() {
                self.users.remove(&connection.user_id);
            }
        }

        Some(connection)
    }
}

/// Live chat sockets and the rooms each one listens to.
///
/// Routing index only: it is empty at startup and never consulted for membership.
/// Every operation takes the lock briefly and never awaits I/O while holding it.
pub struct Registry {
    index: RwLock<Index>,
    outbox_capacity: usize,
}

impl Registry {
    pub fn new(outbox_capacity: usize) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            outbox_capacity: outbox_capacity.max(1),
        }
    }

    /// Adds a connection for `user_id` and hands back the receiving end of its
    /// bounded outbound queue.
    pub async fn register(&self, user_id: Uuid) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (outbox, inbox) = mpsc::channel(self.outbox_capacity);
        let id = ConnectionId::new();

        let mut index = self.index.write().await;
        index.connections.insert(
            id,
            Connection {
                user_id,
                outbox,
                rooms: HashSet::new(),
            },
        );
        index.users.entry(user_id).or_default().insert(id);

        tracing::debug!(connection = %id, %user_id, total = index.connections.len(), "registered connection");
        (id, inbox)
    }

    /// Drops the connection and every subscription it held. Dropping its outbox
    /// ends the connection's writer. Returns whether it was registered.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut index = self.index.write().await;
        match index.detach(id) {
            Some(connection) => {
                tracing::debug!(
                    connection = %id,
                    user_id = %connection.user_id,
                    rooms = connection.rooms.len(),
                    "unregistered connection"
                );
                true
            }
            None => false,
        }
    }

    /// Returns whether a new subscription was added.
    pub async fn subscribe(&self, id: ConnectionId, room_id: Uuid) -> bool {
        let mut index = self.index.write().await;
        let Some(connection) = index.connections.get_mut(&id) else {
            return false;
        };
        if !connection.rooms.insert(room_id) {
            return false;
        }
        index.rooms.entry(room_id).or_default().insert(id);

        tracing::debug!(connection = %id, %room_id, "subscribed");
        true
    }

    /// Returns whether a subscription was removed.
    pub async fn unsubscribe(&self, id: ConnectionId, room_id: Uuid) -> bool {
        let mut index = self.index.write().await;
        let Some(connection) = index.connections.get_mut(&id) else {
            return false;
        };
        if !connection.rooms.remove(&room_id) {
            return false;
        }
        if let Some(subscribers) = index.rooms.get_mut(&room_id) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                index.rooms.remove(&room_id);
            }
        }

        tracing::debug!(connection = %id, %room_id, "unsubscribed");
        true
    }

    pub(crate) async fn recipients(&self, room_id: Uuid) -> Vec<Recipient> {
        let index = self.index.read().await;
        let Some(subscribers) = index.rooms.get(&room_id) else {
            return Vec::new();
        };

        subscribers
            .iter()
            .filter_map(|id| {
                index.connections.get(id).map(|connection| Recipient {
                    id: *id,
                    user_id: connection.user_id,
                    outbox: connection.outbox.clone(),
                })
            })
            .collect()
    }

    pub async fn connections_of(&self, user_id: Uuid) -> Vec<ConnectionId> {
        let index = self.index.read().await;
        index
            .users
            .get(&user_id)
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn user_of(&self, id: ConnectionId) -> Option<Uuid> {
        let index = self.index.read().await;
        index.connections.get(&id).map(|connection| connection.user_id)
    }

    pub async fn is_subscribed(&self, id: ConnectionId, room_id: Uuid) -> bool {
        let index = self.index.read().await;
        index
            .connections
            .get(&id)
            .is_some_and(|connection| connection.rooms.contains(&room_id))
    }

    pub async fn subscriber_count(&self, room_id: Uuid) -> usize {
        let index = self.index.read().await;
        index.rooms.get(&room_id).map_or(0, HashSet::len)
    }

    pub async fn connection_count(&self) -> usize {
        self.index.read().await.connections.len()
    }

    /// Force-closes every connection of `user_id`, e.g. after logout.
    pub async fn disconnect_user(&self, user_id: Uuid) -> usize {
        let mut index = self.index.write().await;
        let owned: Vec<ConnectionId> = index
            .users
            .get(&user_id)
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default();
        for id in &owned {
            index.detach(*id);
        }

        if !owned.is_empty() {
            tracing::info!(%user_id, closed = owned.len(), "disconnected user");
        }
        owned.len()
    }

    /// Empties the registry, closing every connection. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let mut index = self.index.write().await;
        let closed = index.connections.len();
        *index = Index::default();
        closed
    }
}
