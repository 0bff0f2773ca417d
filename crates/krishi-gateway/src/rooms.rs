use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use krishi_types::events::ServerEvent;

/// Identifier of a live connection. A user may hold several.
pub type ConnId = Uuid;

/// Named fan-out group. Every connection sits in its owner's user room;
/// conversation rooms are joined explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    User(Uuid),
    Conversation(Uuid),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Room::User(id) => write!(f, "user:{}", id),
            Room::Conversation(id) => write!(f, "conversation:{}", id),
        }
    }
}

struct Connection {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnId, Connection>,
    rooms: HashMap<Room, HashSet<ConnId>>,
}

impl Registry {
    fn join(&mut self, conn_id: ConnId, room: Room) -> bool {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        conn.rooms.insert(room);
        self.rooms.entry(room).or_default().insert(conn_id)
    }

    fn leave(&mut self, conn_id: ConnId, room: Room) -> bool {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.rooms.remove(&room);
        }
        let Some(members) = self.rooms.get_mut(&room) else {
            return false;
        };
        let removed = members.remove(&conn_id);
        if members.is_empty() {
            self.rooms.remove(&room);
        }
        removed
    }
}

/// Tracks live connections and their room memberships.
#[derive(Clone, Default)]
pub struct Rooms {
    inner: Arc<RwLock<Registry>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id` and join it to the user's private
    /// room. Returns the connection id and its outbound event stream.
    pub async fn register(&self, user_id: Uuid) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut reg = self.inner.write().await;
        reg.connections.insert(
            conn_id,
            Connection {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        reg.join(conn_id, Room::User(user_id));
        (conn_id, rx)
    }

    /// Drop a connection and every room membership it held.
    pub async fn unregister(&self, conn_id: ConnId) {
        let mut reg = self.inner.write().await;
        let Some(conn) = reg.connections.remove(&conn_id) else {
            return;
        };
        for room in conn.rooms {
            if let Some(members) = reg.rooms.get_mut(&room) {
                members.remove(&conn_id);
                if members.is_empty() {
                    reg.rooms.remove(&room);
                }
            }
        }
    }

    pub async fn join(&self, conn_id: ConnId, room: Room) -> bool {
        self.inner.write().await.join(conn_id, room)
    }

    pub async fn leave(&self, conn_id: ConnId, room: Room) -> bool {
        self.inner.write().await.leave(conn_id, room)
    }

    /// Remove every connection of `user_id` from `room`. Returns the evicted
    /// connection ids.
    pub async fn evict_user(&self, room: Room, user_id: Uuid) -> Vec<ConnId> {
        let mut reg = self.inner.write().await;
        let targets: Vec<ConnId> = reg
            .rooms
            .get(&room)
            .into_iter()
            .flatten()
            .filter(|id| reg.connections.get(id).is_some_and(|c| c.user_id == user_id))
            .copied()
            .collect();
        for conn_id in &targets {
            reg.leave(*conn_id, room);
        }
        targets
    }

    pub async fn is_member(&self, conn_id: ConnId, room: Room) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(&room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    /// Deliver to every connection in `room`. Returns how many were reached.
    pub async fn emit(&self, room: Room, event: &ServerEvent) -> usize {
        self.emit_filtered(room, None, event).await
    }

    /// Deliver to every connection in `room` except `skip`.
    pub async fn emit_except(&self, room: Room, skip: ConnId, event: &ServerEvent) -> usize {
        self.emit_filtered(room, Some(skip), event).await
    }

    /// Deliver to a single connection.
    pub async fn send_to(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        self.inner
            .read()
            .await
            .connections
            .get(&conn_id)
            .is_some_and(|c| c.tx.send(event).is_ok())
    }

    async fn emit_filtered(&self, room: Room, skip: Option<ConnId>, event: &ServerEvent) -> usize {
        let reg = self.inner.read().await;
        let Some(members) = reg.rooms.get(&room) else {
            return 0;
        };
        members
            .iter()
            .filter(|id| Some(**id) != skip)
            .filter_map(|id| reg.connections.get(id))
            .filter(|c| c.tx.send(event.clone()).is_ok())
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}
