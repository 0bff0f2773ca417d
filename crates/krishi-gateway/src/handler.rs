use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use krishi_db::chat::NewMessage;
use krishi_db::{Database, DomainError};
use krishi_types::auth::{TokenError, TokenSigner};
use krishi_types::events::{ClientEvent, NotificationKind, ServerEvent};
use krishi_types::models::Message;

use crate::rooms::{ConnId, Room, Rooms};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Authentication required")]
    MissingToken,
    #[error("Authentication error: {0}")]
    Token(#[from] TokenError),
    #[error("User not found")]
    UnknownUser,
    #[error("Account is disabled")]
    Disabled,
    #[error(transparent)]
    Store(#[from] DomainError),
}

/// One authenticated connection as seen by the event handlers.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub conn_id: ConnId,
    pub user_id: Uuid,
}

/// Realtime hub: handshake, room membership and message fan-out.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    db: Arc<Database>,
    signer: TokenSigner,
    rooms: Rooms,
    /// conversation_id -> lock held across persist + broadcast
    send_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Gateway {
    pub fn new(db: Arc<Database>, signer: TokenSigner) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                db,
                signer,
                rooms: Rooms::new(),
                send_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn rooms(&self) -> &Rooms {
        &self.inner.rooms
    }

    /// Resolve a handshake token to an active, unbanned user.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Uuid, HandshakeError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(HandshakeError::MissingToken)?;
        let claims = self.inner.signer.verify_access(token)?;

        let user_id = claims.sub;
        let user = self
            .inner
            .db
            .call(move |db| db.find_user(user_id))
            .await?
            .ok_or(HandshakeError::UnknownUser)?;
        if !user.is_active || user.is_banned {
            return Err(HandshakeError::Disabled);
        }
        Ok(user.id)
    }

    /// Register a connection; it starts in the user's private room and
    /// receives `ready` first.
    pub async fn attach(&self, user_id: Uuid) -> (Session, mpsc::UnboundedReceiver<ServerEvent>) {
        let (conn_id, rx) = self.inner.rooms.register(user_id).await;
        let session = Session { conn_id, user_id };
        self.inner.rooms.send_to(conn_id, ServerEvent::Ready { user_id }).await;
        info!("{} connected to gateway (conn {})", user_id, conn_id);
        (session, rx)
    }

    pub async fn detach(&self, session: &Session) {
        self.inner.rooms.unregister(session.conn_id).await;
        info!("{} disconnected from gateway (conn {})", session.user_id, session.conn_id);
    }

    /// Process one client event. Failures are reported to this connection
    /// only and never tear it down.
    pub async fn handle_event(&self, session: &Session, event: ClientEvent) {
        let result = match event {
            ClientEvent::ConversationJoin { conversation_id } => self.join(session, conversation_id).await,
            ClientEvent::ConversationLeave { conversation_id } => {
                let room = Room::Conversation(conversation_id);
                self.inner.rooms.leave(session.conn_id, room).await;
                debug!("{} left {}", session.conn_id, room);
                self.reply(session, ServerEvent::ConversationLeft { conversation_id }).await;
                Ok(())
            }
            ClientEvent::MessageSend {
                conversation_id,
                kind,
                content,
                reply_to,
                client_ref,
            } => {
                let message = NewMessage {
                    kind,
                    content,
                    reply_to,
                };
                self.send_message(session.user_id, conversation_id, message, client_ref)
                    .await
                    .map(|_| ())
            }
            ClientEvent::TypingStart { conversation_id } => {
                let event = ServerEvent::UserTyping {
                    user_id: session.user_id,
                    conversation_id,
                };
                self.relay_typing(session, conversation_id, event).await;
                Ok(())
            }
            ClientEvent::TypingStop { conversation_id } => {
                let event = ServerEvent::UserStoppedTyping {
                    user_id: session.user_id,
                    conversation_id,
                };
                self.relay_typing(session, conversation_id, event).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!("{} event rejected: {}", session.user_id, e);
            self.reply(session, ServerEvent::error(client_message(&e))).await;
        }
    }

    /// Join a conversation room after an authoritative participancy check.
    async fn join(&self, session: &Session, conversation_id: Uuid) -> Result<(), DomainError> {
        let user_id = session.user_id;
        let allowed = self
            .inner
            .db
            .call(move |db| db.is_participant(conversation_id, user_id))
            .await?;
        if !allowed {
            return Err(DomainError::forbidden("Not a participant of this conversation"));
        }

        let room = Room::Conversation(conversation_id);
        self.inner.rooms.join(session.conn_id, room).await;
        debug!("{} joined {}", session.conn_id, room);
        self.reply(session, ServerEvent::ConversationJoined { conversation_id }).await;
        Ok(())
    }

    /// Persist a message and broadcast it to the conversation room. Sends to
    /// the same conversation are serialized so that broadcast order matches
    /// persistence order. Nothing is broadcast when persistence fails.
    pub async fn send_message(
        &self,
        sender: Uuid,
        conversation_id: Uuid,
        message: NewMessage,
        client_ref: Option<String>,
    ) -> Result<Message, DomainError> {
        let lock = self.send_lock(conversation_id).await;
        let _guard = lock.lock().await;

        let created = self
            .inner
            .db
            .call(move |db| db.create_message(conversation_id, sender, &message))
            .await?;

        let event = ServerEvent::MessageNew {
            message: Box::new(created.clone()),
            client_ref,
        };
        let delivered = self
            .inner
            .rooms
            .emit(Room::Conversation(conversation_id), &event)
            .await;
        debug!("message {} delivered to {} connections", created.id, delivered);
        Ok(created)
    }

    /// Typing relays reach the other members of the room, and only when the
    /// sender's connection has joined it.
    async fn relay_typing(&self, session: &Session, conversation_id: Uuid, event: ServerEvent) {
        let room = Room::Conversation(conversation_id);
        if !self.inner.rooms.is_member(session.conn_id, room).await {
            return;
        }
        self.inner.rooms.emit_except(room, session.conn_id, &event).await;
    }

    /// Deliver an out-of-band notification to every connection of `user_id`.
    pub async fn notify(&self, user_id: Uuid, kind: NotificationKind, actor_id: Uuid, entity_id: Uuid) {
        if user_id == actor_id {
            return;
        }
        let event = ServerEvent::Notification {
            kind,
            actor_id,
            entity_id,
        };
        self.inner.rooms.emit(Room::User(user_id), &event).await;
    }

    /// Drop a removed participant's live subscriptions to a conversation.
    pub async fn participant_removed(&self, conversation_id: Uuid, user_id: Uuid) {
        let evicted = self
            .inner
            .rooms
            .evict_user(Room::Conversation(conversation_id), user_id)
            .await;
        for conn_id in evicted {
            self.inner
                .rooms
                .send_to(conn_id, ServerEvent::ConversationLeft { conversation_id })
                .await;
        }
    }

    async fn reply(&self, session: &Session, event: ServerEvent) {
        if !self.inner.rooms.send_to(session.conn_id, event).await {
            warn!("{} connection {} is gone, dropping reply", session.user_id, session.conn_id);
        }
    }

    async fn send_lock(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.inner.send_locks.lock().await;
        // Prune locks nobody is holding or waiting on.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(conversation_id).or_default().clone()
    }
}

/// Store failures are not echoed verbatim to clients.
fn client_message(err: &DomainError) -> String {
    match err {
        DomainError::Database(_) | DomainError::Internal(_) => "Internal server error".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use krishi_db::models::PendingRegistration;
    use krishi_types::models::{ConversationType, MessageContent, MessageType};

    use super::*;

    struct Fixture {
        gateway: Gateway,
        db: Arc<Database>,
        signer: TokenSigner,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let signer = TokenSigner::new("a", "r", Duration::days(1), Duration::days(30));
        Fixture {
            gateway: Gateway::new(db.clone(), signer.clone()),
            db,
            signer,
        }
    }

    fn user(db: &Database, phone: &str) -> Uuid {
        db.create_user(&PendingRegistration {
            phone_number: phone.into(),
            name: format!("Farmer {}", phone),
            password_hash: "hash".into(),
            location: None,
        })
        .unwrap()
        .id
    }

    fn send_to(conversation_id: Uuid, body: &str) -> ClientEvent {
        ClientEvent::MessageSend {
            conversation_id,
            kind: MessageType::Text,
            content: MessageContent {
                text: Some(body.into()),
                media: None,
            },
            reply_to: None,
            client_ref: Some("c-1".into()),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(serde_json::to_value(ev).unwrap());
        }
        out
    }

    fn types(events: &[serde_json::Value]) -> Vec<String> {
        events.iter().map(|e| e["type"].as_str().unwrap().to_string()).collect()
    }

    #[tokio::test]
    async fn handshake_rejects_missing_bad_and_unknown() {
        let f = fixture();
        assert!(matches!(f.gateway.authenticate(None).await, Err(HandshakeError::MissingToken)));
        assert!(matches!(
            f.gateway.authenticate(Some("garbage")).await,
            Err(HandshakeError::Token(TokenError::Invalid))
        ));
        let stranger = f.signer.issue_access(Uuid::new_v4()).unwrap();
        assert!(matches!(
            f.gateway.authenticate(Some(&stranger)).await,
            Err(HandshakeError::UnknownUser)
        ));

        let id = user(&f.db, "9000000001");
        let token = f.signer.issue_access(id).unwrap();
        assert_eq!(f.gateway.authenticate(Some(&token)).await.unwrap(), id);
    }

    #[tokio::test]
    async fn handshake_rejects_inactive_users() {
        let f = fixture();
        let id = user(&f.db, "9000000001");
        f.db.with_conn(|conn| {
            conn.execute("UPDATE users SET is_active = 0 WHERE id = ?1", [id.to_string()])?;
            Ok(())
        })
        .unwrap();
        let token = f.signer.issue_access(id).unwrap();
        assert!(matches!(
            f.gateway.authenticate(Some(&token)).await,
            Err(HandshakeError::Disabled)
        ));
    }

    #[tokio::test]
    async fn ready_is_the_first_event() {
        let f = fixture();
        let id = user(&f.db, "9000000001");
        let (_session, mut rx) = f.gateway.attach(id).await;
        let events = drain(&mut rx);
        assert_eq!(types(&events), vec!["ready"]);
        assert_eq!(events[0]["data"]["userId"], id.to_string());
    }

    #[tokio::test]
    async fn outsider_cannot_join() {
        let f = fixture();
        let a = user(&f.db, "9000000001");
        let b = user(&f.db, "9000000002");
        let c = user(&f.db, "9000000003");
        let (conv, _) = f.db.create_conversation(a, ConversationType::Direct, &[b], None).unwrap();

        let (session, mut rx) = f.gateway.attach(c).await;
        drain(&mut rx);
        f.gateway
            .handle_event(&session, ClientEvent::ConversationJoin { conversation_id: conv.id })
            .await;

        let events = drain(&mut rx);
        assert_eq!(types(&events), vec!["error"]);
        assert!(!f.gateway.rooms().is_member(session.conn_id, Room::Conversation(conv.id)).await);
    }

    #[tokio::test]
    async fn message_reaches_every_room_member_including_sender() {
        let f = fixture();
        let a = user(&f.db, "9000000001");
        let b = user(&f.db, "9000000002");
        let (conv, _) = f.db.create_conversation(a, ConversationType::Direct, &[b], None).unwrap();

        let (sa, mut rx_a) = f.gateway.attach(a).await;
        let (sb, mut rx_b) = f.gateway.attach(b).await;
        for s in [&sa, &sb] {
            f.gateway
                .handle_event(s, ClientEvent::ConversationJoin { conversation_id: conv.id })
                .await;
        }
        drain(&mut rx_a);
        drain(&mut rx_b);

        f.gateway.handle_event(&sa, send_to(conv.id, "mandi rate?")).await;

        let to_a = drain(&mut rx_a);
        let to_b = drain(&mut rx_b);
        assert_eq!(types(&to_a), vec!["message:new"]);
        assert_eq!(types(&to_b), vec!["message:new"]);
        assert_eq!(to_a[0]["data"]["clientRef"], "c-1");
        assert_eq!(to_b[0]["data"]["content"]["text"], "mandi rate?");
        assert_eq!(to_b[0]["data"]["sender"]["name"], "Farmer 9000000001");
    }

    #[tokio::test]
    async fn removed_participant_cannot_send_through_open_room() {
        let f = fixture();
        let a = user(&f.db, "9000000001");
        let b = user(&f.db, "9000000002");
        let c = user(&f.db, "9000000003");
        let (group, _) = f
            .db
            .create_conversation(a, ConversationType::Group, &[b, c], Some("Kisan"))
            .unwrap();

        let (sa, mut rx_a) = f.gateway.attach(a).await;
        let (sc, mut rx_c) = f.gateway.attach(c).await;
        for s in [&sa, &sc] {
            f.gateway
                .handle_event(s, ClientEvent::ConversationJoin { conversation_id: group.id })
                .await;
        }
        drain(&mut rx_a);
        drain(&mut rx_c);

        // removed in the store while the room subscription is still open
        f.db.remove_participant(group.id, a, c).unwrap();
        f.gateway.handle_event(&sc, send_to(group.id, "still here")).await;

        assert_eq!(types(&drain(&mut rx_c)), vec!["error"]);
        assert!(drain(&mut rx_a).is_empty());
        let history = f
            .db
            .messages(group.id, a, None, krishi_db::pagination::PageRequest::default())
            .unwrap();
        assert!(history.data.is_empty());
    }

    #[tokio::test]
    async fn eviction_stops_delivery_to_removed_participant() {
        let f = fixture();
        let a = user(&f.db, "9000000001");
        let b = user(&f.db, "9000000002");
        let (group, _) = f
            .db
            .create_conversation(a, ConversationType::Group, &[b], Some("Kisan"))
            .unwrap();
        let (sa, mut rx_a) = f.gateway.attach(a).await;
        let (sb, mut rx_b) = f.gateway.attach(b).await;
        for s in [&sa, &sb] {
            f.gateway
                .handle_event(s, ClientEvent::ConversationJoin { conversation_id: group.id })
                .await;
        }
        drain(&mut rx_a);
        drain(&mut rx_b);

        f.db.remove_participant(group.id, a, b).unwrap();
        f.gateway.participant_removed(group.id, b).await;
        assert_eq!(types(&drain(&mut rx_b)), vec!["conversation:left"]);

        f.gateway.handle_event(&sa, send_to(group.id, "after")).await;
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(types(&drain(&mut rx_a)), vec!["message:new"]);
    }

    #[tokio::test]
    async fn typing_is_relayed_to_others_only() {
        let f = fixture();
        let a = user(&f.db, "9000000001");
        let b = user(&f.db, "9000000002");
        let (conv, _) = f.db.create_conversation(a, ConversationType::Direct, &[b], None).unwrap();
        let (sa, mut rx_a) = f.gateway.attach(a).await;
        let (sb, mut rx_b) = f.gateway.attach(b).await;
        for s in [&sa, &sb] {
            f.gateway
                .handle_event(s, ClientEvent::ConversationJoin { conversation_id: conv.id })
                .await;
        }
        drain(&mut rx_a);
        drain(&mut rx_b);

        f.gateway
            .handle_event(&sa, ClientEvent::TypingStart { conversation_id: conv.id })
            .await;
        f.gateway
            .handle_event(&sa, ClientEvent::TypingStop { conversation_id: conv.id })
            .await;

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(types(&drain(&mut rx_b)), vec!["user:typing", "user:stopped-typing"]);
    }

    #[tokio::test]
    async fn concurrent_sends_broadcast_in_persistence_order() {
        let f = fixture();
        let a = user(&f.db, "9000000001");
        let b = user(&f.db, "9000000002");
        let (conv, _) = f.db.create_conversation(a, ConversationType::Direct, &[b], None).unwrap();
        let (sb, mut rx_b) = f.gateway.attach(b).await;
        f.gateway
            .handle_event(&sb, ClientEvent::ConversationJoin { conversation_id: conv.id })
            .await;
        drain(&mut rx_b);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let gateway = f.gateway.clone();
            let message = NewMessage {
                kind: MessageType::Text,
                content: MessageContent {
                    text: Some(format!("m{}", i)),
                    media: None,
                },
                reply_to: None,
            };
            tasks.push(tokio::spawn(async move {
                gateway.send_message(a, conv.id, message, None).await.unwrap()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let broadcast: Vec<String> = drain(&mut rx_b)
            .iter()
            .map(|e| e["data"]["id"].as_str().unwrap().to_string())
            .collect();
        let stored: Vec<String> = f
            .db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM messages WHERE conversation_id = ?1 ORDER BY rowid",
                )?;
                let ids = stmt
                    .query_map([conv.id.to_string()], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .unwrap();
        assert_eq!(broadcast.len(), 8);
        assert_eq!(broadcast, stored);
    }

    #[tokio::test]
    async fn notifications_target_the_user_room() {
        let f = fixture();
        let a = user(&f.db, "9000000001");
        let b = user(&f.db, "9000000002");
        let (_sb, mut rx_b) = f.gateway.attach(b).await;
        drain(&mut rx_b);

        f.gateway.notify(b, NotificationKind::NewFollower, a, a).await;
        f.gateway.notify(a, NotificationKind::NewFollower, a, a).await;

        let events = drain(&mut rx_b);
        assert_eq!(types(&events), vec!["notification"]);
        assert_eq!(events[0]["data"]["kind"], "new_follower");
    }
}
