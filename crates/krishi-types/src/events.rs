use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageContent, MessageType};

/// Events sent FROM client TO server over the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Subscribe this connection to a conversation room
    #[serde(rename = "conversation:join")]
    ConversationJoin { conversation_id: Uuid },

    /// Drop this connection's subscription to a conversation room
    #[serde(rename = "conversation:leave")]
    ConversationLeave { conversation_id: Uuid },

    /// Persist a message and fan it out to the conversation room
    #[serde(rename = "message:send")]
    MessageSend {
        conversation_id: Uuid,
        #[serde(default, rename = "type")]
        kind: MessageType,
        #[serde(default)]
        content: MessageContent,
        #[serde(default)]
        reply_to: Option<Uuid>,
        /// Opaque client nonce, echoed back on `message:new`.
        #[serde(default)]
        client_ref: Option<String>,
    },

    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: Uuid },

    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewFollower,
    PostLiked,
    PostCommented,
    ConversationCreated,
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Handshake accepted
    #[serde(rename = "ready")]
    Ready { user_id: Uuid },

    #[serde(rename = "conversation:joined")]
    ConversationJoined { conversation_id: Uuid },

    #[serde(rename = "conversation:left")]
    ConversationLeft { conversation_id: Uuid },

    /// A message was persisted in a room this connection has joined
    #[serde(rename = "message:new")]
    MessageNew {
        #[serde(flatten)]
        message: Box<Message>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
    },

    #[serde(rename = "user:typing")]
    UserTyping { user_id: Uuid, conversation_id: Uuid },

    #[serde(rename = "user:stopped-typing")]
    UserStoppedTyping { user_id: Uuid, conversation_id: Uuid },

    /// Out-of-band notification delivered to the user's private room
    #[serde(rename = "notification")]
    Notification {
        kind: NotificationKind,
        actor_id: Uuid,
        entity_id: Uuid,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
