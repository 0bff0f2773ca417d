use axum::{
    Extension,
    extract::State,
};
use tracing::info;
use uuid::Uuid;

use krishi_db::chat::NewMessage;
use krishi_db::pagination::{DEFAULT_LIMIT, MESSAGE_LIMIT, PageRequest};
use krishi_types::api::{
    CreateConversationRequest, DeleteMessageQuery, MessagesQuery, PageQuery, SendMessageRequest,
};
use krishi_types::events::NotificationKind;
use krishi_types::models::{Conversation, Message};

use crate::error::ApiResult;
use crate::middleware::AuthUser;
use crate::reply::{self, Done, Reply};
use crate::state::AppState;
use crate::validation::{Path, Query, ValidJson};

/// Create a conversation. Asking for an existing direct conversation returns
/// it with 200 instead of 201.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    ValidJson(req): ValidJson<CreateConversationRequest>,
) -> ApiResult<Reply<Conversation>> {
    let (conversation, created) = state
        .db
        .call(move |db| {
            let name = req.name.as_deref().map(str::trim).filter(|n| !n.is_empty());
            db.create_conversation(me, req.kind, &req.participants, name)
        })
        .await?;

    if !created {
        return Ok(reply::ok(conversation, "Conversation fetched successfully"));
    }

    info!("{} created {} conversation {}", me, conversation.kind.as_str(), conversation.id);
    for participant in &conversation.participants {
        state
            .gateway
            .notify(
                participant.user.id(),
                NotificationKind::ConversationCreated,
                me,
                conversation.id,
            )
            .await;
    }
    Ok(reply::created(conversation, "Conversation created successfully"))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Reply<Vec<Conversation>>> {
    let page = PageRequest::new(query.page, query.limit, DEFAULT_LIMIT);
    let conversations = state.db.call(move |db| db.conversations(me, page)).await?;
    Ok(reply::page(conversations, "Conversations fetched successfully"))
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Reply<Vec<Message>>> {
    let page = PageRequest::new(query.page, query.limit, MESSAGE_LIMIT);
    let before = query.before;
    let messages = state
        .db
        .call(move |db| db.messages(conversation_id, me, before, page))
        .await?;
    Ok(reply::page(messages, "Messages fetched successfully"))
}

/// REST counterpart of the socket `message:send`; it goes through the same
/// serialized persist + broadcast path.
pub async fn send_message(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(conversation_id): Path<Uuid>,
    ValidJson(req): ValidJson<SendMessageRequest>,
) -> ApiResult<Reply<Message>> {
    let message = NewMessage {
        kind: req.kind,
        content: req.content,
        reply_to: req.reply_to,
    };
    let message = state
        .gateway
        .send_message(me, conversation_id, message, req.client_ref)
        .await?;
    Ok(reply::created(message, "Message sent successfully"))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
) -> ApiResult<Reply<Message>> {
    let message = state.db.call(move |db| db.mark_read(message_id, me)).await?;
    Ok(reply::ok(message, "Message marked as read"))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
    Query(query): Query<DeleteMessageQuery>,
) -> ApiResult<Reply<Done>> {
    let for_everyone = query.for_everyone;
    state
        .db
        .call(move |db| db.delete_message(message_id, me, for_everyone))
        .await?;
    Ok(reply::done("Message deleted successfully"))
}

/// Remove a participant, or leave when the target is the caller. Their
/// live connections stop receiving the conversation immediately.
pub async fn remove_participant(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Reply<Conversation>> {
    let conversation = state
        .db
        .call(move |db| db.remove_participant(conversation_id, me, user_id))
        .await?;
    state.gateway.participant_removed(conversation_id, user_id).await;
    info!("{} removed {} from conversation {}", me, user_id, conversation_id);
    Ok(reply::ok(conversation, "Participant removed successfully"))
}
