use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use krishi_types::api::Page;
use krishi_types::models::{
    Conversation, ConversationType, Message, MessageContent, MessageType, ParticipantRole, ReadReceipt,
};

use crate::collections::{CONVERSATIONS, MESSAGES, SENDER_FIELDS, USERS};
use crate::error::{DomainError, Result};
use crate::pagination::{Filter, PageRequest, Populate, Query, Sort, find_one_as, paginate_as};
use crate::{Database, now};

const NOT_PARTICIPANT: &str = "Not a participant of this conversation";

/// Participant entry as stored in the `participants` JSON column.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantEntry {
    user: Uuid,
    role: ParticipantRole,
    joined_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LastMessageEntry<'a> {
    text: &'a str,
    sender: Uuid,
    sent_at: &'a str,
}

/// Sender-supplied fields of a new message.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub kind: MessageType,
    pub content: MessageContent,
    pub reply_to: Option<Uuid>,
}

impl NewMessage {
    fn validate(&self) -> Result<()> {
        let has_text = self.content.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        match self.kind {
            MessageType::Text if !has_text => Err(DomainError::field("content.text", "is required")),
            MessageType::Text => Ok(()),
            _ if self.content.media.is_none() => Err(DomainError::field("content.media", "is required")),
            _ => Ok(()),
        }
    }

    /// Preview text stored on the conversation.
    fn preview(&self) -> String {
        match (self.kind, self.content.text.as_deref()) {
            (MessageType::Text, Some(text)) => text.to_string(),
            (kind, _) => format!("{} message", kind.as_str()),
        }
    }
}

fn conversation_query(filter: Filter) -> Query {
    Query::new(&CONVERSATIONS)
        .filter(filter)
        .populate(Populate::new("participants.user", &USERS, SENDER_FIELDS))
        .populate(Populate::new("lastMessage.sender", &USERS, SENDER_FIELDS))
}

fn load_conversation(conn: &Connection, id: Uuid) -> Result<Conversation> {
    let query = conversation_query(Filter::eq("id", id.to_string()));
    find_one_as(conn, &query)?.ok_or_else(|| DomainError::not_found("Conversation not found"))
}

fn load_message(conn: &Connection, id: Uuid) -> Result<Message> {
    let query = Query::new(&MESSAGES)
        .filter(Filter::eq("id", id.to_string()))
        .populate(Populate::new("sender", &USERS, SENDER_FIELDS));
    find_one_as(conn, &query)?.ok_or_else(|| DomainError::not_found("Message not found"))
}

fn participants(conn: &Connection, conversation_id: Uuid) -> Result<Option<(String, Vec<ParticipantEntry>)>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT type, participants FROM conversations WHERE id = ?1 AND is_active = 1",
            [conversation_id.to_string()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    row.map(|(kind, raw)| Ok::<_, DomainError>((kind, serde_json::from_str(&raw)?)))
        .transpose()
}

fn is_participant(conn: &Connection, conversation_id: Uuid, user: Uuid) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM conversations c
             WHERE c.id = ?1 AND c.is_active = 1
               AND EXISTS (SELECT 1 FROM json_each(c.participants) je
                           WHERE json_extract(je.value, '$.user') = ?2)",
            params![conversation_id.to_string(), user.to_string()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(found)
}

fn ensure_participant(conn: &Connection, conversation_id: Uuid, user: Uuid) -> Result<()> {
    if is_participant(conn, conversation_id, user)? {
        Ok(())
    } else {
        Err(DomainError::forbidden(NOT_PARTICIPANT))
    }
}

fn direct_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}", lo, hi)
}

impl Database {
    /// Create a conversation, or return the existing direct conversation
    /// between the same two users. The flag is true when a row was created.
    pub fn create_conversation(
        &self,
        creator: Uuid,
        kind: ConversationType,
        others: &[Uuid],
        name: Option<&str>,
    ) -> Result<(Conversation, bool)> {
        let mut members = vec![creator];
        for id in others {
            if !members.contains(id) {
                members.push(*id);
            }
        }
        if kind == ConversationType::Direct && members.len() != 2 {
            return Err(DomainError::bad_request(
                "Direct conversation requires exactly 2 participants",
            ));
        }

        let ts = now();
        let entries: Vec<ParticipantEntry> = members
            .iter()
            .map(|&user| ParticipantEntry {
                user,
                role: if kind == ConversationType::Group && user == creator {
                    ParticipantRole::Admin
                } else {
                    ParticipantRole::Member
                },
                joined_at: ts.clone(),
            })
            .collect();
        let encoded = serde_json::to_string(&entries)?;
        let key = (kind == ConversationType::Direct).then(|| direct_key(members[0], members[1]));

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            for user in &members {
                let exists = tx
                    .query_row("SELECT 1 FROM users WHERE id = ?1", [user.to_string()], |_| Ok(()))
                    .optional()?
                    .is_some();
                if !exists {
                    return Err(DomainError::not_found("User not found"));
                }
            }

            let id = Uuid::new_v4();
            let inserted = tx.execute(
                "INSERT INTO conversations (id, type, name, direct_key, participants, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(direct_key) DO NOTHING",
                params![id.to_string(), kind.as_str(), name, key, encoded, ts],
            )?;

            let id = if inserted > 0 {
                id
            } else {
                let existing: String = tx.query_row(
                    "SELECT id FROM conversations WHERE direct_key = ?1",
                    [&key],
                    |r| r.get(0),
                )?;
                crate::auth::parse_id(&existing)?
            };
            let conversation = load_conversation(&tx, id)?;
            tx.commit()?;
            Ok((conversation, inserted > 0))
        })
    }

    /// Active conversations of `user`, most recent activity first.
    pub fn conversations(&self, user: Uuid, page: PageRequest) -> Result<Page<Conversation>> {
        let query = conversation_query(Filter::and([
            Filter::array_member("participants", "user", user.to_string()),
            Filter::eq("isActive", true),
        ]))
        .sort(Sort::desc("updatedAt"));
        self.with_conn(|conn| paginate_as(conn, &query, page))
    }

    pub fn get_conversation(&self, id: Uuid, user: Uuid) -> Result<Conversation> {
        self.with_conn(|conn| {
            ensure_participant(conn, id, user)?;
            load_conversation(conn, id)
        })
    }

    /// Fresh participancy check; never cached.
    pub fn is_participant(&self, conversation_id: Uuid, user: Uuid) -> Result<bool> {
        self.with_conn(|conn| is_participant(conn, conversation_id, user))
    }

    /// Newest-first message history visible to `user`. With `before`, only
    /// messages older than that message are returned.
    pub fn messages(
        &self,
        conversation_id: Uuid,
        user: Uuid,
        before: Option<Uuid>,
        page: PageRequest,
    ) -> Result<Page<Message>> {
        self.with_conn(|conn| {
            ensure_participant(conn, conversation_id, user)?;

            let mut clauses = vec![
                Filter::eq("conversation", conversation_id.to_string()),
                Filter::eq("isDeleted", false),
                Filter::not(Filter::array_contains("deletedFor", user.to_string())),
            ];
            if let Some(before) = before {
                let cursor: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT created_at, rowid FROM messages WHERE id = ?1 AND conversation_id = ?2",
                        params![before.to_string(), conversation_id.to_string()],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                if let Some((created_at, rowid)) = cursor {
                    clauses.push(Filter::before("createdAt", created_at, rowid));
                }
            }

            let query = Query::new(&MESSAGES)
                .filter(Filter::and(clauses))
                .sort(Sort::desc("createdAt"))
                .populate(Populate::new("sender", &USERS, SENDER_FIELDS));
            paginate_as(conn, &query, page)
        })
    }

    /// Persist a message and refresh the conversation's lastMessage snapshot
    /// in one transaction. Participancy is checked inside the same transaction.
    pub fn create_message(&self, conversation_id: Uuid, sender: Uuid, message: &NewMessage) -> Result<Message> {
        message.validate()?;
        let content = serde_json::to_string(&message.content)?;
        let preview = message.preview();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            ensure_participant(&tx, conversation_id, sender)?;

            if let Some(reply_to) = message.reply_to {
                let same_conversation = tx
                    .query_row(
                        "SELECT 1 FROM messages WHERE id = ?1 AND conversation_id = ?2",
                        params![reply_to.to_string(), conversation_id.to_string()],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if !same_conversation {
                    return Err(DomainError::field("replyTo", "must be a message in this conversation"));
                }
            }

            let id = Uuid::new_v4();
            let ts = now();
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, type, content, reply_to_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id.to_string(),
                    conversation_id.to_string(),
                    sender.to_string(),
                    message.kind.as_str(),
                    content,
                    message.reply_to.map(|r| r.to_string()),
                    ts
                ],
            )?;

            let last = serde_json::to_string(&LastMessageEntry {
                text: &preview,
                sender,
                sent_at: &ts,
            })?;
            tx.execute(
                "UPDATE conversations SET last_message = ?2, updated_at = ?3 WHERE id = ?1",
                params![conversation_id.to_string(), last, ts],
            )?;

            let created = load_message(&tx, id)?;
            tx.commit()?;
            Ok(created)
        })
    }

    /// Add a read receipt for `user` and mark the message read.
    pub fn mark_read(&self, message_id: Uuid, user: Uuid) -> Result<Message> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row: Option<(String, String)> = tx
                .query_row(
                    "SELECT conversation_id, read_by FROM messages WHERE id = ?1 AND is_deleted = 0",
                    [message_id.to_string()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((conversation_id, read_by)) = row else {
                return Err(DomainError::not_found("Message not found"));
            };
            ensure_participant(&tx, crate::auth::parse_id(&conversation_id)?, user)?;

            let mut receipts: Vec<ReadReceipt> = serde_json::from_str(&read_by)?;
            if !receipts.iter().any(|r| r.user == user) {
                receipts.push(ReadReceipt {
                    user,
                    read_at: Utc::now(),
                });
                tx.execute(
                    "UPDATE messages SET read_by = ?2, status = 'read', updated_at = ?3 WHERE id = ?1",
                    params![message_id.to_string(), serde_json::to_string(&receipts)?, now()],
                )?;
            }
            let message = load_message(&tx, message_id)?;
            tx.commit()?;
            Ok(message)
        })
    }

    /// Delete for everyone (sender only) or hide for the caller.
    pub fn delete_message(&self, message_id: Uuid, user: Uuid, for_everyone: bool) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row: Option<(String, String, String)> = tx
                .query_row(
                    "SELECT conversation_id, sender_id, deleted_for FROM messages WHERE id = ?1 AND is_deleted = 0",
                    [message_id.to_string()],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            let Some((conversation_id, sender, deleted_for)) = row else {
                return Err(DomainError::not_found("Message not found"));
            };
            ensure_participant(&tx, crate::auth::parse_id(&conversation_id)?, user)?;

            if for_everyone {
                if sender != user.to_string() {
                    return Err(DomainError::forbidden("Only the sender can delete a message for everyone"));
                }
                tx.execute(
                    "UPDATE messages SET is_deleted = 1, updated_at = ?2 WHERE id = ?1",
                    params![message_id.to_string(), now()],
                )?;
            } else {
                let mut hidden: Vec<Uuid> = serde_json::from_str(&deleted_for)?;
                if !hidden.contains(&user) {
                    hidden.push(user);
                    tx.execute(
                        "UPDATE messages SET deleted_for = ?2, updated_at = ?3 WHERE id = ?1",
                        params![message_id.to_string(), serde_json::to_string(&hidden)?, now()],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Remove `target` from a group. Members may remove themselves; admins may
    /// remove anyone.
    pub fn remove_participant(&self, conversation_id: Uuid, actor: Uuid, target: Uuid) -> Result<Conversation> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let Some((kind, mut entries)) = participants(&tx, conversation_id)? else {
                return Err(DomainError::forbidden(NOT_PARTICIPANT));
            };
            let Some(actor_entry) = entries.iter().find(|p| p.user == actor) else {
                return Err(DomainError::forbidden(NOT_PARTICIPANT));
            };
            if kind != ConversationType::Group.as_str() {
                return Err(DomainError::bad_request(
                    "Participants can only be removed from group conversations",
                ));
            }
            if actor != target && actor_entry.role != ParticipantRole::Admin {
                return Err(DomainError::forbidden("Only group admins can remove participants"));
            }

            let before = entries.len();
            entries.retain(|p| p.user != target);
            if entries.len() == before {
                return Err(DomainError::not_found("User is not a participant"));
            }

            tx.execute(
                "UPDATE conversations SET participants = ?2, updated_at = ?3 WHERE id = ?1",
                params![conversation_id.to_string(), serde_json::to_string(&entries)?, now()],
            )?;
            let conversation = load_conversation(&tx, conversation_id)?;
            tx.commit()?;
            Ok(conversation)
        })
    }
}
