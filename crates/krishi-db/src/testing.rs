use krishi_types::models::{Conversation, ConversationType, Post, PostContent, PostType, User, Visibility};
use uuid::Uuid;

use crate::Database;
use crate::models::PendingRegistration;
use crate::posts::NewPost;

pub fn test_db() -> Database {
    Database::open_in_memory().unwrap()
}

pub fn pending(phone: &str, name: &str) -> PendingRegistration {
    PendingRegistration {
        phone_number: phone.to_string(),
        name: name.to_string(),
        password_hash: "hash".to_string(),
        location: None,
    }
}

/// Create a user with a phone number derived from `n`.
pub fn user(db: &Database, n: u32) -> User {
    let phone = format!("9{:09}", n);
    db.create_user(&pending(&phone, &format!("Farmer {}", n))).unwrap()
}

pub fn post(db: &Database, author: Uuid, text: &str) -> Post {
    db.create_post(author, text_post(text, Visibility::Public)).unwrap()
}

pub fn text_post(text: &str, visibility: Visibility) -> NewPost {
    NewPost {
        kind: PostType::Text,
        content: PostContent {
            text: Some(text.to_string()),
            voice: None,
        },
        media: Vec::new(),
        poll: None,
        category: None,
        visibility: Some(visibility),
        mentions: Vec::new(),
    }
}

pub fn direct(db: &Database, a: Uuid, b: Uuid) -> Conversation {
    db.create_conversation(a, ConversationType::Direct, &[b], None).unwrap().0
}
