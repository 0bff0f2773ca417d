//! Table descriptions for the pagination engine. The document key of each
//! column is its wire name; counters nest under `stats`.

use crate::pagination::{Collection, Field, FieldKind::*};

pub static USERS: Collection = Collection {
    table: "users",
    fields: &[
        Field::new("id", "id", Text),
        Field::new("phone_number", "phoneNumber", Text),
        Field::new("name", "name", Text),
        Field::new("bio", "bio", Text),
        Field::new("avatar", "avatar", Json),
        Field::new("location", "location", Json),
        Field::new("farm_size", "farmSize", Real),
        Field::new("crops", "crops", Json),
        Field::new("languages", "languages", Json),
        Field::new("is_expert", "isExpert", Bool),
        Field::new("is_active", "isActive", Bool),
        Field::new("is_banned", "isBanned", Bool),
        Field::new("followers_count", "stats.followersCount", Integer),
        Field::new("following_count", "stats.followingCount", Integer),
        Field::new("posts_count", "stats.postsCount", Integer),
        Field::new("last_login", "lastLogin", Text),
        Field::new("created_at", "createdAt", Text),
        Field::new("updated_at", "updatedAt", Text),
    ],
};

pub static FOLLOWS: Collection = Collection {
    table: "follows",
    fields: &[
        Field::new("id", "id", Text),
        Field::new("follower_id", "follower", Text),
        Field::new("following_id", "following", Text),
        Field::new("created_at", "createdAt", Text),
    ],
};

pub static POSTS: Collection = Collection {
    table: "posts",
    fields: &[
        Field::new("id", "id", Text),
        Field::new("author_id", "author", Text),
        Field::new("type", "type", Text),
        Field::new("content", "content", Json),
        Field::new("media", "media", Json),
        Field::new("poll", "poll", Json),
        Field::new("hashtags", "hashtags", Json),
        Field::new("mentions", "mentions", Json),
        Field::new("category", "category", Text),
        Field::new("likes_count", "stats.likes", Integer),
        Field::new("comments_count", "stats.comments", Integer),
        Field::new("shares_count", "stats.shares", Integer),
        Field::new("views_count", "stats.views", Integer),
        Field::new("is_approved", "isApproved", Bool),
        Field::new("visibility", "visibility", Text),
        Field::new("is_deleted", "isDeleted", Bool),
        Field::new("deleted_at", "deletedAt", Text),
        Field::new("created_at", "createdAt", Text),
        Field::new("updated_at", "updatedAt", Text),
    ],
};

pub static COMMENTS: Collection = Collection {
    table: "comments",
    fields: &[
        Field::new("id", "id", Text),
        Field::new("post_id", "post", Text),
        Field::new("author_id", "author", Text),
        Field::new("text", "text", Text),
        Field::new("parent_comment_id", "parentComment", Text),
        Field::new("likes_count", "stats.likes", Integer),
        Field::new("is_deleted", "isDeleted", Bool),
        Field::new("created_at", "createdAt", Text),
        Field::new("updated_at", "updatedAt", Text),
    ],
};

pub static LIKES: Collection = Collection {
    table: "likes",
    fields: &[
        Field::new("id", "id", Text),
        Field::new("user_id", "user", Text),
        Field::new("target_type", "targetType", Text),
        Field::new("target_id", "targetId", Text),
        Field::new("created_at", "createdAt", Text),
    ],
};

pub static CONVERSATIONS: Collection = Collection {
    table: "conversations",
    fields: &[
        Field::new("id", "id", Text),
        Field::new("type", "type", Text),
        Field::new("name", "name", Text),
        Field::new("participants", "participants", Json),
        Field::new("last_message", "lastMessage", Json),
        Field::new("is_active", "isActive", Bool),
        Field::new("created_at", "createdAt", Text),
        Field::new("updated_at", "updatedAt", Text),
    ],
};

pub static MESSAGES: Collection = Collection {
    table: "messages",
    fields: &[
        Field::new("id", "id", Text),
        Field::new("conversation_id", "conversation", Text),
        Field::new("sender_id", "sender", Text),
        Field::new("type", "type", Text),
        Field::new("content", "content", Json),
        Field::new("reply_to_id", "replyTo", Text),
        Field::new("status", "status", Text),
        Field::new("read_by", "readBy", Json),
        Field::new("is_deleted", "isDeleted", Bool),
        Field::new("deleted_for", "deletedFor", Json),
        Field::new("created_at", "createdAt", Text),
        Field::new("updated_at", "updatedAt", Text),
    ],
};

/// Author card inlined into posts and comments.
pub const AUTHOR_FIELDS: &[&str] = &["name", "avatar", "isExpert"];

/// Profile card used by follower lists and search results.
pub const PROFILE_CARD: &[&str] = &["name", "avatar", "bio", "isExpert", "stats"];

/// Sender card inlined into messages and conversation participants.
pub const SENDER_FIELDS: &[&str] = &["name", "avatar"];
