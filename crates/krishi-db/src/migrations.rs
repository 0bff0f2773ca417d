use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id              TEXT PRIMARY KEY,
                phone_number    TEXT NOT NULL UNIQUE,
                password        TEXT NOT NULL,
                name            TEXT NOT NULL,
                bio             TEXT,
                avatar          TEXT,
                location        TEXT,
                farm_size       REAL,
                crops           TEXT NOT NULL DEFAULT '[]',
                languages       TEXT NOT NULL DEFAULT '[]',
                is_expert       INTEGER NOT NULL DEFAULT 0,
                is_active       INTEGER NOT NULL DEFAULT 1,
                is_banned       INTEGER NOT NULL DEFAULT 0,
                followers_count INTEGER NOT NULL DEFAULT 0,
                following_count INTEGER NOT NULL DEFAULT 0,
                posts_count     INTEGER NOT NULL DEFAULT 0,
                last_login      TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE TABLE refresh_tokens (
                token_hash  TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                expires_at  TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_refresh_tokens_user ON refresh_tokens(user_id);

            CREATE TABLE token_blacklist (
                token_hash  TEXT PRIMARY KEY,
                expires_at  TEXT NOT NULL
            );

            CREATE TABLE otp_codes (
                phone_number TEXT PRIMARY KEY,
                code         TEXT NOT NULL,
                attempts     INTEGER NOT NULL DEFAULT 0,
                expires_at   TEXT NOT NULL
            );

            CREATE TABLE pending_registrations (
                phone_number  TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                location      TEXT,
                expires_at    TEXT NOT NULL
            );

            CREATE TABLE follows (
                id            TEXT PRIMARY KEY,
                follower_id   TEXT NOT NULL REFERENCES users(id),
                following_id  TEXT NOT NULL REFERENCES users(id),
                created_at    TEXT NOT NULL,
                UNIQUE(follower_id, following_id),
                CHECK(follower_id <> following_id)
            );

            CREATE INDEX idx_follows_following ON follows(following_id, created_at);

            CREATE TABLE posts (
                id              TEXT PRIMARY KEY,
                author_id       TEXT NOT NULL REFERENCES users(id),
                type            TEXT NOT NULL,
                content         TEXT NOT NULL DEFAULT '{}',
                media           TEXT NOT NULL DEFAULT '[]',
                poll            TEXT,
                hashtags        TEXT NOT NULL DEFAULT '[]',
                mentions        TEXT NOT NULL DEFAULT '[]',
                category        TEXT NOT NULL DEFAULT 'general',
                likes_count     INTEGER NOT NULL DEFAULT 0,
                comments_count  INTEGER NOT NULL DEFAULT 0,
                shares_count    INTEGER NOT NULL DEFAULT 0,
                views_count     INTEGER NOT NULL DEFAULT 0,
                is_approved     INTEGER NOT NULL DEFAULT 1,
                visibility      TEXT NOT NULL DEFAULT 'public',
                is_deleted      INTEGER NOT NULL DEFAULT 0,
                deleted_at      TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX idx_posts_author ON posts(author_id, created_at);
            CREATE INDEX idx_posts_created ON posts(created_at);
            CREATE INDEX idx_posts_likes ON posts(likes_count);

            CREATE TABLE comments (
                id                 TEXT PRIMARY KEY,
                post_id            TEXT NOT NULL REFERENCES posts(id),
                author_id          TEXT NOT NULL REFERENCES users(id),
                text               TEXT NOT NULL,
                parent_comment_id  TEXT REFERENCES comments(id),
                likes_count        INTEGER NOT NULL DEFAULT 0,
                is_deleted         INTEGER NOT NULL DEFAULT 0,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL
            );

            CREATE INDEX idx_comments_post ON comments(post_id, created_at);

            CREATE TABLE likes (
                id           TEXT PRIMARY KEY,
                user_id      TEXT NOT NULL REFERENCES users(id),
                target_type  TEXT NOT NULL CHECK(target_type IN ('Post', 'Comment')),
                target_id    TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                UNIQUE(user_id, target_type, target_id)
            );

            CREATE INDEX idx_likes_target ON likes(target_type, target_id);

            CREATE TABLE conversations (
                id            TEXT PRIMARY KEY,
                type          TEXT NOT NULL,
                name          TEXT,
                -- canonical sorted participant pair, set only for direct conversations
                direct_key    TEXT UNIQUE,
                participants  TEXT NOT NULL DEFAULT '[]',
                last_message  TEXT,
                is_active     INTEGER NOT NULL DEFAULT 1,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE INDEX idx_conversations_updated ON conversations(updated_at);

            CREATE TABLE messages (
                id               TEXT PRIMARY KEY,
                conversation_id  TEXT NOT NULL REFERENCES conversations(id),
                sender_id        TEXT NOT NULL REFERENCES users(id),
                type             TEXT NOT NULL,
                content          TEXT NOT NULL DEFAULT '{}',
                reply_to_id      TEXT REFERENCES messages(id),
                status           TEXT NOT NULL DEFAULT 'sent',
                read_by          TEXT NOT NULL DEFAULT '[]',
                is_deleted       INTEGER NOT NULL DEFAULT 0,
                deleted_for      TEXT NOT NULL DEFAULT '[]',
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);
            CREATE INDEX idx_messages_sender ON messages(sender_id);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
