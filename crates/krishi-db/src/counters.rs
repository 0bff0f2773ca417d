use rusqlite::Connection;
use tracing::warn;

use crate::Database;
use crate::error::Result;
use crate::models::ReconcileReport;

// Each statement rewrites only rows whose stored counter disagrees with the
// edge tables, so the affected-row count is the number of repaired rows.

const USERS_SQL: &str = "
    UPDATE users SET
        followers_count = (SELECT COUNT(*) FROM follows f WHERE f.following_id = users.id),
        following_count = (SELECT COUNT(*) FROM follows f WHERE f.follower_id = users.id),
        posts_count     = (SELECT COUNT(*) FROM posts p WHERE p.author_id = users.id AND p.is_deleted = 0)
    WHERE followers_count <> (SELECT COUNT(*) FROM follows f WHERE f.following_id = users.id)
       OR following_count <> (SELECT COUNT(*) FROM follows f WHERE f.follower_id = users.id)
       OR posts_count     <> (SELECT COUNT(*) FROM posts p WHERE p.author_id = users.id AND p.is_deleted = 0)";

const POSTS_SQL: &str = "
    UPDATE posts SET
        likes_count    = (SELECT COUNT(*) FROM likes l WHERE l.target_type = 'Post' AND l.target_id = posts.id),
        comments_count = (SELECT COUNT(*) FROM comments c WHERE c.post_id = posts.id AND c.is_deleted = 0)
    WHERE likes_count    <> (SELECT COUNT(*) FROM likes l WHERE l.target_type = 'Post' AND l.target_id = posts.id)
       OR comments_count <> (SELECT COUNT(*) FROM comments c WHERE c.post_id = posts.id AND c.is_deleted = 0)";

const COMMENTS_SQL: &str = "
    UPDATE comments SET
        likes_count = (SELECT COUNT(*) FROM likes l WHERE l.target_type = 'Comment' AND l.target_id = comments.id)
    WHERE likes_count <> (SELECT COUNT(*) FROM likes l WHERE l.target_type = 'Comment' AND l.target_id = comments.id)";

fn reconcile(conn: &mut Connection) -> Result<ReconcileReport> {
    let tx = conn.transaction()?;
    let report = ReconcileReport {
        users: tx.execute(USERS_SQL, [])?,
        posts: tx.execute(POSTS_SQL, [])?,
        comments: tx.execute(COMMENTS_SQL, [])?,
    };
    tx.commit()?;
    Ok(report)
}

impl Database {
    /// Recompute every denormalized counter from its edge table.
    pub fn reconcile_counters(&self) -> Result<ReconcileReport> {
        let report = self.with_conn_mut(reconcile)?;
        if report.total() > 0 {
            warn!(
                "Repaired counter drift: {} users, {} posts, {} comments",
                report.users, report.posts, report.comments
            );
        }
        Ok(report)
    }
}
