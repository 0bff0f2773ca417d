use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use krishi_types::api::Page;
use krishi_types::models::Follow;

use crate::auth::parse_id;
use crate::collections::{FOLLOWS, PROFILE_CARD, USERS};
use crate::error::{DomainError, Result, is_unique_violation};
use crate::pagination::{Filter, PageRequest, Populate, Query, Sort, paginate_as};
use crate::{Database, now};

impl Database {
    /// Create the follow edge and bump both users' counters atomically.
    pub fn follow(&self, follower: Uuid, following: Uuid) -> Result<()> {
        if follower == following {
            return Err(DomainError::conflict("Cannot follow yourself"));
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let target_exists = tx
                .query_row(
                    "SELECT 1 FROM users WHERE id = ?1 AND is_active = 1",
                    [following.to_string()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !target_exists {
                return Err(DomainError::not_found("User not found"));
            }

            tx.execute(
                "INSERT INTO follows (id, follower_id, following_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    follower.to_string(),
                    following.to_string(),
                    now()
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DomainError::conflict("Already following this user")
                } else {
                    e.into()
                }
            })?;

            tx.execute(
                "UPDATE users SET following_count = following_count + 1 WHERE id = ?1",
                [follower.to_string()],
            )?;
            tx.execute(
                "UPDATE users SET followers_count = followers_count + 1 WHERE id = ?1",
                [following.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Remove the edge if present. Returns whether an edge was removed;
    /// counters only move when it was.
    pub fn unfollow(&self, follower: Uuid, following: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM follows WHERE follower_id = ?1 AND following_id = ?2",
                params![follower.to_string(), following.to_string()],
            )?;
            if removed > 0 {
                tx.execute(
                    "UPDATE users SET following_count = MAX(following_count - 1, 0) WHERE id = ?1",
                    [follower.to_string()],
                )?;
                tx.execute(
                    "UPDATE users SET followers_count = MAX(followers_count - 1, 0) WHERE id = ?1",
                    [following.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(removed > 0)
        })
    }

    pub fn followers(&self, user_id: Uuid, page: PageRequest) -> Result<Page<Follow>> {
        let query = Query::new(&FOLLOWS)
            .filter(Filter::eq("following", user_id.to_string()))
            .sort(Sort::desc("createdAt"))
            .populate(Populate::new("follower", &USERS, PROFILE_CARD));
        self.with_conn(|conn| paginate_as(conn, &query, page))
    }

    pub fn following(&self, user_id: Uuid, page: PageRequest) -> Result<Page<Follow>> {
        let query = Query::new(&FOLLOWS)
            .filter(Filter::eq("follower", user_id.to_string()))
            .sort(Sort::desc("createdAt"))
            .populate(Populate::new("following", &USERS, PROFILE_CARD));
        self.with_conn(|conn| paginate_as(conn, &query, page))
    }

    /// Every user `user_id` follows, for feed assembly.
    pub fn following_ids(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT following_id FROM follows WHERE follower_id = ?1")?;
            let rows = stmt.query_map([user_id.to_string()], |r| r.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(parse_id(&row?)?);
            }
            Ok(ids)
        })
    }
}
