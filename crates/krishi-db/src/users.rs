use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use krishi_types::api::{Page, UpdateProfileRequest, UserFilter};
use krishi_types::models::{StoredMedia, User};

use crate::auth::load_user;
use crate::collections::USERS;
use crate::error::{DomainError, Result};
use crate::pagination::{Filter, PageRequest, Query, Sort, find_one_as, paginate_as};
use crate::{Database, now};

impl Database {
    pub fn get_user(&self, id: Uuid) -> Result<User> {
        self.with_conn(|conn| load_user(conn, id))
    }

    /// Like [`Database::get_user`] but absent users are `None`.
    pub fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let query = Query::new(&USERS).filter(Filter::eq("id", id.to_string()));
            find_one_as(conn, &query)
        })
    }

    /// A profile as seen by `viewer`, with `isFollowing` filled in.
    pub fn get_profile(&self, id: Uuid, viewer: Option<Uuid>) -> Result<User> {
        self.with_conn(|conn| {
            let mut user = load_user(conn, id)?;
            if let Some(viewer) = viewer {
                let follows = conn
                    .query_row(
                        "SELECT 1 FROM follows WHERE follower_id = ?1 AND following_id = ?2",
                        params![viewer.to_string(), id.to_string()],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                user.is_following = Some(follows);
            }
            Ok(user)
        })
    }

    /// Apply whitelisted profile edits. Omitted fields are left untouched.
    pub fn update_profile(&self, id: Uuid, update: &UpdateProfileRequest) -> Result<User> {
        let location = update.location.as_ref().map(serde_json::to_string).transpose()?;
        let crops = update.crops.as_ref().map(serde_json::to_string).transpose()?;
        let languages = update.languages.as_ref().map(serde_json::to_string).transpose()?;

        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE users SET
                    name      = COALESCE(?2, name),
                    bio       = COALESCE(?3, bio),
                    location  = COALESCE(?4, location),
                    farm_size = COALESCE(?5, farm_size),
                    crops     = COALESCE(?6, crops),
                    languages = COALESCE(?7, languages),
                    updated_at = ?8
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    update.name,
                    update.bio,
                    location,
                    update.farm_size,
                    crops,
                    languages,
                    now()
                ],
            )?;
            if n == 0 {
                return Err(DomainError::not_found("User not found"));
            }
            load_user(conn, id)
        })
    }

    /// Replace the avatar, returning the updated user and the media it replaced.
    pub fn set_avatar(&self, id: Uuid, avatar: &StoredMedia) -> Result<(User, Option<StoredMedia>)> {
        let encoded = serde_json::to_string(avatar)?;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let previous: Option<Option<String>> = tx
                .query_row("SELECT avatar FROM users WHERE id = ?1", [id.to_string()], |r| r.get(0))
                .optional()?;
            let Some(previous) = previous else {
                return Err(DomainError::not_found("User not found"));
            };
            tx.execute(
                "UPDATE users SET avatar = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), encoded, now()],
            )?;
            let user = load_user(&tx, id)?;
            tx.commit()?;

            let previous = previous.as_deref().map(serde_json::from_str).transpose()?;
            Ok((user, previous))
        })
    }

    /// Active, unbanned users whose name or phone number contains `q`,
    /// newest accounts first.
    pub fn search_users(&self, q: Option<&str>, filter: UserFilter, page: PageRequest) -> Result<Page<User>> {
        let mut clauses = vec![Filter::eq("isActive", true), Filter::eq("isBanned", false)];
        if let Some(q) = q.map(str::trim).filter(|q| !q.is_empty()) {
            clauses.push(Filter::or([
                Filter::contains("name", q),
                Filter::contains("phoneNumber", q),
            ]));
        }
        if filter == UserFilter::Experts {
            clauses.push(Filter::eq("isExpert", true));
        }

        let query = Query::new(&USERS)
            .filter(Filter::and(clauses))
            .sort(Sort::desc("createdAt"));
        self.with_conn(|conn| paginate_as(conn, &query, page))
    }
}
