use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use krishi_types::api::{FeedFilter, Page, UpdatePostRequest};
use krishi_types::models::{
    Category, Comment, LikeTarget, Poll, Post, PostContent, PostMedia, PostType, Visibility,
};

use crate::auth::parse_id;
use crate::collections::{AUTHOR_FIELDS, COMMENTS, POSTS, USERS};
use crate::error::{DomainError, Result, is_unique_violation};
use crate::pagination::{Filter, PageRequest, Populate, Query, Sort, find_one_as, paginate_as};
use crate::{Database, now};

static HASHTAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"#[\w\x{0900}-\x{097F}]+").expect("valid regex"));

const AUTHOR_DETAIL: &[&str] = &["name", "avatar", "isExpert", "stats"];

/// Distinct lowercase hashtags in `text`, in first-seen order, without `#`.
pub fn extract_hashtags(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    HASHTAG
        .find_iter(text)
        .map(|m| m.as_str()[1..].to_lowercase())
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

/// Author-supplied fields of a new post.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub kind: PostType,
    pub content: PostContent,
    pub media: Vec<PostMedia>,
    pub poll: Option<Poll>,
    pub category: Option<Category>,
    pub visibility: Option<Visibility>,
    pub mentions: Vec<Uuid>,
}

fn enum_str<T: serde::Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(DomainError::Internal(anyhow::anyhow!("expected string enum, got {}", other))),
    }
}

fn visible_posts() -> Vec<Filter> {
    vec![
        Filter::eq("isDeleted", false),
        Filter::eq("isApproved", true),
        Filter::eq("visibility", Visibility::Public.as_str().to_string()),
    ]
}

fn load_post(conn: &Connection, id: Uuid, author_select: &'static [&'static str]) -> Result<Post> {
    let query = Query::new(&POSTS)
        .filter(Filter::and([
            Filter::eq("id", id.to_string()),
            Filter::eq("isDeleted", false),
        ]))
        .populate(Populate::new("author", &USERS, author_select));
    find_one_as(conn, &query)?.ok_or_else(|| DomainError::not_found("Post not found"))
}

fn load_comment(conn: &Connection, id: Uuid) -> Result<Comment> {
    let query = Query::new(&COMMENTS)
        .filter(Filter::eq("id", id.to_string()))
        .populate(Populate::new("author", &USERS, AUTHOR_FIELDS));
    find_one_as(conn, &query)?.ok_or_else(|| DomainError::not_found("Comment not found"))
}

fn post_page(conn: &Connection, filter: Filter, sort: &[Sort], page: PageRequest) -> Result<Page<Post>> {
    let mut query = Query::new(&POSTS)
        .filter(filter)
        .populate(Populate::new("author", &USERS, AUTHOR_FIELDS));
    for s in sort {
        query = query.sort(*s);
    }
    paginate_as(conn, &query, page)
}

impl Database {
    /// Insert a post and bump the author's post count in one transaction.
    pub fn create_post(&self, author: Uuid, post: NewPost) -> Result<Post> {
        let hashtags = extract_hashtags(post.content.text.as_deref().unwrap_or_default());
        let content = serde_json::to_string(&post.content)?;
        let media = serde_json::to_string(&post.media)?;
        let poll = post.poll.as_ref().map(serde_json::to_string).transpose()?;
        let hashtags = serde_json::to_string(&hashtags)?;
        let mentions = serde_json::to_string(&post.mentions)?;
        let kind = enum_str(&post.kind)?;
        let category = enum_str(&post.category.unwrap_or_default())?;
        let visibility = post.visibility.unwrap_or_default().as_str();
        let id = Uuid::new_v4();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ts = now();
            tx.execute(
                "INSERT INTO posts (id, author_id, type, content, media, poll, hashtags, mentions,
                                    category, visibility, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    id.to_string(),
                    author.to_string(),
                    kind,
                    content,
                    media,
                    poll,
                    hashtags,
                    mentions,
                    category,
                    visibility,
                    ts
                ],
            )?;
            tx.execute(
                "UPDATE users SET posts_count = posts_count + 1 WHERE id = ?1",
                [author.to_string()],
            )?;
            let created = load_post(&tx, id, AUTHOR_FIELDS)?;
            tx.commit()?;
            Ok(created)
        })
    }

    pub fn feed(&self, viewer: Uuid, filter: FeedFilter, page: PageRequest) -> Result<Page<Post>> {
        let mut clauses = visible_posts();
        let sort = match filter {
            FeedFilter::Following => {
                let mut authors = self.following_ids(viewer)?;
                authors.push(viewer);
                clauses.push(Filter::is_in("author", authors.iter().map(Uuid::to_string)));
                vec![Sort::desc("createdAt")]
            }
            FeedFilter::Latest => vec![Sort::desc("createdAt")],
            FeedFilter::Trending => {
                clauses.push(Filter::gt("stats.likes", 0));
                vec![Sort::desc("stats.likes"), Sort::desc("createdAt")]
            }
        };
        self.with_conn(|conn| post_page(conn, Filter::and(clauses), &sort, page))
    }

    /// A live post with its author's card and the viewer's like state.
    pub fn get_post(&self, id: Uuid, viewer: Option<Uuid>) -> Result<Post> {
        self.with_conn(|conn| {
            let mut post = load_post(conn, id, AUTHOR_DETAIL)?;
            if let Some(viewer) = viewer {
                post.is_liked = Some(has_liked(conn, viewer, LikeTarget::Post(id))?);
            }
            Ok(post)
        })
    }

    /// Author-only edit of content, category and visibility. Replacing the
    /// content always recomputes the hashtags from its text.
    pub fn update_post(&self, id: Uuid, author: Uuid, update: &UpdatePostRequest) -> Result<Post> {
        let content = update.content.as_ref().map(serde_json::to_string).transpose()?;
        let hashtags = update
            .content
            .as_ref()
            .map(|c| serde_json::to_string(&extract_hashtags(c.text.as_deref().unwrap_or_default())))
            .transpose()?;
        let category = update.category.as_ref().map(enum_str).transpose()?;
        let visibility = update.visibility.map(Visibility::as_str);

        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE posts SET
                    content    = COALESCE(?3, content),
                    hashtags   = COALESCE(?4, hashtags),
                    category   = COALESCE(?5, category),
                    visibility = COALESCE(?6, visibility),
                    updated_at = ?7
                 WHERE id = ?1 AND author_id = ?2 AND is_deleted = 0",
                params![
                    id.to_string(),
                    author.to_string(),
                    content,
                    hashtags,
                    category,
                    visibility,
                    now()
                ],
            )?;
            if n == 0 {
                return Err(DomainError::not_found("Post not found or unauthorized"));
            }
            load_post(conn, id, AUTHOR_FIELDS)
        })
    }

    /// Soft-delete; the author's post count drops in the same transaction.
    pub fn delete_post(&self, id: Uuid, author: Uuid) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let ts = now();
            let n = tx.execute(
                "UPDATE posts SET is_deleted = 1, deleted_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND author_id = ?2 AND is_deleted = 0",
                params![id.to_string(), author.to_string(), ts],
            )?;
            if n == 0 {
                return Err(DomainError::not_found("Post not found or unauthorized"));
            }
            tx.execute(
                "UPDATE users SET posts_count = MAX(posts_count - 1, 0) WHERE id = ?1",
                [author.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Record a like and bump the target's counter. Returns the author of the
    /// liked post or comment.
    pub fn like(&self, user: Uuid, target: LikeTarget) -> Result<Uuid> {
        let (table, missing) = target_table(target);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let author: Option<String> = tx
                .query_row(
                    &format!("SELECT author_id FROM {} WHERE id = ?1 AND is_deleted = 0", table),
                    [target.id().to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(author) = author else {
                return Err(DomainError::not_found(missing));
            };

            tx.execute(
                "INSERT INTO likes (id, user_id, target_type, target_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    user.to_string(),
                    target.type_name(),
                    target.id().to_string(),
                    now()
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DomainError::conflict("Already liked")
                } else {
                    e.into()
                }
            })?;
            tx.execute(
                &format!("UPDATE {} SET likes_count = likes_count + 1 WHERE id = ?1", table),
                [target.id().to_string()],
            )?;
            tx.commit()?;
            parse_id(&author)
        })
    }

    /// Remove a like if present; a missing like is not an error.
    pub fn unlike(&self, user: Uuid, target: LikeTarget) -> Result<bool> {
        let (table, _) = target_table(target);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM likes WHERE user_id = ?1 AND target_type = ?2 AND target_id = ?3",
                params![user.to_string(), target.type_name(), target.id().to_string()],
            )?;
            if removed > 0 {
                tx.execute(
                    &format!("UPDATE {} SET likes_count = MAX(likes_count - 1, 0) WHERE id = ?1", table),
                    [target.id().to_string()],
                )?;
            }
            tx.commit()?;
            Ok(removed > 0)
        })
    }

    /// Add a comment (optionally a reply) and bump the post's comment count.
    /// Returns the comment and the post author.
    pub fn add_comment(
        &self,
        user: Uuid,
        post_id: Uuid,
        text: &str,
        parent: Option<Uuid>,
    ) -> Result<(Comment, Uuid)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let post_author: Option<String> = tx
                .query_row(
                    "SELECT author_id FROM posts WHERE id = ?1 AND is_deleted = 0",
                    [post_id.to_string()],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(post_author) = post_author else {
                return Err(DomainError::not_found("Post not found"));
            };

            if let Some(parent) = parent {
                let same_post = tx
                    .query_row(
                        "SELECT 1 FROM comments WHERE id = ?1 AND post_id = ?2 AND is_deleted = 0",
                        params![parent.to_string(), post_id.to_string()],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if !same_post {
                    return Err(DomainError::field(
                        "parentComment",
                        "must be a comment on the same post",
                    ));
                }
            }

            let id = Uuid::new_v4();
            let ts = now();
            tx.execute(
                "INSERT INTO comments (id, post_id, author_id, text, parent_comment_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    id.to_string(),
                    post_id.to_string(),
                    user.to_string(),
                    text,
                    parent.map(|p| p.to_string()),
                    ts
                ],
            )?;
            tx.execute(
                "UPDATE posts SET comments_count = comments_count + 1 WHERE id = ?1",
                [post_id.to_string()],
            )?;
            let comment = load_comment(&tx, id)?;
            tx.commit()?;
            Ok((comment, parse_id(&post_author)?))
        })
    }

    /// Top-level comments of a post, newest first.
    pub fn comments(&self, post_id: Uuid, page: PageRequest) -> Result<Page<Comment>> {
        let query = Query::new(&COMMENTS)
            .filter(Filter::and([
                Filter::eq("post", post_id.to_string()),
                Filter::eq("isDeleted", false),
                Filter::IsNull("parentComment"),
            ]))
            .sort(Sort::desc("createdAt"))
            .populate(Populate::new("author", &USERS, AUTHOR_FIELDS));
        self.with_conn(|conn| paginate_as(conn, &query, page))
    }

    /// An author's posts. Only public ones unless the viewer is the author.
    pub fn user_posts(&self, author: Uuid, viewer: Uuid, page: PageRequest) -> Result<Page<Post>> {
        let mut clauses = vec![
            Filter::eq("author", author.to_string()),
            Filter::eq("isDeleted", false),
            Filter::eq("isApproved", true),
        ];
        if viewer != author {
            clauses.push(Filter::eq("visibility", Visibility::Public.as_str().to_string()));
        }
        self.with_conn(|conn| post_page(conn, Filter::and(clauses), &[Sort::desc("createdAt")], page))
    }

    pub fn posts_by_hashtag(&self, tag: &str, page: PageRequest) -> Result<Page<Post>> {
        let tag = tag.trim_start_matches('#').to_lowercase();
        let mut clauses = visible_posts();
        clauses.push(Filter::array_contains("hashtags", tag));
        self.with_conn(|conn| post_page(conn, Filter::and(clauses), &[Sort::desc("createdAt")], page))
    }
}

fn target_table(target: LikeTarget) -> (&'static str, &'static str) {
    match target {
        LikeTarget::Post(_) => ("posts", "Post not found"),
        LikeTarget::Comment(_) => ("comments", "Comment not found"),
    }
}

fn has_liked(conn: &Connection, user: Uuid, target: LikeTarget) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM likes WHERE user_id = ?1 AND target_type = ?2 AND target_id = ?3",
            params![user.to_string(), target.type_name(), target.id().to_string()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{post, test_db, text_post, user};

    #[test]
    fn hashtags_are_lowercased_and_deduplicated() {
        let tags = extract_hashtags("Great #Wheat harvest! #wheat #कृषि #organic_farming");
        assert_eq!(tags, vec!["wheat", "कृषि", "organic_farming"]);
        assert!(extract_hashtags("no tags here").is_empty());
    }

    #[test]
    fn create_and_delete_move_the_post_count() {
        let db = test_db();
        let a = user(&db, 1);
        let p = post(&db, a.id, "hello #rabi");
        assert_eq!(p.hashtags, vec!["rabi"]);
        assert_eq!(p.author.populated().and_then(|u| u.name.as_deref()), Some("Farmer 1"));
        assert_eq!(db.get_user(a.id).unwrap().stats.posts_count, 1);

        db.delete_post(p.id, a.id).unwrap();
        assert_eq!(db.get_user(a.id).unwrap().stats.posts_count, 0);
        assert!(matches!(db.get_post(p.id, None), Err(DomainError::NotFound(_))));
        // second delete does not decrement again
        assert!(db.delete_post(p.id, a.id).is_err());
        assert_eq!(db.get_user(a.id).unwrap().stats.posts_count, 0);
    }

    #[test]
    fn only_the_author_may_edit() {
        let db = test_db();
        let a = user(&db, 1);
        let b = user(&db, 2);
        let p = post(&db, a.id, "first");
        let update = UpdatePostRequest {
            content: Some(PostContent {
                text: Some("edited #Millet".into()),
                voice: None,
            }),
            ..Default::default()
        };
        assert!(matches!(db.update_post(p.id, b.id, &update), Err(DomainError::NotFound(_))));
        let edited = db.update_post(p.id, a.id, &update).unwrap();
        assert_eq!(edited.content.text.as_deref(), Some("edited #Millet"));
        assert_eq!(edited.hashtags, vec!["millet"]);
    }

    #[test]
    fn replacing_content_without_text_clears_hashtags() {
        let db = test_db();
        let a = user(&db, 1);
        let p = post(&db, a.id, "Great #wheat yield");
        assert_eq!(p.hashtags, vec!["wheat"]);

        let visibility_only = UpdatePostRequest {
            visibility: Some(Visibility::Public),
            ..Default::default()
        };
        let untouched = db.update_post(p.id, a.id, &visibility_only).unwrap();
        assert_eq!(untouched.hashtags, vec!["wheat"]);

        let update = UpdatePostRequest {
            content: Some(PostContent::default()),
            ..Default::default()
        };
        let edited = db.update_post(p.id, a.id, &update).unwrap();
        assert!(edited.content.text.is_none());
        assert!(edited.hashtags.is_empty());
        assert!(db.posts_by_hashtag("wheat", PageRequest::default()).unwrap().data.is_empty());
    }

    #[test]
    fn double_like_conflicts_and_counts_once() {
        let db = test_db();
        let a = user(&db, 1);
        let b = user(&db, 2);
        let p = post(&db, a.id, "like me");

        assert_eq!(db.like(b.id, LikeTarget::Post(p.id)).unwrap(), a.id);
        assert!(matches!(db.like(b.id, LikeTarget::Post(p.id)), Err(DomainError::Conflict(_))));
        let seen = db.get_post(p.id, Some(b.id)).unwrap();
        assert_eq!(seen.stats.likes, 1);
        assert_eq!(seen.is_liked, Some(true));

        assert!(db.unlike(b.id, LikeTarget::Post(p.id)).unwrap());
        assert!(!db.unlike(b.id, LikeTarget::Post(p.id)).unwrap());
        assert_eq!(db.get_post(p.id, None).unwrap().stats.likes, 0);
    }

    #[test]
    fn liking_a_missing_target_is_not_found() {
        let db = test_db();
        let a = user(&db, 1);
        assert!(matches!(
            db.like(a.id, LikeTarget::Comment(Uuid::new_v4())),
            Err(DomainError::NotFound(_))
        ));
    }

    #[test]
    fn comments_count_and_reply_rules() {
        let db = test_db();
        let a = user(&db, 1);
        let b = user(&db, 2);
        let p1 = post(&db, a.id, "one");
        let p2 = post(&db, a.id, "two");

        let (top, post_author) = db.add_comment(b.id, p1.id, "nice", None).unwrap();
        assert_eq!(post_author, a.id);
        db.add_comment(a.id, p1.id, "thanks", Some(top.id)).unwrap();
        let err = db.add_comment(b.id, p2.id, "wrong thread", Some(top.id)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        assert_eq!(db.get_post(p1.id, None).unwrap().stats.comments, 2);
        let listed = db.comments(p1.id, PageRequest::default()).unwrap();
        assert_eq!(listed.pagination.total_items, 1);
        assert_eq!(listed.data[0].id, top.id);

        db.like(a.id, LikeTarget::Comment(top.id)).unwrap();
        let listed = db.comments(p1.id, PageRequest::default()).unwrap();
        assert_eq!(listed.data[0].stats.likes, 1);
    }

    #[test]
    fn following_feed_includes_self_and_followed_authors_only() {
        let db = test_db();
        let a = user(&db, 1);
        let b = user(&db, 2);
        let c = user(&db, 3);
        db.follow(a.id, b.id).unwrap();
        post(&db, a.id, "mine");
        post(&db, b.id, "followed");
        post(&db, c.id, "stranger");
        db.create_post(b.id, text_post("hidden", Visibility::Private)).unwrap();

        let feed = db.feed(a.id, FeedFilter::Following, PageRequest::default()).unwrap();
        let texts: Vec<_> = feed.data.iter().filter_map(|p| p.content.text.clone()).collect();
        assert_eq!(texts, vec!["followed", "mine"]);

        let latest = db.feed(a.id, FeedFilter::Latest, PageRequest::default()).unwrap();
        assert_eq!(latest.pagination.total_items, 3);
    }

    #[test]
    fn trending_requires_likes_and_orders_by_them() {
        let db = test_db();
        let a = user(&db, 1);
        let b = user(&db, 2);
        let quiet = post(&db, a.id, "quiet");
        let popular = post(&db, a.id, "popular");
        let mild = post(&db, a.id, "mild");
        db.like(a.id, LikeTarget::Post(popular.id)).unwrap();
        db.like(b.id, LikeTarget::Post(popular.id)).unwrap();
        db.like(b.id, LikeTarget::Post(mild.id)).unwrap();

        let trending = db.feed(a.id, FeedFilter::Trending, PageRequest::default()).unwrap();
        let ids: Vec<_> = trending.data.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![popular.id, mild.id]);
        assert!(!ids.contains(&quiet.id));
    }

    #[test]
    fn private_posts_are_visible_only_to_their_author() {
        let db = test_db();
        let a = user(&db, 1);
        let b = user(&db, 2);
        post(&db, a.id, "public");
        db.create_post(a.id, text_post("private", Visibility::Private)).unwrap();

        assert_eq!(db.user_posts(a.id, a.id, PageRequest::default()).unwrap().data.len(), 2);
        assert_eq!(db.user_posts(a.id, b.id, PageRequest::default()).unwrap().data.len(), 1);
    }

    #[test]
    fn hashtag_lookup_ignores_case_and_hash_prefix() {
        let db = test_db();
        let a = user(&db, 1);
        post(&db, a.id, "sowing #Kharif now");
        post(&db, a.id, "nothing");
        let page = db.posts_by_hashtag("#KHARIF", PageRequest::default()).unwrap();
        assert_eq!(page.data.len(), 1);
    }
}
