use axum::{
    Extension,
    extract::State,
};
use tracing::info;
use uuid::Uuid;

use krishi_db::pagination::{DEFAULT_LIMIT, PageRequest};
use krishi_db::posts::NewPost;
use krishi_types::api::{CommentRequest, CreatePostRequest, FeedQuery, PageQuery, UpdatePostRequest};
use krishi_types::events::NotificationKind;
use krishi_types::models::{Comment, LikeTarget, Post};

use crate::error::ApiResult;
use crate::middleware::AuthUser;
use crate::reply::{self, Done, Reply};
use crate::state::AppState;
use crate::validation::{Path, Query, ValidJson};

pub async fn create_post(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    ValidJson(req): ValidJson<CreatePostRequest>,
) -> ApiResult<Reply<Post>> {
    let new_post = NewPost {
        kind: req.kind,
        content: req.content,
        media: req.media,
        poll: req.poll,
        category: req.category,
        visibility: req.visibility,
        mentions: req.mentions,
    };
    let post = state.db.call(move |db| db.create_post(me, new_post)).await?;
    info!("{} created post {}", me, post.id);
    Ok(reply::created(post, "Post created successfully"))
}

pub async fn feed(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Query(query): Query<FeedQuery>,
) -> ApiResult<Reply<Vec<Post>>> {
    let page = PageRequest::new(query.page, query.limit, DEFAULT_LIMIT);
    let filter = query.filter;
    let posts = state.db.call(move |db| db.feed(me, filter, page)).await?;
    Ok(reply::page(posts, "Feed fetched successfully"))
}

pub async fn user_posts(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(author): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Reply<Vec<Post>>> {
    let page = PageRequest::new(query.page, query.limit, DEFAULT_LIMIT);
    let posts = state.db.call(move |db| db.user_posts(author, me, page)).await?;
    Ok(reply::page(posts, "Posts fetched successfully"))
}

pub async fn by_hashtag(
    State(state): State<AppState>,
    Path(tag): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Reply<Vec<Post>>> {
    let page = PageRequest::new(query.page, query.limit, DEFAULT_LIMIT);
    let tag = tag.trim_start_matches('#').to_lowercase();
    let posts = state.db.call(move |db| db.posts_by_hashtag(&tag, page)).await?;
    Ok(reply::page(posts, "Posts fetched successfully"))
}

pub async fn get_post(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(post_id): Path<Uuid>,
) -> ApiResult<Reply<Post>> {
    let post = state.db.call(move |db| db.get_post(post_id, Some(me))).await?;
    Ok(reply::ok(post, "Post fetched successfully"))
}

pub async fn update_post(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(post_id): Path<Uuid>,
    ValidJson(update): ValidJson<UpdatePostRequest>,
) -> ApiResult<Reply<Post>> {
    let post = state
        .db
        .call(move |db| db.update_post(post_id, me, &update))
        .await?;
    Ok(reply::ok(post, "Post updated successfully"))
}

pub async fn delete_post(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(post_id): Path<Uuid>,
) -> ApiResult<Reply<Done>> {
    state.db.call(move |db| db.delete_post(post_id, me)).await?;
    Ok(reply::done("Post deleted successfully"))
}

pub async fn like_post(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(post_id): Path<Uuid>,
) -> ApiResult<Reply<Done>> {
    let author = state
        .db
        .call(move |db| db.like(me, LikeTarget::Post(post_id)))
        .await?;
    state
        .gateway
        .notify(author, NotificationKind::PostLiked, me, post_id)
        .await;
    Ok(reply::done("Post liked"))
}

pub async fn unlike_post(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(post_id): Path<Uuid>,
) -> ApiResult<Reply<Done>> {
    state
        .db
        .call(move |db| db.unlike(me, LikeTarget::Post(post_id)))
        .await?;
    Ok(reply::done("Post unliked"))
}

pub async fn add_comment(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(post_id): Path<Uuid>,
    ValidJson(req): ValidJson<CommentRequest>,
) -> ApiResult<Reply<Comment>> {
    let (comment, author) = state
        .db
        .call(move |db| db.add_comment(me, post_id, req.text.trim(), req.parent_comment))
        .await?;
    state
        .gateway
        .notify(author, NotificationKind::PostCommented, me, post_id)
        .await;
    Ok(reply::created(comment, "Comment added successfully"))
}

pub async fn comments(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Reply<Vec<Comment>>> {
    let page = PageRequest::new(query.page, query.limit, DEFAULT_LIMIT);
    let comments = state.db.call(move |db| db.comments(post_id, page)).await?;
    Ok(reply::page(comments, "Comments fetched successfully"))
}

pub async fn like_comment(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(comment_id): Path<Uuid>,
) -> ApiResult<Reply<Done>> {
    state
        .db
        .call(move |db| db.like(me, LikeTarget::Comment(comment_id)))
        .await?;
    Ok(reply::done("Comment liked"))
}

pub async fn unlike_comment(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(comment_id): Path<Uuid>,
) -> ApiResult<Reply<Done>> {
    state
        .db
        .call(move |db| db.unlike(me, LikeTarget::Comment(comment_id)))
        .await?;
    Ok(reply::done("Comment unliked"))
}
