use axum::{
    Extension,
    body::Bytes,
    extract::{State, rejection::BytesRejection},
    http::{HeaderMap, StatusCode, header},
};
use tracing::{info, warn};
use uuid::Uuid;

use krishi_db::DomainError;
use krishi_db::pagination::{DEFAULT_LIMIT, PageRequest};
use krishi_types::api::{PageQuery, SearchQuery, UpdateProfileRequest};
use krishi_types::events::NotificationKind;
use krishi_types::models::{Follow, User};

use crate::blobs::image_extension;
use crate::error::ApiResult;
use crate::middleware::AuthUser;
use crate::reply::{self, Done, Reply};
use crate::state::AppState;
use crate::validation::{Path, Query, ValidJson};

/// 5 MB avatar limit
pub(crate) const MAX_AVATAR_SIZE: usize = 5 * 1024 * 1024;

pub async fn get_me(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
) -> ApiResult<Reply<User>> {
    let user = state.db.call(move |db| db.get_user(me)).await?;
    Ok(reply::ok(user, "Profile fetched successfully"))
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    ValidJson(update): ValidJson<UpdateProfileRequest>,
) -> ApiResult<Reply<User>> {
    let user = state.db.call(move |db| db.update_profile(me, &update)).await?;
    Ok(reply::ok(user, "Profile updated successfully"))
}

/// POST /users/me/avatar with the raw image as the body. The previous
/// avatar is deleted best-effort.
pub async fn upload_avatar(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> ApiResult<Reply<User>> {
    let bytes = body.map_err(|rejection| match rejection.status() {
        StatusCode::PAYLOAD_TOO_LARGE => DomainError::field("avatar", "must be at most 5 MB"),
        _ => DomainError::bad_request(rejection.body_text()),
    })?;
    let extension = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(image_extension)
        .ok_or_else(|| DomainError::field("avatar", "must be a JPEG, PNG or WebP image"))?;
    if bytes.is_empty() {
        return Err(DomainError::field("avatar", "is required").into());
    }
    if bytes.len() > MAX_AVATAR_SIZE {
        return Err(DomainError::field("avatar", "must be at most 5 MB").into());
    }

    let media = state.blobs.put("avatars", extension, &bytes).await?;
    let (user, previous) = state.db.call(move |db| db.set_avatar(me, &media)).await?;

    if let Some(previous) = previous {
        if let Err(e) = state.blobs.delete(&previous.public_id).await {
            warn!("Failed to delete old avatar {}: {}", previous.public_id, e);
        }
    }
    Ok(reply::ok(user, "Avatar updated successfully"))
}

pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Reply<Vec<User>>> {
    let page = PageRequest::new(query.page, query.limit, DEFAULT_LIMIT);
    let filter = query.filter;
    let q = query.q;
    let users = state
        .db
        .call(move |db| db.search_users(q.as_deref(), filter, page))
        .await?;
    Ok(reply::page(users, "Users fetched successfully"))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Reply<User>> {
    let user = state.db.call(move |db| db.get_profile(user_id, Some(me))).await?;
    Ok(reply::ok(user, "User fetched successfully"))
}

pub async fn follow(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Reply<Done>> {
    state.db.call(move |db| db.follow(me, user_id)).await?;
    info!("{} followed {}", me, user_id);
    state
        .gateway
        .notify(user_id, NotificationKind::NewFollower, me, me)
        .await;
    Ok(reply::done("User followed successfully"))
}

pub async fn unfollow(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Reply<Done>> {
    state.db.call(move |db| db.unfollow(me, user_id)).await?;
    Ok(reply::done("User unfollowed successfully"))
}

pub async fn followers(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Reply<Vec<Follow>>> {
    let page = PageRequest::new(query.page, query.limit, DEFAULT_LIMIT);
    let edges = state.db.call(move |db| db.followers(user_id, page)).await?;
    Ok(reply::page(edges, "Followers fetched successfully"))
}

pub async fn following(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Reply<Vec<Follow>>> {
    let page = PageRequest::new(query.page, query.limit, DEFAULT_LIMIT);
    let edges = state.db.call(move |db| db.following(user_id, page)).await?;
    Ok(reply::page(edges, "Following fetched successfully"))
}
