use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use tracing::debug;
use uuid::Uuid;

use krishi_db::DomainError;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// The authenticated caller, inserted into request extensions.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

/// Validate the bearer access token and load the caller. Missing, expired
/// or invalid tokens are 401; banned or deactivated accounts are 403.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> ApiResult<Response> {
    let TypedHeader(Authorization(bearer)) =
        bearer.ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
    let claims = state.signer.verify_access(bearer.token())?;

    let user_id = claims.sub;
    let user = state
        .db
        .call(move |db| db.find_user(user_id))
        .await?
        .ok_or_else(|| ApiError::unauthorized("User not found"))?;
    if user.is_banned {
        return Err(DomainError::forbidden("Account is banned").into());
    }
    if !user.is_active {
        return Err(DomainError::forbidden("Account is disabled").into());
    }

    debug!("{} {} by {}", req.method(), req.uri().path(), user_id);
    req.extensions_mut().insert(AuthUser(user_id));
    Ok(next.run(req).await)
}
