use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Extension, extract::State};
use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use krishi_db::DomainError;
use krishi_db::models::PendingRegistration;
use krishi_types::api::{
    AccessTokenResponse, AuthResponse, AuthTokens, LoginRequest, LogoutRequest,
    RefreshTokenRequest, RegisterRequest, RegisterResponse, VerifyOtpRequest,
};

use crate::error::{ApiError, ApiResult};
use crate::middleware::AuthUser;
use crate::reply::{self, Done, Reply};
use crate::state::AppState;
use crate::validation::ValidJson;

fn hash_password(password: &str) -> Result<String, DomainError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| DomainError::Internal(anyhow::anyhow!("password hashing failed: {}", e)))
}

fn password_matches(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .and_then(|parsed| Argon2::default().verify_password(password.as_bytes(), &parsed))
        .is_ok()
}

fn generate_otp() -> String {
    rand::rng().random_range(100_000..1_000_000).to_string()
}

async fn issue_tokens(state: &AppState, user_id: Uuid) -> ApiResult<AuthTokens> {
    let access_token = state.signer.issue_access(user_id)?;
    let refresh_token = state.signer.issue_refresh(user_id)?;
    let expires_at = Utc::now() + state.signer.refresh_ttl();

    let stored = refresh_token.clone();
    state
        .db
        .call(move |db| db.store_refresh_token(user_id, &stored, expires_at))
        .await?;

    Ok(AuthTokens {
        access_token,
        refresh_token,
    })
}

/// Stage a registration and send an OTP. The account is created once the
/// code is verified.
pub async fn register(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<RegisterRequest>,
) -> ApiResult<Reply<RegisterResponse>> {
    let phone = req.phone_number.clone();
    let registered = state.db.call(move |db| db.phone_registered(&phone)).await?;
    if registered {
        return Err(DomainError::conflict("Phone number already registered").into());
    }

    let pending = PendingRegistration {
        phone_number: req.phone_number.clone(),
        name: req.name.trim().to_string(),
        password_hash: hash_password(&req.password)?,
        location: req.location,
    };
    let otp = generate_otp();
    let now = Utc::now();
    let otp_expires_at = now + state.auth.otp_ttl;
    let pending_expires_at = now + state.auth.pending_registration_ttl;

    let code = otp.clone();
    state
        .db
        .call(move |db| db.stage_registration(&pending, &code, otp_expires_at, pending_expires_at))
        .await?;
    state.otp.send(&req.phone_number, &otp).await?;

    info!("Registration staged for {}", req.phone_number);
    Ok(reply::created(
        RegisterResponse {
            otp_sent: true,
            phone_number: req.phone_number,
        },
        "OTP sent to your phone",
    ))
}

/// Complete a staged registration.
pub async fn verify_otp(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<VerifyOtpRequest>,
) -> ApiResult<Reply<AuthResponse>> {
    let max_attempts = state.auth.otp_max_attempts;
    let user = state
        .db
        .call(move |db| {
            db.verify_otp(&req.phone_number, &req.otp, max_attempts)?;
            let pending = db
                .take_pending_registration(&req.phone_number)?
                .ok_or_else(|| DomainError::bad_request("Registration session expired"))?;
            db.create_user(&pending)
        })
        .await?;

    let tokens = issue_tokens(&state, user.id).await?;
    info!("User {} registered", user.id);
    Ok(reply::ok(AuthResponse { user, tokens }, "Registration successful"))
}

pub async fn login(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<LoginRequest>,
) -> ApiResult<Reply<AuthResponse>> {
    let phone = req.phone_number.clone();
    let credentials = state
        .db
        .call(move |db| db.credentials_by_phone(&phone))
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    if credentials.is_banned {
        return Err(DomainError::forbidden("Account is banned").into());
    }
    if !password_matches(&req.password, &credentials.password_hash) {
        warn!("Failed login for {}", req.phone_number);
        return Err(ApiError::unauthorized("Invalid credentials"));
    }
    if !credentials.is_active {
        return Err(DomainError::forbidden("Account is disabled").into());
    }

    let user_id = credentials.id;
    let user = state.db.call(move |db| db.record_login(user_id)).await?;
    let tokens = issue_tokens(&state, user_id).await?;
    Ok(reply::ok(AuthResponse { user, tokens }, "Login successful"))
}

/// Exchange a stored, unrevoked refresh token for a new access token.
pub async fn refresh_token(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<RefreshTokenRequest>,
) -> ApiResult<Reply<AccessTokenResponse>> {
    let claims = state.signer.verify_refresh(&req.refresh_token)?;

    let token = req.refresh_token;
    let owner = state.db.call(move |db| db.refresh_token_owner(&token)).await?;
    if owner != Some(claims.sub) {
        return Err(ApiError::unauthorized("Invalid refresh token"));
    }

    let access_token = state.signer.issue_access(claims.sub)?;
    Ok(reply::ok(AccessTokenResponse { access_token }, "Token refreshed"))
}

/// Revoke the given refresh token, or every session of the caller when none
/// is supplied.
pub async fn logout(
    State(state): State<AppState>,
    Extension(AuthUser(me)): Extension<AuthUser>,
    ValidJson(req): ValidJson<LogoutRequest>,
) -> ApiResult<Reply<Done>> {
    let result = match req.refresh_token {
        Some(token) => state.db.call(move |db| db.revoke_refresh_token(&token).map(usize::from)).await,
        None => state.db.call(move |db| db.revoke_all_refresh_tokens(me)).await,
    };
    match result {
        Ok(revoked) => info!("{} logged out ({} sessions revoked)", me, revoked),
        Err(e) => warn!("Logout revocation for {} failed: {}", me, e),
    }
    Ok(reply::done("Logged out successfully"))
}
