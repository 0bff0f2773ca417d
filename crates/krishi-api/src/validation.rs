use axum::{
    Json,
    extract::{FromRequest, FromRequestParts, Request},
    http::request::Parts,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::warn;

use krishi_db::DomainError;
use krishi_types::api::{
    CommentRequest, CreateConversationRequest, CreatePostRequest, FieldError, LoginRequest,
    LogoutRequest, RefreshTokenRequest, RegisterRequest, SendMessageRequest, UpdatePostRequest,
    UpdateProfileRequest, VerifyOtpRequest,
};
use krishi_types::models::{ConversationType, PostType};

use crate::error::ApiError;

static PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[6-9]\d{9}$").expect("valid regex"));
static OTP: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{6}$").expect("valid regex"));

const NAME_MAX: usize = 100;
const PASSWORD_MIN: usize = 6;
const BIO_MAX: usize = 500;
const POST_TEXT_MAX: usize = 5000;
const COMMENT_MAX: usize = 1000;

/// Collects every field problem before failing.
#[derive(Default)]
pub struct Checks {
    errors: Vec<FieldError>,
}

impl Checks {
    pub fn require(&mut self, ok: bool, field: &str, message: &str) -> &mut Self {
        if !ok {
            self.errors.push(FieldError::new(field, message));
        }
        self
    }

    pub fn phone(&mut self, field: &str, value: &str) -> &mut Self {
        if value.is_empty() {
            return self.require(false, field, "is required");
        }
        self.require(PHONE.is_match(value), field, "Invalid Indian phone number")
    }

    pub fn finish(&mut self) -> Result<(), DomainError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(DomainError::Validation(std::mem::take(&mut self.errors)))
        }
    }
}

fn chars(s: &str) -> usize {
    s.chars().count()
}

pub trait Validate {
    fn validate(&self) -> Result<(), DomainError>;
}

impl Validate for RegisterRequest {
    fn validate(&self) -> Result<(), DomainError> {
        let name = self.name.trim();
        Checks::default()
            .phone("phoneNumber", &self.phone_number)
            .require(!name.is_empty(), "name", "is required")
            .require(chars(name) <= NAME_MAX, "name", "must be at most 100 characters")
            .require(
                chars(&self.password) >= PASSWORD_MIN,
                "password",
                "must be at least 6 characters",
            )
            .finish()
    }
}

impl Validate for VerifyOtpRequest {
    fn validate(&self) -> Result<(), DomainError> {
        Checks::default()
            .phone("phoneNumber", &self.phone_number)
            .require(OTP.is_match(&self.otp), "otp", "must be 6 digits")
            .finish()
    }
}

impl Validate for LoginRequest {
    fn validate(&self) -> Result<(), DomainError> {
        Checks::default()
            .phone("phoneNumber", &self.phone_number)
            .require(!self.password.is_empty(), "password", "is required")
            .finish()
    }
}

impl Validate for RefreshTokenRequest {
    fn validate(&self) -> Result<(), DomainError> {
        Checks::default()
            .require(!self.refresh_token.is_empty(), "refreshToken", "is required")
            .finish()
    }
}

impl Validate for LogoutRequest {
    fn validate(&self) -> Result<(), DomainError> {
        Ok(())
    }
}

impl Validate for UpdateProfileRequest {
    fn validate(&self) -> Result<(), DomainError> {
        let name = self.name.as_deref().map(str::trim);
        Checks::default()
            .require(name.is_none_or(|n| !n.is_empty()), "name", "must not be empty")
            .require(name.is_none_or(|n| chars(n) <= NAME_MAX), "name", "must be at most 100 characters")
            .require(
                self.bio.as_deref().is_none_or(|b| chars(b) <= BIO_MAX),
                "bio",
                "must be at most 500 characters",
            )
            .require(self.farm_size.is_none_or(|f| f >= 0.0), "farmSize", "must not be negative")
            .finish()
    }
}

impl Validate for CreatePostRequest {
    fn validate(&self) -> Result<(), DomainError> {
        let text = self.content.text.as_deref().unwrap_or_default();
        Checks::default()
            .require(chars(text) <= POST_TEXT_MAX, "content.text", "must be at most 5000 characters")
            .require(
                self.kind != PostType::Text || !text.trim().is_empty(),
                "content.text",
                "is required",
            )
            .require(
                self.kind != PostType::Poll || self.poll.as_ref().is_some_and(|p| p.options.len() >= 2),
                "poll.options",
                "needs at least 2 options",
            )
            .finish()
    }
}

impl Validate for UpdatePostRequest {
    fn validate(&self) -> Result<(), DomainError> {
        let text = self
            .content
            .as_ref()
            .and_then(|c| c.text.as_deref())
            .unwrap_or_default();
        Checks::default()
            .require(chars(text) <= POST_TEXT_MAX, "content.text", "must be at most 5000 characters")
            .finish()
    }
}

impl Validate for CommentRequest {
    fn validate(&self) -> Result<(), DomainError> {
        let text = self.text.trim();
        Checks::default()
            .require(!text.is_empty(), "text", "is required")
            .require(chars(text) <= COMMENT_MAX, "text", "must be at most 1000 characters")
            .finish()
    }
}

impl Validate for CreateConversationRequest {
    fn validate(&self) -> Result<(), DomainError> {
        Checks::default()
            .require(!self.participants.is_empty(), "participants", "is required")
            .require(
                self.kind != ConversationType::Group
                    || self.name.as_deref().is_none_or(|n| chars(n.trim()) <= NAME_MAX),
                "name",
                "must be at most 100 characters",
            )
            .finish()
    }
}

// Content rules depend on the message type and live with the store.
impl Validate for SendMessageRequest {
    fn validate(&self) -> Result<(), DomainError> {
        Ok(())
    }
}

/// JSON body extractor that rejects with the failure envelope and runs
/// [`Validate`] before the handler sees the value.
pub struct ValidJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await.map_err(|rejection| {
            warn!("Rejected request body: {}", rejection.body_text());
            ApiError(DomainError::bad_request(rejection.body_text()))
        })?;
        value.validate()?;
        Ok(Self(value))
    }
}

/// Path parameters; a malformed segment rejects with the failure envelope.
pub struct Path<T>(pub T);

impl<S, T> FromRequestParts<S> for Path<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let axum::extract::Path(value) = axum::extract::Path::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| {
                warn!("Rejected path: {}", rejection.body_text());
                ApiError(DomainError::bad_request(rejection.body_text()))
            })?;
        Ok(Self(value))
    }
}

/// Query string; bad values reject with the failure envelope.
pub struct Query<T>(pub T);

impl<S, T> FromRequestParts<S> for Query<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let axum::extract::Query(value) = axum::extract::Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| {
                warn!("Rejected query: {}", rejection.body_text());
                ApiError(DomainError::bad_request(rejection.body_text()))
            })?;
        Ok(Self(value))
    }
}
