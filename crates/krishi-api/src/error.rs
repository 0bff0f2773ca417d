use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use krishi_db::DomainError;
use krishi_types::api::{ApiResponse, FieldError};
use krishi_types::auth::TokenError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Handler error rendered as the uniform failure envelope.
#[derive(Debug)]
pub struct ApiError(pub DomainError);

impl From<DomainError> for ApiError {
    fn from(e: DomainError) -> Self {
        Self(e)
    }
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        Self(match e {
            TokenError::Expired => DomainError::Unauthorized("Token expired".into()),
            TokenError::Invalid | TokenError::WrongKind => DomainError::Unauthorized("Invalid token".into()),
            TokenError::Signing => DomainError::Internal(anyhow::anyhow!("token signing failed")),
        })
    }
}

impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self(DomainError::Unauthorized(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DomainError::Validation(_) | DomainError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DomainError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            DomainError::Forbidden(_) => StatusCode::FORBIDDEN,
            DomainError::NotFound(_) => StatusCode::NOT_FOUND,
            DomainError::Conflict(_) => StatusCode::CONFLICT,
            DomainError::TooManyAttempts(_) => StatusCode::TOO_MANY_REQUESTS,
            DomainError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DomainError::Database(_) | DomainError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, errors): (String, Vec<FieldError>) = match self.0 {
            DomainError::Validation(errors) => ("Validation failed".into(), errors),
            DomainError::BadRequest(m)
            | DomainError::Unauthorized(m)
            | DomainError::Forbidden(m)
            | DomainError::NotFound(m)
            | DomainError::Conflict(m)
            | DomainError::TooManyAttempts(m)
            | DomainError::Unavailable(m) => (m, Vec::new()),
            DomainError::Database(e) => {
                error!("Database error: {}", e);
                ("Internal server error".into(), Vec::new())
            }
            DomainError::Internal(e) => {
                error!("Internal error: {:#}", e);
                ("Internal server error".into(), Vec::new())
            }
        };

        let body = ApiResponse::failure(status.as_u16(), message, errors);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_kinds_map_to_http_statuses() {
        let cases = [
            (DomainError::field("name", "is required"), 400),
            (DomainError::Unauthorized("no".into()), 401),
            (DomainError::forbidden("no"), 403),
            (DomainError::not_found("no"), 404),
            (DomainError::conflict("no"), 409),
            (DomainError::TooManyAttempts("no".into()), 429),
            (DomainError::Unavailable("sms".into()), 503),
            (DomainError::Internal(anyhow::anyhow!("boom")), 500),
        ];
        for (err, code) in cases {
            assert_eq!(ApiError(err).status().as_u16(), code);
        }
    }

    #[test]
    fn expired_token_is_unauthorized() {
        let err = ApiError::from(TokenError::Expired);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert!(matches!(err.0, DomainError::Unauthorized(ref m) if m == "Token expired"));
    }
}
