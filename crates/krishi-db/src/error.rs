use krishi_types::api::FieldError;
use thiserror::Error;

pub type Result<T, E = DomainError> = std::result::Result<T, E>;

/// Error taxonomy shared by every domain operation. The HTTP and socket
/// boundaries map each kind to a transport-appropriate response.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Malformed or missing input; every offending field is listed.
    #[error("validation failed")]
    Validation(Vec<FieldError>),

    /// Request rejected without a per-field breakdown.
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    /// Caller is authenticated but not the owner / not a participant.
    #[error("{0}")]
    Forbidden(String),

    /// Entity absent or soft-deleted.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate unique relation (phone number, like, follow, self-follow).
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    TooManyAttempts(String),

    /// Transient failure of an external collaborator.
    #[error("{0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DomainError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.into())
    }
}

/// True when the error is a UNIQUE/PRIMARY KEY constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}
