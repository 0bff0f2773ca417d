use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// JWT claims shared across krishi-api (REST middleware) and krishi-gateway
/// (WebSocket handshake). `sub` is the user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub iat: usize,
    pub exp: usize,
    #[serde(default)]
    pub typ: TokenKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    #[default]
    Access,
    Refresh,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
    #[error("wrong token type")]
    WrongKind,
    #[error("failed to sign token")]
    Signing,
}

/// Issues and verifies access/refresh tokens. Access and refresh tokens are
/// signed with different secrets.
#[derive(Clone)]
pub struct TokenSigner {
    access_secret: String,
    refresh_secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenSigner {
    pub fn new(
        access_secret: impl Into<String>,
        refresh_secret: impl Into<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            access_secret: access_secret.into(),
            refresh_secret: refresh_secret.into(),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    pub fn issue_access(&self, user_id: Uuid) -> Result<String, TokenError> {
        sign(&self.access_secret, user_id, self.access_ttl, TokenKind::Access)
    }

    pub fn issue_refresh(&self, user_id: Uuid) -> Result<String, TokenError> {
        sign(&self.refresh_secret, user_id, self.refresh_ttl, TokenKind::Refresh)
    }

    pub fn verify_access(&self, token: &str) -> Result<Claims, TokenError> {
        verify(&self.access_secret, token, TokenKind::Access)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        verify(&self.refresh_secret, token, TokenKind::Refresh)
    }
}

fn sign(secret: &str, user_id: Uuid, ttl: Duration, typ: TokenKind) -> Result<String, TokenError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        iat: now.timestamp() as usize,
        exp: (now + ttl).timestamp().max(0) as usize,
        typ,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| TokenError::Signing)
}

fn verify(secret: &str, token: &str, expected: TokenKind) -> Result<Claims, TokenError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid,
    })?;

    if data.claims.typ != expected {
        return Err(TokenError::WrongKind);
    }
    Ok(data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(access_ttl: Duration) -> TokenSigner {
        TokenSigner::new("access-secret", "refresh-secret", access_ttl, Duration::days(30))
    }

    #[test]
    fn access_token_round_trips_user_id() {
        let s = signer(Duration::days(7));
        let user_id = Uuid::new_v4();
        let token = s.issue_access(user_id).unwrap();
        let claims = s.verify_access(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn expired_token_is_rejected() {
        let s = signer(Duration::hours(-2));
        let token = s.issue_access(Uuid::new_v4()).unwrap();
        assert_eq!(s.verify_access(&token).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let s = signer(Duration::days(7));
        let refresh = s.issue_refresh(Uuid::new_v4()).unwrap();
        // Different secret, so the signature check fails first.
        assert_eq!(s.verify_access(&refresh).unwrap_err(), TokenError::Invalid);
        assert!(s.verify_refresh(&refresh).is_ok());
    }

    #[test]
    fn tampered_token_is_invalid() {
        let s = signer(Duration::days(7));
        let mut token = s.issue_access(Uuid::new_v4()).unwrap();
        token.push('x');
        assert_eq!(s.verify_access(&token).unwrap_err(), TokenError::Invalid);
    }
}
