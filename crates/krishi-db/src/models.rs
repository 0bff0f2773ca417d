/// Store-side row types that never cross the wire.
/// Public documents live in krishi-types.
use uuid::Uuid;

use krishi_types::models::Location;

/// What login needs to know about an account; the hash stays in the store layer.
pub struct Credentials {
    pub id: Uuid,
    pub password_hash: String,
    pub is_active: bool,
    pub is_banned: bool,
}

/// Registration parked until the phone number is verified by OTP.
pub struct PendingRegistration {
    pub phone_number: String,
    pub name: String,
    pub password_hash: String,
    pub location: Option<Location>,
}

/// Counter drift repaired by one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub users: usize,
    pub posts: usize,
    pub comments: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.users + self.posts + self.comments
    }
}

/// Expired short-lived rows removed by one purge pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub otp_codes: usize,
    pub pending_registrations: usize,
    pub refresh_tokens: usize,
    pub blacklisted_tokens: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.otp_codes + self.pending_registrations + self.refresh_tokens + self.blacklisted_tokens
    }
}
