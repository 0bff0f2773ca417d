use std::sync::Arc;

use chrono::Duration;

use krishi_db::Database;
use krishi_gateway::Gateway;
use krishi_types::auth::TokenSigner;

use crate::blobs::BlobStore;
use crate::otp::OtpSender;

/// Knobs of the OTP registration flow.
#[derive(Debug, Clone, Copy)]
pub struct AuthSettings {
    pub otp_ttl: Duration,
    pub otp_max_attempts: u32,
    pub pending_registration_ttl: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            otp_ttl: Duration::seconds(300),
            otp_max_attempts: 3,
            pending_registration_ttl: Duration::seconds(3600),
        }
    }
}

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub gateway: Gateway,
    pub signer: TokenSigner,
    pub auth: AuthSettings,
    pub otp: Arc<dyn OtpSender>,
    pub blobs: Arc<dyn BlobStore>,
}

pub type AppState = Arc<AppStateInner>;
