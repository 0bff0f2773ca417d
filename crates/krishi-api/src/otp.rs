use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use krishi_db::DomainError;

/// Delivers one-time codes to a phone number.
#[async_trait]
pub trait OtpSender: Send + Sync {
    async fn send(&self, phone_number: &str, code: &str) -> Result<(), DomainError>;
}

/// Writes codes to the log. Used when no SMS webhook is configured.
pub struct LogOtpSender;

#[async_trait]
impl OtpSender for LogOtpSender {
    async fn send(&self, phone_number: &str, code: &str) -> Result<(), DomainError> {
        info!("OTP for {}: {}", phone_number, code);
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SmsPayload<'a> {
    phone_number: &'a str,
    message: String,
}

/// POSTs each code to an SMS gateway webhook as JSON.
pub struct WebhookOtpSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookOtpSender {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl OtpSender for WebhookOtpSender {
    async fn send(&self, phone_number: &str, code: &str) -> Result<(), DomainError> {
        let payload = SmsPayload {
            phone_number,
            message: format!("Your KrishiConnect verification code is {}", code),
        };

        self.client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| {
                error!("SMS webhook failed for {}: {}", phone_number, e);
                DomainError::Unavailable("Failed to send OTP".into())
            })?;
        Ok(())
    }
}
