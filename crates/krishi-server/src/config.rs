use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "your-secret-key",
    "secret",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub jwt_refresh_secret: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub otp_ttl_secs: i64,
    pub otp_max_attempts: u32,
    pub pending_registration_ttl_secs: i64,
    pub sms_webhook_url: Option<String>,
    pub upload_dir: PathBuf,
    pub public_upload_url: String,
    pub maintenance_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let secret = |key: &str| -> anyhow::Result<String> {
            let value = get(key).unwrap_or_default();
            if value.is_empty() || PLACEHOLDER_SECRETS.contains(&value.as_str()) {
                bail!("{} is unset or still a placeholder; set it in your .env file", key);
            }
            Ok(value)
        };

        let config = Self {
            host: get("KRISHI_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse(&get, "KRISHI_PORT", 3000)?,
            db_path: get("KRISHI_DB_PATH").unwrap_or_else(|| "krishi.db".into()).into(),
            jwt_secret: secret("KRISHI_JWT_SECRET")?,
            jwt_refresh_secret: secret("KRISHI_JWT_REFRESH_SECRET")?,
            access_token_ttl_secs: parse(&get, "KRISHI_ACCESS_TOKEN_TTL_SECS", 7 * 24 * 3600)?,
            refresh_token_ttl_secs: parse(&get, "KRISHI_REFRESH_TOKEN_TTL_SECS", 30 * 24 * 3600)?,
            otp_ttl_secs: parse(&get, "KRISHI_OTP_TTL_SECS", 300)?,
            otp_max_attempts: parse(&get, "KRISHI_OTP_MAX_ATTEMPTS", 3)?,
            pending_registration_ttl_secs: parse(&get, "KRISHI_PENDING_REGISTRATION_TTL_SECS", 3600)?,
            sms_webhook_url: get("KRISHI_SMS_WEBHOOK_URL").filter(|v| !v.is_empty()),
            upload_dir: get("KRISHI_UPLOAD_DIR").unwrap_or_else(|| "./uploads".into()).into(),
            public_upload_url: get("KRISHI_PUBLIC_UPLOAD_URL").unwrap_or_else(|| "/uploads".into()),
            maintenance_interval_secs: parse(&get, "KRISHI_MAINTENANCE_INTERVAL_SECS", 3600)?,
        };

        if config.jwt_secret == config.jwt_refresh_secret {
            bail!("KRISHI_JWT_SECRET and KRISHI_JWT_REFRESH_SECRET must differ");
        }
        if config.otp_max_attempts == 0 {
            bail!("KRISHI_OTP_MAX_ATTEMPTS must be at least 1");
        }
        if config.maintenance_interval_secs == 0 {
            bail!("KRISHI_MAINTENANCE_INTERVAL_SECS must be at least 1");
        }
        Ok(config)
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const SECRETS: [(&str, &str); 2] = [
        ("KRISHI_JWT_SECRET", "a-long-access-secret"),
        ("KRISHI_JWT_REFRESH_SECRET", "a-long-refresh-secret"),
    ];

    #[test]
    fn defaults_apply_when_only_secrets_are_set() {
        let config = load(&SECRETS).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.otp_ttl_secs, 300);
        assert_eq!(config.otp_max_attempts, 3);
        assert_eq!(config.access_token_ttl_secs, 604_800);
        assert_eq!(config.public_upload_url, "/uploads");
        assert!(config.sms_webhook_url.is_none());
    }

    #[test]
    fn missing_or_placeholder_secret_aborts() {
        assert!(load(&[SECRETS[1]]).is_err());
        let err = load(&[("KRISHI_JWT_SECRET", "dev-secret-change-me"), SECRETS[1]]).unwrap_err();
        assert!(err.to_string().contains("KRISHI_JWT_SECRET"));
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let mut vars = SECRETS.to_vec();
        vars.push(("KRISHI_PORT", "eighty"));
        let err = load(&vars).unwrap_err();
        assert!(format!("{:#}", err).contains("KRISHI_PORT"));
    }
}
