use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::collections::USERS;
use crate::error::{DomainError, Result, is_unique_violation};
use crate::models::{Credentials, PendingRegistration, PurgeReport};
use crate::pagination::{Filter, Query, find_one_as};
use crate::{Database, now, timestamp};
use krishi_types::models::User;

/// Tokens are only ever stored as their SHA-256 digest.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl Database {
    // -- Pending registrations & OTP --

    pub fn phone_registered(&self, phone_number: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM users WHERE phone_number = ?1",
                    [phone_number],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            Ok(exists)
        })
    }

    /// Park a registration and its OTP. A repeated registration for the same
    /// number replaces both and resets the attempt counter.
    pub fn stage_registration(
        &self,
        pending: &PendingRegistration,
        otp: &str,
        expires_at: DateTime<Utc>,
        pending_expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let location = pending
            .location
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO pending_registrations (phone_number, name, password_hash, location, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(phone_number) DO UPDATE SET
                    name = excluded.name,
                    password_hash = excluded.password_hash,
                    location = excluded.location,
                    expires_at = excluded.expires_at",
                params![
                    pending.phone_number,
                    pending.name,
                    pending.password_hash,
                    location,
                    timestamp(pending_expires_at)
                ],
            )?;
            upsert_otp(&tx, &pending.phone_number, otp, expires_at)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Check an OTP. A wrong code burns one attempt; the last allowed attempt
    /// deletes the code. A correct code is consumed.
    pub fn verify_otp(&self, phone_number: &str, code: &str, max_attempts: u32) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row: Option<(String, u32)> = tx
                .query_row(
                    "SELECT code, attempts FROM otp_codes WHERE phone_number = ?1 AND expires_at > ?2",
                    params![phone_number, now()],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let Some((expected, attempts)) = row else {
                return Err(DomainError::bad_request("OTP expired or not found"));
            };

            if expected != code {
                let attempts = attempts + 1;
                let outcome = if attempts >= max_attempts {
                    tx.execute("DELETE FROM otp_codes WHERE phone_number = ?1", [phone_number])?;
                    DomainError::TooManyAttempts("Too many failed attempts. Please request a new OTP".into())
                } else {
                    tx.execute(
                        "UPDATE otp_codes SET attempts = ?2 WHERE phone_number = ?1",
                        params![phone_number, attempts],
                    )?;
                    DomainError::bad_request("Invalid OTP")
                };
                tx.commit()?;
                return Err(outcome);
            }

            tx.execute("DELETE FROM otp_codes WHERE phone_number = ?1", [phone_number])?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Remove and return the unexpired pending registration for a number.
    pub fn take_pending_registration(&self, phone_number: &str) -> Result<Option<PendingRegistration>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let row: Option<(String, String, Option<String>)> = tx
                .query_row(
                    "SELECT name, password_hash, location FROM pending_registrations
                     WHERE phone_number = ?1 AND expires_at > ?2",
                    params![phone_number, now()],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            tx.execute(
                "DELETE FROM pending_registrations WHERE phone_number = ?1",
                [phone_number],
            )?;
            tx.commit()?;

            row.map(|(name, password_hash, location)| {
                Ok::<_, DomainError>(PendingRegistration {
                    phone_number: phone_number.to_string(),
                    name,
                    password_hash,
                    location: location.as_deref().map(serde_json::from_str).transpose()?,
                })
            })
            .transpose()
        })
    }

    // -- Accounts --

    pub fn create_user(&self, pending: &PendingRegistration) -> Result<User> {
        let id = Uuid::new_v4();
        let location = pending
            .location
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_conn(|conn| {
            let ts = now();
            conn.execute(
                "INSERT INTO users (id, phone_number, password, name, location, last_login, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)",
                params![
                    id.to_string(),
                    pending.phone_number,
                    pending.password_hash,
                    pending.name,
                    location,
                    ts
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DomainError::conflict("Phone number already registered")
                } else {
                    e.into()
                }
            })?;
            load_user(conn, id)
        })
    }

    pub fn credentials_by_phone(&self, phone_number: &str) -> Result<Option<Credentials>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, password, is_active, is_banned FROM users WHERE phone_number = ?1",
                    [phone_number],
                    |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, bool>(2)?,
                            r.get::<_, bool>(3)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(id, password_hash, is_active, is_banned)| {
                Ok::<_, DomainError>(Credentials {
                    id: parse_id(&id)?,
                    password_hash,
                    is_active,
                    is_banned,
                })
            })
            .transpose()
        })
    }

    /// Stamp a successful login and return the refreshed profile.
    pub fn record_login(&self, user_id: Uuid) -> Result<User> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_login = ?2 WHERE id = ?1",
                params![user_id.to_string(), now()],
            )?;
            load_user(conn, user_id)
        })
    }

    // -- Refresh tokens --

    pub fn store_refresh_token(&self, user_id: Uuid, token: &str, expires_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO refresh_tokens (token_hash, user_id, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![hash_token(token), user_id.to_string(), timestamp(expires_at), now()],
            )?;
            Ok(())
        })
    }

    /// The owner of a live, non-revoked refresh token.
    pub fn refresh_token_owner(&self, token: &str) -> Result<Option<Uuid>> {
        let digest = hash_token(token);
        self.with_conn(|conn| {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM refresh_tokens
                     WHERE token_hash = ?1 AND expires_at > ?2
                       AND NOT EXISTS (SELECT 1 FROM token_blacklist b WHERE b.token_hash = ?1)",
                    params![digest, now()],
                    |r| r.get(0),
                )
                .optional()?;
            owner.as_deref().map(parse_id).transpose()
        })
    }

    /// Revoke a refresh token: drop it from the live set and blacklist its
    /// digest until it would have expired anyway.
    pub fn revoke_refresh_token(&self, token: &str) -> Result<bool> {
        let digest = hash_token(token);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let expires_at: Option<String> = tx
                .query_row(
                    "SELECT expires_at FROM refresh_tokens WHERE token_hash = ?1",
                    [&digest],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(expires_at) = expires_at else {
                return Ok(false);
            };
            tx.execute("DELETE FROM refresh_tokens WHERE token_hash = ?1", [&digest])?;
            tx.execute(
                "INSERT OR IGNORE INTO token_blacklist (token_hash, expires_at) VALUES (?1, ?2)",
                params![digest, expires_at],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    pub fn revoke_all_refresh_tokens(&self, user_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM refresh_tokens WHERE user_id = ?1",
                [user_id.to_string()],
            )?;
            Ok(n)
        })
    }

    // -- Housekeeping --

    pub fn purge_expired(&self) -> Result<PurgeReport> {
        self.with_conn(|conn| {
            let ts = now();
            Ok(PurgeReport {
                otp_codes: conn.execute("DELETE FROM otp_codes WHERE expires_at <= ?1", [&ts])?,
                pending_registrations: conn
                    .execute("DELETE FROM pending_registrations WHERE expires_at <= ?1", [&ts])?,
                refresh_tokens: conn.execute("DELETE FROM refresh_tokens WHERE expires_at <= ?1", [&ts])?,
                blacklisted_tokens: conn.execute("DELETE FROM token_blacklist WHERE expires_at <= ?1", [&ts])?,
            })
        })
    }
}

fn upsert_otp(conn: &Connection, phone_number: &str, code: &str, expires_at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO otp_codes (phone_number, code, attempts, expires_at) VALUES (?1, ?2, 0, ?3)
         ON CONFLICT(phone_number) DO UPDATE SET
            code = excluded.code, attempts = 0, expires_at = excluded.expires_at",
        params![phone_number, code, timestamp(expires_at)],
    )?;
    Ok(())
}

pub(crate) fn load_user(conn: &Connection, id: Uuid) -> Result<User> {
    let query = Query::new(&USERS).filter(Filter::eq("id", id.to_string()));
    find_one_as(conn, &query)?.ok_or_else(|| DomainError::not_found("User not found"))
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| DomainError::Internal(anyhow::anyhow!("corrupt id '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::testing::{pending, test_db};

    fn stage(db: &Database, phone: &str, otp: &str) {
        let in_five = Utc::now() + Duration::minutes(5);
        db.stage_registration(&pending(phone, "Asha"), otp, in_five, in_five).unwrap();
    }

    #[test]
    fn otp_is_consumed_on_success() {
        let db = test_db();
        stage(&db, "9876543210", "123456");
        db.verify_otp("9876543210", "123456", 3).unwrap();
        let again = db.verify_otp("9876543210", "123456", 3).unwrap_err();
        assert!(matches!(again, DomainError::BadRequest(_)));
    }

    #[test]
    fn otp_locks_out_after_max_attempts() {
        let db = test_db();
        stage(&db, "9876543210", "123456");
        assert!(matches!(db.verify_otp("9876543210", "000000", 3), Err(DomainError::BadRequest(_))));
        assert!(matches!(db.verify_otp("9876543210", "000000", 3), Err(DomainError::BadRequest(_))));
        assert!(matches!(
            db.verify_otp("9876543210", "000000", 3),
            Err(DomainError::TooManyAttempts(_))
        ));
        // code is gone even though the right one is now supplied
        assert!(matches!(db.verify_otp("9876543210", "123456", 3), Err(DomainError::BadRequest(_))));
    }

    #[test]
    fn expired_otp_is_rejected() {
        let db = test_db();
        let past = Utc::now() - Duration::minutes(1);
        db.stage_registration(&pending("9876543210", "Asha"), "123456", past, past)
            .unwrap();
        assert!(db.verify_otp("9876543210", "123456", 3).is_err());
        assert!(db.take_pending_registration("9876543210").unwrap().is_none());
    }

    #[test]
    fn restaging_resets_attempts() {
        let db = test_db();
        stage(&db, "9876543210", "111111");
        let _ = db.verify_otp("9876543210", "000000", 2);
        stage(&db, "9876543210", "222222");
        assert!(matches!(db.verify_otp("9876543210", "000000", 2), Err(DomainError::BadRequest(_))));
    }

    #[test]
    fn duplicate_phone_is_a_conflict() {
        let db = test_db();
        db.create_user(&pending("9876543210", "Asha")).unwrap();
        let err = db.create_user(&pending("9876543210", "Other")).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert!(db.phone_registered("9876543210").unwrap());
    }

    #[test]
    fn created_user_starts_with_zero_counters() {
        let db = test_db();
        let user = db.create_user(&pending("9876543210", "Asha")).unwrap();
        assert_eq!(user.name, "Asha");
        assert!(user.is_active);
        assert_eq!(user.stats.followers_count, 0);
        let creds = db.credentials_by_phone("9876543210").unwrap().unwrap();
        assert_eq!(creds.id, user.id);
        assert_eq!(creds.password_hash, "hash");
    }

    #[test]
    fn revoked_refresh_token_no_longer_resolves() {
        let db = test_db();
        let user = db.create_user(&pending("9876543210", "Asha")).unwrap();
        db.store_refresh_token(user.id, "tok", Utc::now() + Duration::days(1)).unwrap();
        assert_eq!(db.refresh_token_owner("tok").unwrap(), Some(user.id));
        assert!(db.revoke_refresh_token("tok").unwrap());
        assert_eq!(db.refresh_token_owner("tok").unwrap(), None);
        assert!(!db.revoke_refresh_token("tok").unwrap());
    }

    #[test]
    fn purge_removes_only_expired_rows() {
        let db = test_db();
        let user = db.create_user(&pending("9876543210", "Asha")).unwrap();
        db.store_refresh_token(user.id, "old", Utc::now() - Duration::days(1)).unwrap();
        db.store_refresh_token(user.id, "new", Utc::now() + Duration::days(1)).unwrap();
        let past = Utc::now() - Duration::minutes(1);
        db.stage_registration(&pending("9123456789", "Ravi"), "1", past, past).unwrap();

        let report = db.purge_expired().unwrap();
        assert_eq!(report.refresh_tokens, 1);
        assert_eq!(report.otp_codes, 1);
        assert_eq!(report.pending_registrations, 1);
        assert_eq!(db.refresh_token_owner("new").unwrap(), Some(user.id));
    }
}
