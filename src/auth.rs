//! Admin session handling.
//!
//! A single admin key (from the environment, or generated per run) gates
//! the mutating surface. Successful logins mint a random token whose
//! sha-256 digest is persisted; the raw token never touches disk.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::store::{DocStore, StoreError};

pub const SESSIONS: &str = "auth_sessions";
pub const ADMIN_KEY_ENV: &str = "COURSEDESK_ADMIN_KEY";
pub const TOKEN_TTL_HOURS: i64 = 24;
pub const MAX_LOGIN_ATTEMPTS: usize = 5;
pub const LOGIN_WINDOW_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("too many failed login attempts, try again in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("invalid admin key")]
    InvalidKey,
    #[error("invalid or expired session token")]
    InvalidToken,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: String,
    pub expires_at: String,
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct AuthService {
    admin_key_digest: String,
    failures: Mutex<VecDeque<Instant>>,
}

impl AuthService {
    pub fn new(admin_key: &str) -> AuthService {
        AuthService {
            admin_key_digest: digest(admin_key),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Key from the environment; a missing key gets a generated one that is
    /// printed once so a local operator can still log in.
    pub fn from_env() -> AuthService {
        match std::env::var(ADMIN_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => AuthService::new(key.trim()),
            _ => {
                let generated = Uuid::new_v4().simple().to_string();
                log::warn!(
                    "{ADMIN_KEY_ENV} is not set, using a generated admin key for this run: {generated}"
                );
                AuthService::new(&generated)
            }
        }
    }

    fn enforce_rate_limit(&self) -> Result<(), AuthError> {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = Duration::from_secs(LOGIN_WINDOW_SECS);
        let now = Instant::now();
        while failures
            .front()
            .map_or(false, |&t| now.duration_since(t) >= window)
        {
            failures.pop_front();
        }
        if failures.len() >= MAX_LOGIN_ATTEMPTS {
            let retry_after_secs = failures
                .front()
                .map_or(0, |&t| (window - now.duration_since(t)).as_secs());
            return Err(AuthError::RateLimited { retry_after_secs });
        }
        Ok(())
    }

    fn record_failure(&self) {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        failures.push_back(Instant::now());
    }

    fn clear_failures(&self) {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        failures.clear();
    }

    pub fn login(&self, store: &DocStore, key: &str) -> Result<SessionToken, AuthError> {
        self.enforce_rate_limit()?;
        if digest(key) != self.admin_key_digest {
            self.record_failure();
            log::warn!("rejected admin login attempt");
            return Err(AuthError::InvalidKey);
        }
        self.clear_failures();

        let token = Uuid::new_v4().to_string();
        let token_digest = digest(&token);
        let now = Utc::now();
        let expires_at = (now + chrono::Duration::hours(TOKEN_TTL_HOURS)).to_rfc3339();
        store.run_transaction(|tx| -> Result<(), StoreError> {
            tx.read(SESSIONS, &token_digest)?;
            tx.write(
                SESSIONS,
                &token_digest,
                json!({
                    "createdAt": now.to_rfc3339(),
                    "expiresAt": expires_at.clone(),
                }),
            );
            Ok(())
        })?;
        log::info!("admin session opened");
        Ok(SessionToken { token, expires_at })
    }

    /// Expiry timestamp of a live session, `None` otherwise. Expired
    /// sessions are reaped on sight.
    pub fn session_expiry(
        &self,
        store: &DocStore,
        token: &str,
    ) -> Result<Option<String>, StoreError> {
        if token.trim().is_empty() {
            return Ok(None);
        }
        let token_digest = digest(token);
        let Some(snap) = store.get(SESSIONS, &token_digest)? else {
            return Ok(None);
        };
        let expires_at = snap
            .body
            .get("expiresAt")
            .and_then(Value::as_str)
            .map(str::to_string);
        let expired = expires_at
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map_or(true, |t| t.with_timezone(&Utc) <= Utc::now());
        if expired {
            store.run_transaction(|tx| -> Result<(), StoreError> {
                if tx.read(SESSIONS, &token_digest)?.is_some() {
                    tx.delete(SESSIONS, &token_digest);
                }
                Ok(())
            })?;
            return Ok(None);
        }
        Ok(expires_at)
    }

    pub fn check(&self, store: &DocStore, token: &str) -> Result<bool, StoreError> {
        Ok(self.session_expiry(store, token)?.is_some())
    }

    pub fn require(&self, store: &DocStore, token: &str) -> Result<(), AuthError> {
        if self.check(store, token)? {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }

    pub fn logout(&self, store: &DocStore, token: &str) -> Result<bool, StoreError> {
        if token.trim().is_empty() {
            return Ok(false);
        }
        let token_digest = digest(token);
        store.run_transaction(|tx| {
            if tx.read(SESSIONS, &token_digest)?.is_none() {
                return Ok(false);
            }
            tx.delete(SESSIONS, &token_digest);
            Ok(true)
        })
    }
}
