use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::AuthUser;

/// A credential capture kept so the user can sign in offline.
///
/// Only an Argon2 hash of the password is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyCredentials {
    pub email: String,
    pub password_hash: String,
    pub captured_at: DateTime<Utc>,
    /// Backend user ID this capture belongs to, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Error, Debug)]
#[error("Failed to hash password: {0}")]
pub struct HashError(String);

impl EmergencyCredentials {
    pub fn capture(email: &str, password: &str, now: DateTime<Utc>) -> Result<Self, HashError> {
        let mut salt_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = SaltString::encode_b64(&salt_bytes).map_err(|e| HashError(e.to_string()))?;

        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| HashError(e.to_string()))?;

        Ok(Self {
            email: normalize_email(email),
            password_hash: hash.to_string(),
            captured_at: now,
            user_id: None,
        })
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Identity to use for an offline session built from this capture.
    pub fn offline_user(&self) -> AuthUser {
        AuthUser {
            id: self.user_id.clone().unwrap_or_else(|| self.email.clone()),
            email: Some(self.email.clone()),
            display_name: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now >= self.captured_at + ttl
    }

    /// Whether `email`/`password` match this capture.
    pub fn matches(&self, email: &str, password: &str) -> bool {
        if normalize_email(email) != self.email {
            return false;
        }
        match PasswordHash::new(&self.password_hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
