use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::AuthUser;

/// How long a remote session is assumed valid when the backend does not
/// say otherwise.
pub const DEFAULT_REMOTE_SESSION_MINUTES: i64 = 60;

/// Refresh a remote session this long before it expires
const REFRESH_BUFFER_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOrigin {
    /// Issued by the identity backend
    Remote,
    /// Manufactured locally while the backend was unreachable
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user: AuthUser,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub origin: SessionOrigin,
}

impl Session {
    pub fn remote(
        user: AuthUser,
        token: String,
        refresh_token: Option<String>,
        issued_at: DateTime<Utc>,
        lifetime: Duration,
    ) -> Self {
        Self {
            user,
            token,
            refresh_token,
            issued_at,
            expires_at: issued_at + lifetime,
            origin: SessionOrigin::Remote,
        }
    }

    pub fn offline(user: AuthUser, token: String, issued_at: DateTime<Utc>, lifetime: Duration) -> Self {
        Self {
            user,
            token,
            refresh_token: None,
            issued_at,
            expires_at: issued_at + lifetime,
            origin: SessionOrigin::Offline,
        }
    }

    /// Valid strictly before `expires_at`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::minutes(REFRESH_BUFFER_MINUTES)
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.time_until_expiry(now).num_minutes().max(0)
    }

    pub fn is_offline(&self) -> bool {
        self.origin == SessionOrigin::Offline
    }
}
