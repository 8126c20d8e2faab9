//! Offline sign-in while the identity backend is unreachable.
//!
//! A user who signed in successfully once gets a credential capture (24h)
//! and can be issued a short offline session (30m) from it. Neither is
//! authoritative: the controller drops the offline session as soon as the
//! backend answers again. All TTLs are checked on read and expired entries
//! are purged at that point.

use std::sync::Arc;

use chrono::Duration;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use super::credentials::EmergencyCredentials;
use super::session::Session;
use crate::clock::Clock;
use crate::models::AuthUser;
use crate::storage::{keys, PersistentStore};

pub const DEFAULT_CREDENTIAL_TTL_HOURS: i64 = 24;
pub const DEFAULT_OFFLINE_SESSION_MINUTES: i64 = 30;

const OFFLINE_TOKEN_RANDOM_LEN: usize = 24;

pub struct EmergencySessionManager {
    sessions: PersistentStore,
    credentials: PersistentStore,
    clock: Arc<dyn Clock>,
    credential_ttl: Duration,
    session_ttl: Duration,
}

impl EmergencySessionManager {
    /// `sessions` holds the offline session, `credentials` the capture. They
    /// may be the same store; hosts usually put captures in the keychain.
    pub fn new(sessions: PersistentStore, credentials: PersistentStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions,
            credentials,
            clock,
            credential_ttl: Duration::hours(DEFAULT_CREDENTIAL_TTL_HOURS),
            session_ttl: Duration::minutes(DEFAULT_OFFLINE_SESSION_MINUTES),
        }
    }

    pub fn with_ttls(mut self, credential_ttl: Duration, session_ttl: Duration) -> Self {
        self.credential_ttl = credential_ttl;
        self.session_ttl = session_ttl;
        self
    }

    // ===== Credential capture =====
    //
    // Argon2 is memory- and CPU-hard, so hashing and verification run on the
    // blocking pool.

    pub async fn store_emergency_credentials(&self, email: &str, password: &str) -> bool {
        self.capture(email, password, None).await
    }

    /// Capture credentials after a successful remote sign-in, remembering
    /// which backend user they belong to.
    pub async fn store_emergency_credentials_for(&self, user: &AuthUser, email: &str, password: &str) -> bool {
        self.capture(email, password, Some(&user.id)).await
    }

    async fn capture(&self, email: &str, password: &str, user_id: Option<&str>) -> bool {
        let now = self.clock.now();
        let (email, password) = (email.to_string(), password.to_string());
        let hashed =
            tokio::task::spawn_blocking(move || EmergencyCredentials::capture(&email, &password, now)).await;

        match hashed {
            Ok(Ok(creds)) => {
                let creds = match user_id {
                    Some(id) => creds.for_user(id),
                    None => creds,
                };
                self.credentials.set_item(keys::EMERGENCY_CREDENTIALS, &creds)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to capture emergency credentials");
                false
            }
            Err(e) => {
                warn!(error = %e, "Credential hashing task failed");
                false
            }
        }
    }

    pub fn get_emergency_credentials(&self) -> Option<EmergencyCredentials> {
        let creds: EmergencyCredentials = self.credentials.get_item(keys::EMERGENCY_CREDENTIALS)?;
        if creds.is_expired(self.clock.now(), self.credential_ttl) {
            debug!("Emergency credentials expired, purging");
            self.clear_emergency_credentials();
            return None;
        }
        Some(creds)
    }

    pub fn is_emergency_mode_available(&self) -> bool {
        self.get_emergency_credentials().is_some()
    }

    /// Check a typed email/password against the unexpired capture.
    pub async fn verify_emergency_login(&self, email: &str, password: &str) -> bool {
        match self.get_emergency_credentials() {
            Some(creds) => verify(creds, email, password).await,
            None => false,
        }
    }

    /// Issue an offline session if `email`/`password` match the capture.
    pub async fn sign_in_offline(&self, email: &str, password: &str) -> Option<Session> {
        let creds = self.get_emergency_credentials()?;
        let user = creds.offline_user();
        if !verify(creds, email, password).await {
            debug!("Offline sign-in rejected");
            return None;
        }
        self.create_offline_session(&user)
    }

    pub fn clear_emergency_credentials(&self) {
        self.credentials.remove_item(keys::EMERGENCY_CREDENTIALS);
    }

    // ===== Offline session =====

    pub fn create_offline_session(&self, user: &AuthUser) -> Option<Session> {
        let now = self.clock.now();
        let session = Session::offline(user.clone(), generate_offline_token(now), now, self.session_ttl);

        if self.sessions.set_item(keys::EMERGENCY_SESSION, &session) {
            info!(user_id = %user.id, expires_at = %session.expires_at, "Offline session created");
            Some(session)
        } else {
            None
        }
    }

    pub fn get_offline_session(&self) -> Option<Session> {
        let session: Session = self.sessions.get_item(keys::EMERGENCY_SESSION)?;
        if session.is_expired(self.clock.now()) {
            debug!(user_id = %session.user.id, "Offline session expired, purging");
            self.clear_offline_session();
            return None;
        }
        Some(session)
    }

    /// User embedded in a still-valid offline session.
    pub fn attempt_session_recovery(&self) -> Option<AuthUser> {
        self.get_offline_session().map(|s| s.user)
    }

    pub fn clear_offline_session(&self) {
        self.sessions.remove_item(keys::EMERGENCY_SESSION);
    }
}

async fn verify(creds: EmergencyCredentials, email: &str, password: &str) -> bool {
    let (email, password) = (email.to_string(), password.to_string());
    match tokio::task::spawn_blocking(move || creds.matches(&email, &password)).await {
        Ok(matched) => matched,
        Err(e) => {
            warn!(error = %e, "Credential verification task failed");
            false
        }
    }
}

/// Opaque local token. Carries no authority; only identifies the session.
fn generate_offline_token(now: chrono::DateTime<chrono::Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(OFFLINE_TOKEN_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("offline_{}_{}", now.timestamp_millis(), suffix)
}
