//! Orchestrates sign-in, session recovery and migration.
//!
//! The controller performs all I/O (backend calls, storage) and reports
//! what happened to the `AuthStore` as actions. Hosts read snapshots or
//! subscribe, and call the helpers here; they never touch the backend
//! directly.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::circuit_breaker::{BreakerState, CircuitBreaker};
use super::emergency::EmergencySessionManager;
use super::session::SessionOrigin;
use super::state::{AuthAction, AuthState, AuthStore};
use crate::api::{BackendError, IdentityBackend};
use crate::clock::Clock;
use crate::migration::{MigrationCoordinator, MigrationResult};
use crate::models::{AuthUser, Credentials};

/// Restore attempts per load before falling back to an offline session
pub const DEFAULT_MAX_RESTORE_ATTEMPTS: u32 = 3;

/// Pause between restore attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Sign-in is temporarily unavailable. Try again in {0} seconds.")]
    CircuitOpen(u64),

    #[error("Unable to reach the sign-in service. Check your connection and try again.")]
    Unavailable(#[source] BackendError),

    #[error("Sign-in failed: {0}")]
    Backend(#[source] BackendError),
}

/// Result of a successful sign-in.
#[derive(Debug, Clone, PartialEq)]
pub struct SignIn {
    pub user: AuthUser,
    pub origin: SessionOrigin,
}

enum RestoreOutcome {
    Restored(AuthUser),
    NoSession,
    Unreachable,
}

/// Clears the migration guard even if the migration future is dropped.
struct MigrationGuard<'a>(&'a AuthStore);

impl Drop for MigrationGuard<'_> {
    fn drop(&mut self) {
        self.0.dispatch(AuthAction::SetJitMigrationInProgress(false));
    }
}

pub struct AuthController {
    store: AuthStore,
    backend: Arc<dyn IdentityBackend>,
    emergency: EmergencySessionManager,
    migration: MigrationCoordinator,
    breaker_policy: CircuitBreaker,
    breaker: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
    max_restore_attempts: u32,
    retry_delay: Duration,
}

impl AuthController {
    pub fn new(
        backend: Arc<dyn IdentityBackend>,
        emergency: EmergencySessionManager,
        migration: MigrationCoordinator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: AuthStore::default(),
            backend,
            emergency,
            migration,
            breaker_policy: CircuitBreaker::default(),
            breaker: Mutex::new(BreakerState::default()),
            clock,
            max_restore_attempts: DEFAULT_MAX_RESTORE_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_circuit_breaker(mut self, policy: CircuitBreaker) -> Self {
        self.breaker_policy = policy;
        self
    }

    pub fn with_retry(mut self, max_restore_attempts: u32, retry_delay: Duration) -> Self {
        self.max_restore_attempts = max_restore_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    // =========================================================================
    // State access
    // =========================================================================

    pub fn snapshot(&self) -> AuthState {
        self.store.snapshot()
    }

    pub fn dispatch(&self, action: AuthAction) {
        self.store.dispatch(action);
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<AuthState> {
        self.store.subscribe()
    }

    pub fn emergency(&self) -> &EmergencySessionManager {
        &self.emergency
    }

    pub fn migration(&self) -> &MigrationCoordinator {
        &self.migration
    }

    /// Where the current identity came from, if there is one.
    pub fn session_origin(&self) -> Option<SessionOrigin> {
        let user = self.snapshot().user?;
        match self.emergency.get_offline_session() {
            Some(session) if session.user.id == user.id => Some(SessionOrigin::Offline),
            _ => Some(SessionOrigin::Remote),
        }
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Run the startup sequence: restore (remote, then offline), migrate,
    /// then mark initialization complete. Routing waits for the last step.
    pub async fn initialize(&self) -> AuthState {
        self.store.dispatch(AuthAction::SetLoading(true));

        if let Some(user) = self.attempt_session_recovery().await {
            if self.session_origin() == Some(SessionOrigin::Remote) {
                self.run_migration(&user.id).await;
            }
        }

        self.store.dispatch(AuthAction::SetLoading(false));
        self.store.dispatch(AuthAction::SetInitializationComplete(true));
        let state = self.snapshot();
        info!(
            authenticated = state.is_authenticated,
            circuit = %state.circuit_breaker_state,
            "Auth initialization complete"
        );
        state
    }

    /// Resolve an identity from the backend, falling back to a valid offline
    /// session when the backend cannot be reached. Runs at most once per
    /// load; later calls return the current user.
    pub async fn attempt_session_recovery(&self) -> Option<AuthUser> {
        if !self.store.try_begin_recovery() {
            debug!("Session recovery already attempted");
            return self.snapshot().user;
        }

        match self.restore_remote().await {
            RestoreOutcome::Restored(user) => {
                // The backend is authoritative again
                self.emergency.clear_offline_session();
                info!(user_id = %user.id, "Session restored");
                self.store.dispatch(AuthAction::SetUser(Some(user.clone())));
                Some(user)
            }
            RestoreOutcome::NoSession => {
                self.emergency.clear_offline_session();
                self.store.dispatch(AuthAction::SetUser(None));
                None
            }
            RestoreOutcome::Unreachable => match self.emergency.attempt_session_recovery() {
                Some(user) => {
                    warn!(user_id = %user.id, "Backend unreachable, continuing with offline session");
                    self.store.dispatch(AuthAction::SetUser(Some(user.clone())));
                    Some(user)
                }
                None => {
                    self.store.dispatch(AuthAction::SetError(Some(
                        "Unable to reach the sign-in service. Check your connection and try again."
                            .to_string(),
                    )));
                    None
                }
            },
        }
    }

    async fn restore_remote(&self) -> RestoreOutcome {
        for attempt in 1..=self.max_restore_attempts {
            if !self.breaker_allows() {
                debug!(attempt, "Circuit open, skipping session restore");
                break;
            }

            match self.backend.restore_session().await {
                Ok(Some(user)) => {
                    self.record_success();
                    return RestoreOutcome::Restored(user);
                }
                Ok(None) => {
                    self.record_success();
                    return RestoreOutcome::NoSession;
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt, error = %e, "Session restore failed");
                    self.record_failure();
                    if attempt < self.max_restore_attempts && !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => {
                    // The backend answered; the stored session is just not usable
                    info!(error = %e, "Stored session rejected");
                    self.record_success();
                    return RestoreOutcome::NoSession;
                }
            }
        }
        RestoreOutcome::Unreachable
    }

    // =========================================================================
    // Sign-in / sign-out
    // =========================================================================

    pub async fn login(&self, email: &str, password: &str) -> Result<SignIn, AuthError> {
        self.store.dispatch(AuthAction::SetLoading(true));
        let result = self.login_inner(&Credentials::new(email, password)).await;
        self.store.dispatch(AuthAction::SetLoading(false));

        if let Err(ref e) = result {
            self.store.dispatch(AuthAction::SetError(Some(e.to_string())));
        }
        result
    }

    async fn login_inner(&self, credentials: &Credentials) -> Result<SignIn, AuthError> {
        if !self.breaker_allows() {
            if let Some(sign_in) = self.sign_in_offline(credentials).await {
                return Ok(sign_in);
            }
            let wait = self.retry_after().map(|d| d.as_secs().max(1)).unwrap_or(1);
            return Err(AuthError::CircuitOpen(wait));
        }

        match self.backend.login(credentials).await {
            Ok(user) => {
                self.record_success();
                self.emergency.clear_offline_session();
                self.emergency
                    .store_emergency_credentials_for(&user, &credentials.email, &credentials.password)
                    .await;
                info!(user_id = %user.id, "Login successful");
                self.store.dispatch(AuthAction::SetUser(Some(user.clone())));
                self.run_migration(&user.id).await;
                Ok(SignIn {
                    user,
                    origin: SessionOrigin::Remote,
                })
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Login failed, backend unreachable");
                self.record_failure();
                self.sign_in_offline(credentials)
                    .await
                    .ok_or(AuthError::Unavailable(e))
            }
            Err(e) => {
                // Reached the backend, so the circuit is healthy
                self.record_success();
                warn!(error = %e, "Login rejected");
                if e.is_auth_rejection() {
                    Err(AuthError::InvalidCredentials)
                } else {
                    Err(AuthError::Backend(e))
                }
            }
        }
    }

    async fn sign_in_offline(&self, credentials: &Credentials) -> Option<SignIn> {
        let session = self
            .emergency
            .sign_in_offline(&credentials.email, &credentials.password)
            .await?;
        warn!(user_id = %session.user.id, "Signed in offline");
        self.store.dispatch(AuthAction::SetUser(Some(session.user.clone())));
        Some(SignIn {
            user: session.user,
            origin: SessionOrigin::Offline,
        })
    }

    /// Sign out everywhere we can. Local state is always cleared, even if the
    /// backend cannot be told.
    pub async fn logout(&self) {
        if let Err(e) = self.backend.logout().await {
            warn!(error = %e, "Remote logout failed, clearing local session anyway");
        }
        self.emergency.clear_offline_session();
        self.emergency.clear_emergency_credentials();
        self.breaker_policy.on_success(&mut self.lock_breaker());
        self.store.dispatch(AuthAction::ResetAuthState);
        info!("Logged out");
    }

    // =========================================================================
    // Migration
    // =========================================================================

    /// Run the one-time legacy data migration for the signed-in user.
    ///
    /// Returns `None` without doing anything when `user_id` is not the
    /// current identity or a migration is already in flight.
    pub async fn run_migration(&self, user_id: &str) -> Option<MigrationResult> {
        let is_current = self
            .snapshot()
            .user
            .map(|u| u.id == user_id)
            .unwrap_or(false);
        if !is_current {
            warn!(user_id, "Not migrating data for a user who is not signed in");
            return None;
        }

        if !self.store.try_begin_migration() {
            debug!(user_id, "Migration already in progress");
            return None;
        }
        let _guard = MigrationGuard(&self.store);

        let result = self.migration.run_migration(user_id).await;
        if let Some(ref error) = result.error {
            self.store.dispatch(AuthAction::SetError(Some(format!(
                "Your saved answers could not be moved to your account yet: {}",
                error
            ))));
        }
        Some(result)
    }

    /// Clear the migration marker and run the migration again.
    pub async fn retry_migration(&self, user_id: &str) -> Option<MigrationResult> {
        self.migration.retry_migration(user_id);
        self.store.dispatch(AuthAction::SetError(None));
        self.run_migration(user_id).await
    }

    // =========================================================================
    // Circuit breaker bookkeeping
    // =========================================================================

    fn lock_breaker(&self) -> MutexGuard<'_, BreakerState> {
        self.breaker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn breaker_allows(&self) -> bool {
        let now = self.clock.now();
        let (allowed, snapshot) = {
            let mut breaker = self.lock_breaker();
            let allowed = self.breaker_policy.can_execute(&mut breaker, now);
            (allowed, breaker.clone())
        };
        self.mirror_breaker(&snapshot);
        allowed
    }

    fn record_success(&self) {
        let snapshot = {
            let mut breaker = self.lock_breaker();
            self.breaker_policy.on_success(&mut breaker);
            breaker.clone()
        };
        self.mirror_breaker(&snapshot);
        self.store.dispatch(AuthAction::ResetRetryCount);
    }

    fn record_failure(&self) {
        let now = self.clock.now();
        let snapshot = {
            let mut breaker = self.lock_breaker();
            self.breaker_policy.on_failure(&mut breaker, now);
            breaker.clone()
        };
        self.mirror_breaker(&snapshot);
        self.store.dispatch(AuthAction::IncrementRetryCount);
        if snapshot.state == super::CircuitState::Open {
            warn!(failures = snapshot.failure_count, "Auth circuit breaker open");
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        let breaker = self.lock_breaker();
        self.breaker_policy.retry_after(&breaker, self.clock.now())
    }

    fn mirror_breaker(&self, breaker: &BreakerState) {
        self.store
            .mirror_circuit(breaker.state, breaker.last_failure_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CircuitState;
    use crate::clock::ManualClock;
    use crate::storage::{keys, PersistentStore};
    use crate::testing::{unreachable, FakeIdentityBackend, FakeRemoteStore};

    struct Harness {
        controller: AuthController,
        backend: Arc<FakeIdentityBackend>,
        remote: Arc<FakeRemoteStore>,
        store: PersistentStore,
        clock: Arc<ManualClock>,
    }

    fn harness_with(store: PersistentStore, clock: Arc<ManualClock>) -> Harness {
        let backend = Arc::new(FakeIdentityBackend::new());
        let remote = Arc::new(FakeRemoteStore::new());
        let emergency = EmergencySessionManager::new(store.clone(), store.clone(), clock.clone());
        let migration = MigrationCoordinator::new(store.clone(), remote.clone(), clock.clone());
        let controller = AuthController::new(backend.clone(), emergency, migration, clock.clone())
            .with_retry(3, Duration::ZERO);
        Harness {
            controller,
            backend,
            remote,
            store,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(PersistentStore::in_memory(), Arc::new(ManualClock::default()))
    }

    fn ana() -> AuthUser {
        AuthUser::new("u1").with_email("ana@example.com")
    }

    #[tokio::test]
    async fn test_initialize_restores_remote_session() {
        let h = harness();
        h.backend.push_restore(Ok(Some(ana())));

        let state = h.controller.initialize().await;

        assert_eq!(state.user, Some(ana()));
        assert!(state.is_authenticated);
        assert!(state.initialization_complete);
        assert!(!state.is_loading);
        assert!(state.session_recovery_attempted);
        assert!(!state.jit_migration_in_progress);
        assert!(h.store.contains("migration_completed_u1"));
    }

    #[tokio::test]
    async fn test_initialize_without_session() {
        let h = harness();

        let state = h.controller.initialize().await;

        assert_eq!(state.user, None);
        assert!(!state.is_authenticated);
        assert!(state.initialization_complete);
        assert_eq!(state.error, None);
        assert_eq!(h.backend.restore_count(), 1);
    }

    #[tokio::test]
    async fn test_initialize_unreachable_without_fallback_surfaces_error() {
        let h = harness();
        for _ in 0..3 {
            h.backend.push_restore(Err(unreachable()));
        }

        let state = h.controller.initialize().await;

        assert!(!state.is_authenticated);
        assert!(state.error.is_some());
        assert!(state.initialization_complete);
        assert_eq!(state.circuit_breaker_state, CircuitState::Open);
        assert_eq!(state.retry_count, 3);
        assert!(state.last_failure_time.is_some());
        assert_eq!(h.backend.restore_count(), 3);
    }

    #[tokio::test]
    async fn test_initialize_falls_back_to_offline_session() {
        let h = harness();
        h.controller.emergency().create_offline_session(&ana());
        for _ in 0..3 {
            h.backend.push_restore(Err(unreachable()));
        }

        let state = h.controller.initialize().await;

        assert_eq!(state.user, Some(ana()));
        assert_eq!(state.error, None);
        assert_eq!(h.controller.session_origin(), Some(SessionOrigin::Offline));
        // No migration against an unreachable backend
        assert!(!h.store.contains("migration_completed_u1"));
    }

    #[tokio::test]
    async fn test_reachable_backend_discards_offline_session() {
        let h = harness();
        h.controller.emergency().create_offline_session(&ana());

        let state = h.controller.initialize().await;

        assert_eq!(state.user, None);
        assert!(!h.store.contains(keys::EMERGENCY_SESSION));
    }

    #[tokio::test]
    async fn test_transient_restore_failure_then_success() {
        let h = harness();
        h.backend.push_restore(Err(unreachable()));
        h.backend.push_restore(Ok(Some(ana())));

        let state = h.controller.initialize().await;

        assert!(state.is_authenticated);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.circuit_breaker_state, CircuitState::Closed);
        assert_eq!(h.backend.restore_count(), 2);
    }

    #[tokio::test]
    async fn test_recovery_attempted_once_per_load() {
        let h = harness();
        h.backend.push_restore(Ok(Some(ana())));

        h.controller.attempt_session_recovery().await;
        let again = h.controller.attempt_session_recovery().await;

        assert_eq!(again, Some(ana()));
        assert_eq!(h.backend.restore_count(), 1);
    }

    #[tokio::test]
    async fn test_login_success() {
        let h = harness();
        h.controller.dispatch(AuthAction::SetError(Some("old".to_string())));
        h.backend.push_login(Ok(ana()));

        let sign_in = h.controller.login("ana@example.com", "pw").await.unwrap();

        assert_eq!(sign_in.origin, SessionOrigin::Remote);
        let state = h.controller.snapshot();
        assert_eq!(state.user, Some(ana()));
        assert_eq!(state.error, None);
        assert!(!state.is_loading);
        assert!(h.controller.emergency().is_emergency_mode_available());
        assert!(h.store.contains("migration_completed_u1"));
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let h = harness();
        h.backend.push_login(Err(BackendError::InvalidCredentials));

        let err = h.controller.login("ana@example.com", "bad").await.unwrap_err();

        assert!(matches!(err, AuthError::InvalidCredentials));
        let state = h.controller.snapshot();
        assert_eq!(state.error.as_deref(), Some("Invalid email or password"));
        assert_eq!(state.circuit_breaker_state, CircuitState::Closed);
        assert!(!h.controller.emergency().is_emergency_mode_available());
    }

    #[tokio::test]
    async fn test_offline_login_after_restart_with_backend_down() {
        let store = PersistentStore::in_memory();
        let clock = Arc::new(ManualClock::default());

        let first = harness_with(store.clone(), clock.clone());
        first.backend.push_login(Ok(ana()));
        first.controller.login("ana@example.com", "pw").await.unwrap();

        // Next app load, backend down
        let second = harness_with(store, clock);
        second.backend.push_login(Err(unreachable()));

        let sign_in = second.controller.login("ana@example.com", "pw").await.unwrap();
        assert_eq!(sign_in.origin, SessionOrigin::Offline);
        assert_eq!(sign_in.user.id, "u1");
        assert_eq!(second.controller.snapshot().user.unwrap().id, "u1");

        second.backend.push_login(Err(unreachable()));
        let err = second.controller.login("ana@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_circuit_opens_and_recovers() {
        let h = harness();
        for _ in 0..3 {
            h.backend.push_login(Err(unreachable()));
            assert!(h.controller.login("ana@example.com", "pw").await.is_err());
        }
        assert_eq!(h.controller.snapshot().circuit_breaker_state, CircuitState::Open);
        assert_eq!(h.controller.snapshot().retry_count, 3);

        // Fails fast without touching the backend
        let err = h.controller.login("ana@example.com", "pw").await.unwrap_err();
        assert!(matches!(err, AuthError::CircuitOpen(30)));
        assert_eq!(h.backend.login_count(), 3);

        h.clock.advance(chrono::Duration::milliseconds(30_000));
        h.backend.push_login(Ok(ana()));
        h.controller.login("ana@example.com", "pw").await.unwrap();

        let state = h.controller.snapshot();
        assert_eq!(state.circuit_breaker_state, CircuitState::Closed);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.last_failure_time, None);
        assert_eq!(h.backend.login_count(), 4);
    }

    #[tokio::test]
    async fn test_late_success_after_circuit_opened_keeps_mirror_in_sync() {
        let h = harness();
        let controller = h
            .controller
            .with_circuit_breaker(CircuitBreaker::new(1, Duration::from_secs(30), 1));
        h.backend.push_login_after(Ok(ana()), Duration::from_millis(20));
        h.backend.push_login(Err(unreachable()));

        // Both calls go out while the circuit is closed; the fast failure
        // opens it before the slow success lands
        let (slow, fast) = tokio::join!(
            controller.login("ana@example.com", "pw"),
            controller.login("ana@example.com", "pw")
        );

        assert!(slow.is_ok());
        assert!(fast.is_err());
        let state = controller.snapshot();
        assert_eq!(state.circuit_breaker_state, CircuitState::Closed);
        assert_eq!(state.last_failure_time, None);
        assert_eq!(state.retry_count, 0);

        // Later failures are mirrored from the real breaker state
        h.backend.push_login(Err(unreachable()));
        assert!(controller.login("ana@example.com", "pw").await.is_ok());
        let state = controller.snapshot();
        assert_eq!(state.circuit_breaker_state, CircuitState::Open);
        assert!(state.last_failure_time.is_some());
    }

    #[tokio::test]
    async fn test_logout_resets_everything() {
        let h = harness();
        h.backend.push_login(Ok(ana()));
        h.controller.login("ana@example.com", "pw").await.unwrap();

        h.controller.logout().await;

        let state = h.controller.snapshot();
        assert_eq!(state.user, None);
        assert!(state.initialization_complete);
        assert!(!state.is_loading);
        assert_eq!(h.backend.logout_count(), 1);
        assert!(!h.controller.emergency().is_emergency_mode_available());
        assert!(!h.store.contains(keys::EMERGENCY_SESSION));
    }

    #[tokio::test]
    async fn test_concurrent_migration_runs_once() {
        let h = harness();
        h.store.set_item(
            keys::LEGACY_ONBOARDING,
            &serde_json::json!({"symptoms": ["sleep"], "goals": ["energy"]}),
        );
        h.controller.dispatch(AuthAction::SetUser(Some(ana())));
        h.remote.set_delay(Duration::from_millis(20));

        let (a, b) = tokio::join!(
            h.controller.run_migration("u1"),
            h.controller.run_migration("u1")
        );

        assert!(a.is_some() != b.is_some());
        assert_eq!(h.remote.call_count(), 2);
        assert!(!h.controller.snapshot().jit_migration_in_progress);
    }

    #[tokio::test]
    async fn test_migration_requires_current_user() {
        let h = harness();
        assert!(h.controller.run_migration("u1").await.is_none());

        h.controller.dispatch(AuthAction::SetUser(Some(ana())));
        assert!(h.controller.run_migration("someone-else").await.is_none());
        assert!(h.controller.run_migration("u1").await.is_some());
    }

    #[tokio::test]
    async fn test_migration_failure_surfaces_error_and_retry_succeeds() {
        let h = harness();
        h.store.set_item(keys::LEGACY_ONBOARDING, &serde_json::json!({"symptoms": ["sleep"]}));
        h.remote.fail_from(1);
        h.backend.push_login(Ok(ana()));
        h.controller.login("ana@example.com", "pw").await.unwrap();

        let state = h.controller.snapshot();
        assert!(state.is_authenticated);
        assert!(state.error.is_some());

        h.remote.heal();
        let result = h.controller.retry_migration("u1").await.unwrap();
        assert!(result.is_completed);
        assert_eq!(result.migrated_steps, 1);
        assert_eq!(h.controller.snapshot().error, None);
    }
}
