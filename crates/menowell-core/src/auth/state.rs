//! The single authoritative auth state record and its reducer.
//!
//! `reduce` is a pure function of (state, action). All I/O happens in the
//! controller, which dispatches actions describing what it observed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use super::circuit_breaker::CircuitState;
use crate::models::AuthUser;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[cfg_attr(feature = "ts", ts(export))]
pub struct AuthState {
    pub user: Option<AuthUser>,
    pub is_loading: bool,
    pub error: Option<String>,
    /// Always equal to `user.is_some()`
    pub is_authenticated: bool,
    pub initialization_complete: bool,
    pub retry_count: u32,
    pub circuit_breaker_state: CircuitState,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub jit_migration_in_progress: bool,
    pub session_recovery_attempted: bool,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            user: None,
            is_loading: true,
            error: None,
            is_authenticated: false,
            initialization_complete: false,
            retry_count: 0,
            circuit_breaker_state: CircuitState::Closed,
            last_failure_time: None,
            jit_migration_in_progress: false,
            session_recovery_attempted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthAction {
    SetLoading(bool),
    SetUser(Option<AuthUser>),
    SetError(Option<String>),
    SetInitializationComplete(bool),
    IncrementRetryCount,
    ResetRetryCount,
    SetCircuitBreakerState(CircuitState),
    SetLastFailureTime(Option<DateTime<Utc>>),
    SetJitMigrationInProgress(bool),
    SetSessionRecoveryAttempted(bool),
    /// Back to the initial record, but with initialization complete so
    /// routing does not fall back into a loading screen after sign-out.
    ResetAuthState,
}

pub fn reduce(state: &AuthState, action: AuthAction) -> AuthState {
    let mut next = state.clone();
    match action {
        AuthAction::SetLoading(loading) => next.is_loading = loading,
        AuthAction::SetUser(user) => {
            next.is_authenticated = user.is_some();
            if user.is_some() {
                next.error = None;
            }
            next.user = user;
        }
        AuthAction::SetError(error) => next.error = error,
        AuthAction::SetInitializationComplete(done) => next.initialization_complete = done,
        AuthAction::IncrementRetryCount => next.retry_count = next.retry_count.saturating_add(1),
        AuthAction::ResetRetryCount => next.retry_count = 0,
        AuthAction::SetCircuitBreakerState(circuit) => {
            if state.circuit_breaker_state.can_transition_to(circuit) {
                next.circuit_breaker_state = circuit;
            } else {
                warn!(
                    from = %state.circuit_breaker_state,
                    to = %circuit,
                    "Ignoring invalid circuit breaker transition"
                );
            }
        }
        AuthAction::SetLastFailureTime(at) => next.last_failure_time = at,
        AuthAction::SetJitMigrationInProgress(running) => next.jit_migration_in_progress = running,
        AuthAction::SetSessionRecoveryAttempted(attempted) => {
            next.session_recovery_attempted = attempted
        }
        AuthAction::ResetAuthState => {
            next = AuthState {
                is_loading: false,
                initialization_complete: true,
                ..AuthState::default()
            };
        }
    }
    next
}

/// Injectable container for `AuthState`.
///
/// Backed by a `watch` channel so hosts can `subscribe` to changes; every
/// dispatch runs the reducer under the channel's lock, which serializes
/// updates.
pub struct AuthStore {
    tx: watch::Sender<AuthState>,
}

impl Default for AuthStore {
    fn default() -> Self {
        Self::new(AuthState::default())
    }
}

impl AuthStore {
    pub fn new(initial: AuthState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn dispatch(&self, action: AuthAction) {
        self.tx.send_if_modified(|state| {
            let next = reduce(state, action);
            if next == *state {
                return false;
            }
            *state = next;
            true
        });
    }

    pub fn snapshot(&self) -> AuthState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.tx.subscribe()
    }

    /// Bring the mirrored circuit state and last failure time in line with
    /// the breaker in one update. Walks the legal cycle when the breaker
    /// moved further than one step since the last mirror, which happens when
    /// calls issued in different circuit phases finish out of order.
    pub fn mirror_circuit(&self, circuit: CircuitState, last_failure_time: Option<DateTime<Utc>>) {
        self.tx.send_if_modified(|state| {
            let mut next = state.clone();
            for step in next.circuit_breaker_state.path_to(circuit) {
                next = reduce(&next, AuthAction::SetCircuitBreakerState(step));
            }
            next = reduce(&next, AuthAction::SetLastFailureTime(last_failure_time));
            if next == *state {
                return false;
            }
            *state = next;
            true
        });
    }

    /// Set the migration guard if it is clear. Returns false when a
    /// migration is already running.
    pub fn try_begin_migration(&self) -> bool {
        self.try_set_flag(
            |s| s.jit_migration_in_progress,
            AuthAction::SetJitMigrationInProgress(true),
        )
    }

    /// Set the recovery guard if it is clear. Returns false when recovery
    /// was already attempted during this load.
    pub fn try_begin_recovery(&self) -> bool {
        self.try_set_flag(
            |s| s.session_recovery_attempted,
            AuthAction::SetSessionRecoveryAttempted(true),
        )
    }

    fn try_set_flag(&self, is_set: impl Fn(&AuthState) -> bool, action: AuthAction) -> bool {
        let mut acquired = false;
        self.tx.send_if_modified(|state| {
            if is_set(state) {
                return false;
            }
            *state = reduce(state, action);
            acquired = true;
            true
        });
        acquired
    }
}
