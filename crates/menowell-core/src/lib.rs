//! Menowell core library.
//!
//! Keeps a user signed in against an unreliable identity backend:
//!
//! - `storage`: fault-tolerant key/value persistence (file, keychain, memory)
//! - `auth`: circuit breaker, offline sessions, the auth state reducer and the
//!   controller that drives them
//! - `migration`: one-time move of legacy local onboarding data to the backend
//! - `sync`: queue of local changes awaiting upload
//! - `api`: Supabase identity and data adapters
//!
//! Nothing in here renders anything; a host (the CLI, a route guard) reads
//! `AuthState` snapshots and calls the controller's helpers.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod migration;
pub mod models;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{AuthAction, AuthController, AuthState, AuthStore, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use migration::{MigrationCoordinator, MigrationResult};
pub use models::{AuthUser, Credentials};
pub use storage::PersistentStore;
pub use sync::{ConflictStrategy, DataChange, SyncQueue};
