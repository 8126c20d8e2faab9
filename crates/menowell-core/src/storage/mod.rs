//! Local persistence for session, credential and migration state.
//!
//! This module provides the `PersistentStore` wrapper, which never fails
//! towards its callers, and the backends it can sit on:
//! - `FileBackend`: one JSON file per key in the cache directory
//! - `KeyringBackend`: OS keychain entries (used for credential captures)
//! - `MemoryBackend`: in-process map for tests and throwaway runs
//!
//! Keys used by the session layer are listed in `keys`.

pub mod backends;
pub mod store;

pub use backends::{FileBackend, KeyringBackend, MemoryBackend, StorageBackend};
pub use store::PersistentStore;

/// Storage key space shared by the session layer.
pub mod keys {
    /// Remote session (tokens issued by the identity backend)
    pub const AUTH_SESSION: &str = "auth_session";

    /// Argon2-hashed credential capture for offline sign-in
    pub const EMERGENCY_CREDENTIALS: &str = "emergency_credentials";

    /// Locally issued session used while the backend is unreachable
    pub const EMERGENCY_SESSION: &str = "emergency_session";

    /// Legacy onboarding answers written by older app versions
    pub const LEGACY_ONBOARDING: &str = "onboarding_data";

    /// Legacy profile written by older app versions
    pub const LEGACY_PROFILE: &str = "user_profile";

    /// User the legacy data was first migrated for; nobody else gets it
    pub const LEGACY_OWNER: &str = "onboarding_data_owner";

    /// Local changes waiting to be uploaded
    pub const PENDING_CHANGES: &str = "pending_changes";

    pub fn migration_marker(user_id: &str) -> String {
        format!("migration_completed_{}", user_id)
    }
}
