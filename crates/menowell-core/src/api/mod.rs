//! Remote collaborators of the session layer.
//!
//! The controller and migration code only see the `IdentityBackend` and
//! `RemoteStore` traits. `SupabaseClient` implements both against a Supabase
//! project (GoTrue for auth, PostgREST for data).

pub mod client;
pub mod error;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::models::{AuthUser, Credentials};

pub use client::{SupabaseClient, SupabaseConfig};
pub use error::BackendError;

pub trait IdentityBackend: Send + Sync {
    fn login<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<AuthUser, BackendError>>;

    /// Resume a previously established session. `Ok(None)` means the backend
    /// is fine but there is nothing to resume.
    fn restore_session(&self) -> BoxFuture<'_, Result<Option<AuthUser>, BackendError>>;

    fn logout(&self) -> BoxFuture<'_, Result<(), BackendError>>;
}

pub trait RemoteStore: Send + Sync {
    /// Insert or overwrite `record` in `table`, matching on the comma-separated
    /// `on_conflict` columns. Applying the same record twice must be harmless.
    fn upsert<'a>(
        &'a self,
        table: &'a str,
        on_conflict: &'a str,
        record: serde_json::Value,
    ) -> BoxFuture<'a, Result<(), BackendError>>;

    /// Last modification time of a row, if it exists.
    fn fetch_updated_at<'a>(
        &'a self,
        table: &'a str,
        record_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<DateTime<Utc>>, BackendError>>;
}
