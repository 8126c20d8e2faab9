//! One-time upload of onboarding data that older app versions kept locally.
//!
//! Guarded per user by the `migration_completed_<userId>` marker. The marker
//! is written only after every upsert succeeded; a partial failure leaves it
//! unset so the next run starts over, which is safe because every write is
//! an upsert on a natural key.
//!
//! Legacy data belongs to the first user who migrates it on this device. It
//! stays on disk so that user can retry, but is never uploaded for anyone
//! else.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{BackendError, RemoteStore};
use crate::clock::Clock;
use crate::storage::{keys, PersistentStore};

pub const ONBOARDING_TABLE: &str = "onboarding_responses";
const ONBOARDING_CONFLICT_COLUMNS: &str = "user_id,step_key";

pub const PROFILE_TABLE: &str = "profiles";
const PROFILE_CONFLICT_COLUMNS: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub is_completed: bool,
    pub migrated_steps: usize,
    pub error: Option<String>,
}

impl MigrationResult {
    fn completed(migrated_steps: usize) -> Self {
        Self {
            is_completed: true,
            migrated_steps,
            error: None,
        }
    }

    fn failed(migrated_steps: usize, error: &MigrationError) -> Self {
        Self {
            is_completed: false,
            migrated_steps,
            error: Some(error.to_string()),
        }
    }
}

/// Persisted under the per-user marker key once migration succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub user_id: String,
    pub completed_at: DateTime<Utc>,
    pub migrated_steps: usize,
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Saved onboarding data could not be read: {0}")]
    CorruptLegacyData(String),

    #[error("Failed to upload onboarding step '{step}': {source}")]
    Upload {
        step: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to upload profile: {0}")]
    Profile(#[source] BackendError),

    #[error("Could not record that migration finished")]
    MarkerWrite,
}

/// Legacy data found on this device.
#[derive(Debug, Default)]
struct LegacyData {
    steps: BTreeMap<String, serde_json::Value>,
    profile: Option<serde_json::Map<String, serde_json::Value>>,
}

impl LegacyData {
    fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.profile.is_none()
    }
}

pub struct MigrationCoordinator {
    store: PersistentStore,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
}

impl MigrationCoordinator {
    pub fn new(store: PersistentStore, remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, remote, clock }
    }

    pub fn is_migration_completed(&self, user_id: &str) -> bool {
        self.store.contains(&keys::migration_marker(user_id))
    }

    pub fn migration_record(&self, user_id: &str) -> Option<MigrationRecord> {
        self.store.get_item(&keys::migration_marker(user_id))
    }

    /// Whether this device holds legacy data that `user_id` still has to
    /// migrate.
    pub fn has_pending_legacy_data(&self, user_id: &str) -> bool {
        let present = self.store.contains(keys::LEGACY_ONBOARDING) || self.store.contains(keys::LEGACY_PROFILE);
        let owned_by_other = self.legacy_owner().is_some_and(|owner| owner != user_id);
        present && !owned_by_other && !self.is_migration_completed(user_id)
    }

    fn legacy_owner(&self) -> Option<String> {
        self.store.get_item(keys::LEGACY_OWNER)
    }

    pub async fn run_migration(&self, user_id: &str) -> MigrationResult {
        if self.is_migration_completed(user_id) {
            debug!(user_id, "Migration already completed");
            return MigrationResult::completed(0);
        }

        let legacy = match self.load_legacy() {
            Ok(legacy) => legacy,
            Err(e) => {
                warn!(user_id, error = %e, "Migration aborted");
                return MigrationResult::failed(0, &e);
            }
        };

        let mut migrated = 0;
        match self.upload(user_id, &legacy, &mut migrated).await {
            Ok(()) => {
                info!(user_id, migrated_steps = migrated, "Legacy data migration completed");
                MigrationResult::completed(migrated)
            }
            Err(e) => {
                warn!(user_id, migrated_steps = migrated, error = %e, "Legacy data migration failed");
                MigrationResult::failed(migrated, &e)
            }
        }
    }

    /// Forget that migration ran so the next `run_migration` repeats it.
    pub fn retry_migration(&self, user_id: &str) -> bool {
        info!(user_id, "Clearing migration marker");
        self.store.remove_item(&keys::migration_marker(user_id))
    }

    async fn upload(&self, user_id: &str, legacy: &LegacyData, migrated: &mut usize) -> Result<(), MigrationError> {
        if legacy.is_empty() {
            debug!(user_id, "No legacy data to migrate");
            return self.mark_completed(user_id, 0);
        }

        if !self.claim_legacy(user_id)? {
            info!(user_id, "Legacy data belongs to another user, skipping");
            return self.mark_completed(user_id, 0);
        }

        let migrated_at = self.clock.now();
        for (step, response) in &legacy.steps {
            let record = serde_json::json!({
                "user_id": user_id,
                "step_key": step,
                "response": response,
                "migrated_at": migrated_at,
            });
            self.remote
                .upsert(ONBOARDING_TABLE, ONBOARDING_CONFLICT_COLUMNS, record)
                .await
                .map_err(|source| MigrationError::Upload {
                    step: step.clone(),
                    source,
                })?;
            *migrated += 1;
        }

        if let Some(profile) = &legacy.profile {
            let mut record = profile.clone();
            record.insert("id".to_string(), serde_json::Value::String(user_id.to_string()));
            self.remote
                .upsert(PROFILE_TABLE, PROFILE_CONFLICT_COLUMNS, serde_json::Value::Object(record))
                .await
                .map_err(MigrationError::Profile)?;
        }

        self.mark_completed(user_id, *migrated)
    }

    /// Record `user_id` as the owner of the legacy data unless someone else
    /// already is. Returns whether `user_id` owns it.
    fn claim_legacy(&self, user_id: &str) -> Result<bool, MigrationError> {
        match self.legacy_owner() {
            Some(owner) => Ok(owner == user_id),
            None if self.store.set_item(keys::LEGACY_OWNER, user_id) => Ok(true),
            None => Err(MigrationError::MarkerWrite),
        }
    }

    fn mark_completed(&self, user_id: &str, migrated_steps: usize) -> Result<(), MigrationError> {
        let record = MigrationRecord {
            user_id: user_id.to_string(),
            completed_at: self.clock.now(),
            migrated_steps,
        };
        if self.store.set_item(&keys::migration_marker(user_id), &record) {
            Ok(())
        } else {
            Err(MigrationError::MarkerWrite)
        }
    }

    /// Read legacy slots directly rather than through `get_item`, which
    /// would purge a slot it cannot decode. Unreadable legacy data must stay
    /// put and fail the migration instead.
    fn load_legacy(&self) -> Result<LegacyData, MigrationError> {
        let mut legacy = LegacyData::default();

        if let Some(raw) = self.store.get_raw(keys::LEGACY_ONBOARDING) {
            legacy.steps = serde_json::from_str(&raw)
                .map_err(|e| MigrationError::CorruptLegacyData(format!("onboarding: {}", e)))?;
        }

        if let Some(raw) = self.store.get_raw(keys::LEGACY_PROFILE) {
            let profile: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
                .map_err(|e| MigrationError::CorruptLegacyData(format!("profile: {}", e)))?;
            if !profile.is_empty() {
                legacy.profile = Some(profile);
            }
        }

        Ok(legacy)
    }
}
