//! Local changes waiting to be pushed to the backend.
//!
//! Changes are persisted under `pending_changes` so they survive restarts and
//! are pushed in order by `flush`. A change whose row was modified remotely
//! after the local edit is a conflict, settled by the queue's
//! `ConflictStrategy`.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::RemoteStore;
use crate::auth::{BreakerState, CircuitBreaker};
use crate::clock::Clock;
use crate::storage::{keys, PersistentStore};

const DEFAULT_CONFLICT_COLUMNS: &str = "id";

fn default_conflict_columns() -> String {
    DEFAULT_CONFLICT_COLUMNS.to_string()
}

/// A local mutation awaiting upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChange {
    pub id: String,
    pub table: String,
    pub record_id: String,
    #[serde(default = "default_conflict_columns")]
    pub on_conflict: String,
    pub payload: serde_json::Value,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConflict {
    pub change: DataChange,
    pub remote_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Newer timestamp wins
    #[default]
    LastWriteWins,
    KeepLocal,
    KeepRemote,
}

impl ConflictStrategy {
    /// Whether the local change should still be pushed.
    pub fn keeps_local(self, conflict: &SyncConflict) -> bool {
        match self {
            ConflictStrategy::LastWriteWins => conflict.change.changed_at >= conflict.remote_updated_at,
            ConflictStrategy::KeepLocal => true,
            ConflictStrategy::KeepRemote => false,
        }
    }
}

/// Outcome of one `flush`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    pub pushed: usize,
    /// Local changes discarded in favour of the remote row
    pub discarded: Vec<SyncConflict>,
    pub remaining: usize,
}

pub struct SyncQueue {
    store: PersistentStore,
    clock: Arc<dyn Clock>,
    strategy: ConflictStrategy,
    breaker_policy: CircuitBreaker,
    breaker: Mutex<BreakerState>,
    // Serializes read-modify-write of the persisted queue
    lock: Mutex<()>,
}

impl SyncQueue {
    pub fn new(store: PersistentStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            strategy: ConflictStrategy::default(),
            breaker_policy: CircuitBreaker::default(),
            breaker: Mutex::new(BreakerState::default()),
            lock: Mutex::new(()),
        }
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_circuit_breaker(mut self, policy: CircuitBreaker) -> Self {
        self.breaker_policy = policy;
        self
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Queue an upsert of `payload` into `table`. A change already pending
    /// for the same row is replaced.
    pub fn enqueue(&self, table: &str, record_id: &str, payload: serde_json::Value) -> DataChange {
        let now = self.clock.now();
        let change = DataChange {
            id: generate_change_id(now),
            table: table.to_string(),
            record_id: record_id.to_string(),
            on_conflict: default_conflict_columns(),
            payload,
            changed_at: now,
        };

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending = self.pending();
        pending.retain(|c| !(c.table == change.table && c.record_id == change.record_id));
        pending.push(change.clone());
        if !self.store.set_item(keys::PENDING_CHANGES, &pending) {
            warn!(table, record_id, "Failed to persist pending change");
        }
        debug!(table, record_id, pending = pending.len(), "Change queued");
        change
    }

    pub fn pending(&self) -> Vec<DataChange> {
        self.store
            .get_item(keys::PENDING_CHANGES)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// A change conflicts when its row was modified remotely after the
    /// local edit was made.
    pub fn detect_conflict(change: &DataChange, remote_updated_at: Option<DateTime<Utc>>) -> Option<SyncConflict> {
        let remote_updated_at = remote_updated_at?;
        (remote_updated_at > change.changed_at).then(|| SyncConflict {
            change: change.clone(),
            remote_updated_at,
        })
    }

    /// Push pending changes in order. Stops early when the circuit opens;
    /// anything not pushed or discarded stays queued for the next flush.
    pub async fn flush(&self, remote: &dyn RemoteStore) -> SyncReport {
        let pending = self.pending();
        let mut report = SyncReport::default();
        let mut settled: Vec<String> = Vec::new();

        for change in &pending {
            if !self.breaker_allows() {
                debug!("Circuit open, postponing remaining changes");
                break;
            }

            let remote_updated_at = match remote.fetch_updated_at(&change.table, &change.record_id).await {
                Ok(at) => at,
                Err(e) => {
                    warn!(change_id = %change.id, error = %e, "Could not check remote row");
                    self.record_result(e.is_transient());
                    continue;
                }
            };

            if let Some(conflict) = Self::detect_conflict(change, remote_updated_at) {
                if !self.strategy.keeps_local(&conflict) {
                    info!(
                        table = %change.table,
                        record_id = %change.record_id,
                        "Remote row is newer, discarding local change"
                    );
                    settled.push(change.id.clone());
                    report.discarded.push(conflict);
                    self.record_result(false);
                    continue;
                }
            }

            match remote
                .upsert(&change.table, &change.on_conflict, change.payload.clone())
                .await
            {
                Ok(()) => {
                    settled.push(change.id.clone());
                    report.pushed += 1;
                    self.record_result(false);
                }
                Err(e) => {
                    warn!(change_id = %change.id, error = %e, "Failed to push change");
                    self.record_result(e.is_transient());
                }
            }
        }

        report.remaining = self.remove_settled(&settled);
        if report.pushed > 0 || !report.discarded.is_empty() {
            info!(
                pushed = report.pushed,
                discarded = report.discarded.len(),
                remaining = report.remaining,
                "Sync flush finished"
            );
        }
        report
    }

    /// Drop settled changes, re-reading the queue so changes enqueued while
    /// a flush was in flight are kept.
    fn remove_settled(&self, settled: &[String]) -> usize {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending = self.pending();
        if settled.is_empty() {
            return pending.len();
        }
        pending.retain(|c| !settled.contains(&c.id));
        let saved = if pending.is_empty() {
            self.store.remove_item(keys::PENDING_CHANGES)
        } else {
            self.store.set_item(keys::PENDING_CHANGES, &pending)
        };
        if !saved {
            warn!("Failed to update pending changes after flush");
        }
        pending.len()
    }

    fn breaker_allows(&self) -> bool {
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        self.breaker_policy.can_execute(&mut breaker, self.clock.now())
    }

    /// Only transient failures count against the circuit.
    fn record_result(&self, transient_failure: bool) {
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        if transient_failure {
            self.breaker_policy.on_failure(&mut breaker, self.clock.now());
        } else {
            self.breaker_policy.on_success(&mut breaker);
        }
    }
}

fn generate_change_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("chg_{}_{}", now.timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::FakeRemoteStore;
    use chrono::Duration;
    use serde_json::json;

    fn setup() -> (SyncQueue, PersistentStore, Arc<ManualClock>) {
        let store = PersistentStore::in_memory();
        let clock = Arc::new(ManualClock::default());
        let queue = SyncQueue::new(store.clone(), clock.clone());
        (queue, store, clock)
    }

    #[test]
    fn test_enqueue_persists_and_coalesces() {
        let (queue, store, _) = setup();
        queue.enqueue("symptom_logs", "log-1", json!({"id": "log-1", "severity": 2}));
        queue.enqueue("symptom_logs", "log-2", json!({"id": "log-2", "severity": 1}));
        queue.enqueue("symptom_logs", "log-1", json!({"id": "log-1", "severity": 4}));

        let pending = queue.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].record_id, "log-1");
        assert_eq!(pending[1].payload["severity"], 4);

        // Survives a new queue over the same store
        let reopened = SyncQueue::new(store, Arc::new(ManualClock::default()));
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn test_detect_conflict() {
        let (queue, _, clock) = setup();
        let change = queue.enqueue("t", "r", json!({}));

        assert!(SyncQueue::detect_conflict(&change, None).is_none());
        assert!(SyncQueue::detect_conflict(&change, Some(clock.now() - Duration::minutes(1))).is_none());
        assert!(SyncQueue::detect_conflict(&change, Some(clock.now())).is_none());

        let conflict = SyncQueue::detect_conflict(&change, Some(clock.now() + Duration::seconds(1))).unwrap();
        assert_eq!(conflict.change.id, change.id);
    }

    #[test]
    fn test_strategies() {
        let now = Utc::now();
        let conflict = |remote_offset: i64| SyncConflict {
            change: DataChange {
                id: "c".into(),
                table: "t".into(),
                record_id: "r".into(),
                on_conflict: "id".into(),
                payload: json!({}),
                changed_at: now,
            },
            remote_updated_at: now + Duration::seconds(remote_offset),
        };

        assert!(!ConflictStrategy::LastWriteWins.keeps_local(&conflict(5)));
        assert!(ConflictStrategy::LastWriteWins.keeps_local(&conflict(0)));
        assert!(ConflictStrategy::KeepLocal.keeps_local(&conflict(5)));
        assert!(!ConflictStrategy::KeepRemote.keeps_local(&conflict(5)));
    }

    #[tokio::test]
    async fn test_flush_pushes_in_order_and_empties_queue() {
        let (queue, store, _) = setup();
        let remote = FakeRemoteStore::new();
        queue.enqueue("symptom_logs", "a", json!({"id": "a"}));
        queue.enqueue("symptom_logs", "b", json!({"id": "b"}));

        let report = queue.flush(&remote).await;

        assert_eq!(report.pushed, 2);
        assert_eq!(report.remaining, 0);
        assert!(queue.is_empty());
        assert!(!store.contains(keys::PENDING_CHANGES));
        let calls = remote.calls_for("symptom_logs");
        assert_eq!(calls[0].record["id"], "a");
        assert_eq!(calls[1].record["id"], "b");
        assert!(calls.iter().all(|c| c.on_conflict == "id"));
    }

    #[tokio::test]
    async fn test_failed_pushes_stay_queued() {
        let (queue, _, _) = setup();
        let remote = FakeRemoteStore::new();
        queue.enqueue("t", "a", json!({"id": "a"}));
        queue.enqueue("t", "b", json!({"id": "b"}));
        remote.fail_from(2);

        let report = queue.flush(&remote).await;
        assert_eq!(report.pushed, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(queue.pending()[0].record_id, "b");

        remote.heal();
        let report = queue.flush(&remote).await;
        assert_eq!(report.pushed, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_stops_when_circuit_opens() {
        let (queue, _, _) = setup();
        let queue = queue.with_circuit_breaker(CircuitBreaker::new(2, std::time::Duration::from_secs(30), 1));
        let remote = FakeRemoteStore::new();
        for id in ["a", "b", "c", "d"] {
            queue.enqueue("t", id, json!({"id": id}));
        }
        remote.fail_from(1);

        let report = queue.flush(&remote).await;

        assert_eq!(report.pushed, 0);
        assert_eq!(report.remaining, 4);
        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test]
    async fn test_last_write_wins_discards_stale_local_change() {
        let (queue, _, clock) = setup();
        let remote = FakeRemoteStore::new();
        queue.enqueue("t", "stale", json!({"id": "stale"}));
        queue.enqueue("t", "fresh", json!({"id": "fresh"}));
        remote.set_updated_at("stale", clock.now() + Duration::minutes(5));
        remote.set_updated_at("fresh", clock.now() - Duration::minutes(5));

        let report = queue.flush(&remote).await;

        assert_eq!(report.pushed, 1);
        assert_eq!(report.discarded.len(), 1);
        assert_eq!(report.discarded[0].change.record_id, "stale");
        assert!(queue.is_empty());
        assert_eq!(remote.calls_for("t")[0].record["id"], "fresh");
    }

    #[tokio::test]
    async fn test_keep_local_overwrites_newer_remote() {
        let (queue, _, clock) = setup();
        let queue = queue.with_strategy(ConflictStrategy::KeepLocal);
        let remote = FakeRemoteStore::new();
        queue.enqueue("t", "r", json!({"id": "r"}));
        remote.set_updated_at("r", clock.now() + Duration::minutes(5));

        let report = queue.flush(&remote).await;

        assert_eq!(report.pushed, 1);
        assert!(report.discarded.is_empty());
    }
}
