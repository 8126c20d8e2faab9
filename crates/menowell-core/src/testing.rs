//! In-memory stand-ins for the remote collaborators, shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::api::{BackendError, IdentityBackend, RemoteStore};
use crate::models::{AuthUser, Credentials};

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertCall {
    pub table: String,
    pub on_conflict: String,
    pub record: serde_json::Value,
}

/// Records upserts; can be told to fail from the Nth call on.
#[derive(Default)]
pub struct FakeRemoteStore {
    pub calls: Mutex<Vec<UpsertCall>>,
    fail_from_call: Mutex<Option<usize>>,
    updated_at: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Delay every upsert by this much, to keep a migration "in flight"
    delay: Mutex<Option<std::time::Duration>>,
}

impl FakeRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls numbered from 1; call `n` and later fail with a server error.
    pub fn fail_from(&self, n: usize) {
        *self.fail_from_call.lock().unwrap() = Some(n);
    }

    pub fn heal(&self) {
        *self.fail_from_call.lock().unwrap() = None;
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_updated_at(&self, record_id: &str, at: DateTime<Utc>) {
        self.updated_at.lock().unwrap().insert(record_id.to_string(), at);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, table: &str) -> Vec<UpsertCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.table == table)
            .cloned()
            .collect()
    }
}

impl RemoteStore for FakeRemoteStore {
    fn upsert<'a>(
        &'a self,
        table: &'a str,
        on_conflict: &'a str,
        record: serde_json::Value,
    ) -> BoxFuture<'a, Result<(), BackendError>> {
        async move {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut calls = self.calls.lock().unwrap();
            let n = calls.len() + 1;
            if let Some(from) = *self.fail_from_call.lock().unwrap() {
                if n >= from {
                    return Err(BackendError::ServerError("503 Service Unavailable".to_string()));
                }
            }
            calls.push(UpsertCall {
                table: table.to_string(),
                on_conflict: on_conflict.to_string(),
                record,
            });
            Ok(())
        }
        .boxed()
    }

    fn fetch_updated_at<'a>(
        &'a self,
        _table: &'a str,
        record_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<DateTime<Utc>>, BackendError>> {
        let result = self.updated_at.lock().unwrap().get(record_id).copied();
        async move { Ok(result) }.boxed()
    }
}

/// Identity backend driven by scripted responses.
#[derive(Default)]
pub struct FakeIdentityBackend {
    restore_results: Mutex<VecDeque<Result<Option<AuthUser>, BackendError>>>,
    login_results: Mutex<VecDeque<(Result<AuthUser, BackendError>, Option<std::time::Duration>)>>,
    pub restore_calls: Mutex<usize>,
    pub login_calls: Mutex<usize>,
    pub logout_calls: Mutex<usize>,
}

impl FakeIdentityBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_restore(&self, result: Result<Option<AuthUser>, BackendError>) {
        self.restore_results.lock().unwrap().push_back(result);
    }

    pub fn push_login(&self, result: Result<AuthUser, BackendError>) {
        self.login_results.lock().unwrap().push_back((result, None));
    }

    /// Like `push_login`, but the answer arrives after `delay`.
    pub fn push_login_after(&self, result: Result<AuthUser, BackendError>, delay: std::time::Duration) {
        self.login_results.lock().unwrap().push_back((result, Some(delay)));
    }

    pub fn restore_count(&self) -> usize {
        *self.restore_calls.lock().unwrap()
    }

    pub fn login_count(&self) -> usize {
        *self.login_calls.lock().unwrap()
    }

    pub fn logout_count(&self) -> usize {
        *self.logout_calls.lock().unwrap()
    }
}

pub fn unreachable() -> BackendError {
    BackendError::NetworkError("connection refused".to_string())
}

impl IdentityBackend for FakeIdentityBackend {
    fn login<'a>(&'a self, _credentials: &'a Credentials) -> BoxFuture<'a, Result<AuthUser, BackendError>> {
        *self.login_calls.lock().unwrap() += 1;
        let (result, delay) = self
            .login_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (Err(unreachable()), None));
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        }
        .boxed()
    }

    fn restore_session(&self) -> BoxFuture<'_, Result<Option<AuthUser>, BackendError>> {
        *self.restore_calls.lock().unwrap() += 1;
        let result = self
            .restore_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(None));
        async move { result }.boxed()
    }

    fn logout(&self) -> BoxFuture<'_, Result<(), BackendError>> {
        *self.logout_calls.lock().unwrap() += 1;
        async { Ok(()) }.boxed()
    }
}
