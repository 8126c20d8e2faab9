//! Supabase client for the identity backend (GoTrue) and the data store
//! (PostgREST).
//!
//! The remote session is persisted under `keys::AUTH_SESSION`, so a restart
//! can resume it without asking for the password again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{header, Client, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{BackendError, IdentityBackend, RemoteStore};
use crate::auth::session::{Session, DEFAULT_REMOTE_SESSION_MINUTES};
use crate::clock::Clock;
use crate::models::{AuthUser, Credentials};
use crate::storage::{keys, PersistentStore};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) data requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    /// Project URL, e.g. https://xxxx.supabase.co
    pub url: String,
    /// Public anon key; row level security applies
    pub anon_key: String,
}

impl SupabaseConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            anon_key: anon_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    user: GoTrueUser,
}

#[derive(Debug, Deserialize)]
struct GoTrueUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: Option<serde_json::Value>,
}

impl GoTrueUser {
    fn into_auth_user(self) -> AuthUser {
        let display_name = self.user_metadata.as_ref().and_then(|meta| {
            meta.get("full_name")
                .or_else(|| meta.get("name"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });
        AuthUser {
            id: self.id,
            email: self.email,
            display_name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpdatedAtRow {
    updated_at: Option<DateTime<Utc>>,
}

/// Clone is cheap - reqwest::Client and the store are reference counted.
#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    config: SupabaseConfig,
    rest_url: Url,
    sessions: PersistentStore,
    clock: Arc<dyn Clock>,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig, sessions: PersistentStore, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        let url = config.url.trim_end_matches('/').to_string();
        let rest_url = Url::parse(&format!("{}/rest/v1", url))
            .with_context(|| format!("Invalid Supabase URL: {}", url))?;
        if rest_url.cannot_be_a_base() {
            anyhow::bail!("Invalid Supabase URL: {}", url);
        }

        Ok(Self {
            http,
            config: SupabaseConfig {
                url,
                anon_key: config.anon_key,
            },
            rest_url,
            sessions,
            clock,
        })
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.config.url, path)
    }

    /// `table` becomes a single, percent-encoded path segment.
    fn table_url(&self, table: &str) -> Url {
        let mut url = self.rest_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(table);
        }
        url
    }

    fn upsert_request(&self, table: &str, on_conflict: &str, body: &serde_json::Value) -> RequestBuilder {
        self.with_api_key(self.http.post(self.table_url(table)))
            .query(&[("on_conflict", on_conflict)])
            .bearer_auth(self.bearer())
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(body)
    }

    fn updated_at_request(&self, table: &str, record_id: &str) -> RequestBuilder {
        self.with_api_key(self.http.get(self.table_url(table)))
            .query(&[("id", format!("eq.{}", record_id)), ("select", "updated_at".to_string())])
            .bearer_auth(self.bearer())
    }

    /// Stored remote session, if any
    pub fn current_session(&self) -> Option<Session> {
        self.sessions.get_item(keys::AUTH_SESSION)
    }

    fn bearer(&self) -> String {
        self.current_session()
            .map(|s| s.token)
            .unwrap_or_else(|| self.config.anon_key.clone())
    }

    fn with_api_key(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.anon_key)
            .header(header::ACCEPT, "application/json")
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, BackendError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(BackendError::from_status(status, &body))
        }
    }

    /// Check if response is successful. Ok(None) means rate limited (retry).
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, BackendError> {
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            Self::check_response(response).await.map(Some)
        }
    }

    async fn token_grant(&self, grant_type: &str, body: serde_json::Value) -> Result<Session, BackendError> {
        let url = format!("{}?grant_type={}", self.auth_url("token"), grant_type);
        let response = self
            .with_api_key(self.http.post(&url))
            .json(&body)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        let token: TokenResponse = response.json().await?;

        let lifetime = token
            .expires_in
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or_else(|| chrono::Duration::minutes(DEFAULT_REMOTE_SESSION_MINUTES));
        let session = Session::remote(
            token.user.into_auth_user(),
            token.access_token,
            token.refresh_token,
            self.clock.now(),
            lifetime,
        );

        if !self.sessions.set_item(keys::AUTH_SESSION, &session) {
            warn!("Remote session could not be persisted; it will not survive a restart");
        }
        Ok(session)
    }

    async fn do_login(&self, credentials: &Credentials) -> Result<AuthUser, BackendError> {
        let body = serde_json::json!({
            "email": credentials.email,
            "password": credentials.password,
        });
        let session = self.token_grant("password", body).await?;
        info!(user_id = %session.user.id, "Signed in");
        Ok(session.user)
    }

    async fn do_restore(&self) -> Result<Option<AuthUser>, BackendError> {
        let Some(session) = self.current_session() else {
            debug!("No stored remote session");
            return Ok(None);
        };

        let now = self.clock.now();
        if !session.needs_refresh(now) {
            return Ok(Some(session.user));
        }

        let Some(refresh_token) = session.refresh_token.clone() else {
            debug!("Stored session expired without refresh token");
            self.sessions.remove_item(keys::AUTH_SESSION);
            return Ok(None);
        };

        match self
            .token_grant("refresh_token", serde_json::json!({ "refresh_token": refresh_token }))
            .await
        {
            Ok(refreshed) => {
                debug!(user_id = %refreshed.user.id, "Session refreshed");
                Ok(Some(refreshed.user))
            }
            Err(e) if e.is_auth_rejection() => {
                info!("Refresh token rejected, clearing session");
                self.sessions.remove_item(keys::AUTH_SESSION);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn do_logout(&self) -> Result<(), BackendError> {
        let Some(session) = self.current_session() else {
            return Ok(());
        };
        // Local sign-out happens regardless of what the server says
        self.sessions.remove_item(keys::AUTH_SESSION);

        let response = self
            .with_api_key(self.http.post(self.auth_url("logout")))
            .bearer_auth(&session.token)
            .send()
            .await?;
        match Self::check_response(response).await {
            Ok(_) => Ok(()),
            // Token already dead server-side
            Err(e) if e.is_auth_rejection() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn do_upsert(&self, table: &str, on_conflict: &str, record: serde_json::Value) -> Result<(), BackendError> {
        let body = serde_json::Value::Array(vec![record]);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.upsert_request(table, on_conflict, &body).send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(_) => return Ok(()),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(BackendError::RateLimited);
                    }
                    warn!(table, retry = retries, backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn do_fetch_updated_at(&self, table: &str, record_id: &str) -> Result<Option<DateTime<Utc>>, BackendError> {
        let response = self.updated_at_request(table, record_id).send().await?;
        let response = Self::check_response(response).await?;
        let rows: Vec<UpdatedAtRow> = response.json().await?;
        Ok(rows.into_iter().next().and_then(|r| r.updated_at))
    }
}

impl IdentityBackend for SupabaseClient {
    fn login<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<AuthUser, BackendError>> {
        self.do_login(credentials).boxed()
    }

    fn restore_session(&self) -> BoxFuture<'_, Result<Option<AuthUser>, BackendError>> {
        self.do_restore().boxed()
    }

    fn logout(&self) -> BoxFuture<'_, Result<(), BackendError>> {
        self.do_logout().boxed()
    }
}

impl RemoteStore for SupabaseClient {
    fn upsert<'a>(
        &'a self,
        table: &'a str,
        on_conflict: &'a str,
        record: serde_json::Value,
    ) -> BoxFuture<'a, Result<(), BackendError>> {
        self.do_upsert(table, on_conflict, record).boxed()
    }

    fn fetch_updated_at<'a>(
        &'a self,
        table: &'a str,
        record_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<DateTime<Utc>>, BackendError>> {
        self.do_fetch_updated_at(table, record_id).boxed()
    }
}
