//! Supabase client for the REST, auth and storage APIs.
//!
//! This module provides a client for the three Supabase services the server
//! depends on:
//! - PostgREST (`/rest/v1`) through a small query builder and RPC calls
//! - GoTrue (`/auth/v1`) for sign-up, password sign-in and recovery
//! - Storage (`/storage/v1`) for audio and user files
//!
//! # Architecture
//!
//! The [`SupabaseClient`] is shared across the application (via `Arc`) and
//! handles all communication with Supabase. It includes:
//! - Configurable timeouts (5 seconds for requests)
//! - Retry logic with exponential backoff for the startup readiness check
//! - Structured error handling with [`SupabaseError`]
//!
//! Database and storage calls authenticate with the service key; ownership
//! checks are done by the services before a query is issued. Auth calls use
//! the anonymous key.
//!
//! # Example
//!
//! ```rust,ignore
//! use voicehub_server::supabase::SupabaseClient;
//!
//! let client = SupabaseClient::new("https://your-project.supabase.co", "anon-key")?
//!     .with_service_key("service-key");
//!
//! let rows = client
//!     .from("conversations")
//!     .select("*")
//!     .eq("user_id", "user-123")
//!     .order("updated_at", false)
//!     .range(0, 9)
//!     .count_exact()
//!     .execute::<serde_json::Value>()
//!     .await?;
//! println!("{} of {:?}", rows.data.len(), rows.count);
//! ```

use std::fmt;
use std::time::Duration;

use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::redact::redact;

/// Default timeout for Supabase API requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of retry attempts for the startup readiness check.
const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (100ms).
const BASE_BACKOFF_MS: u64 = 100;

/// Maximum delay cap for exponential backoff (10 seconds).
const MAX_BACKOFF_MS: u64 = 10_000;

/// Maximum jitter to add to backoff delay (100ms).
const MAX_JITTER_MS: u64 = 100;

/// Errors that can occur when interacting with Supabase.
///
/// These errors provide granular information about failures, allowing
/// callers to handle different error conditions appropriately (e.g.,
/// returning 401 for unauthorized vs 503 for timeout).
#[derive(Debug, Error)]
pub enum SupabaseError {
    /// The provided credentials or JWT are invalid or expired.
    ///
    /// Maps to HTTP 401 Unauthorized.
    #[error("unauthorized: invalid credentials or expired JWT")]
    Unauthorized,

    /// The request to Supabase timed out.
    ///
    /// This may indicate network issues or Supabase service problems.
    /// Maps to HTTP 503 Service Unavailable.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Supabase is unreachable.
    ///
    /// This indicates a network failure or that Supabase services are down.
    /// Maps to HTTP 503 Service Unavailable.
    #[error("supabase unavailable: {0}")]
    Unavailable(String),

    /// Supabase refused the request (4xx other than 401).
    ///
    /// PostgREST reports constraint violations as 409, bad filters as 400.
    #[error("request rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status returned by Supabase.
        status: u16,
        /// Error message extracted from the response body.
        message: String,
    },

    /// Failed to parse the response from Supabase, or Supabase failed internally.
    ///
    /// This indicates an unexpected response format, possibly due to
    /// API version mismatch or service changes.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration error.
    ///
    /// This indicates a problem with the client setup, such as an invalid URL.
    #[error("client configuration error: {0}")]
    Configuration(String),

    /// All retry attempts have been exhausted.
    ///
    /// This is used during startup when the initial connection fails
    /// after all retry attempts.
    #[error("all {attempts} retry attempts failed: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last error encountered.
        last_error: String,
    },
}

/// User information returned by the Supabase auth API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupabaseUser {
    /// The unique identifier for the user (UUID format).
    pub id: String,

    /// The user's email address, if available.
    pub email: Option<String>,
}

/// A session returned by a successful password sign-in.
#[derive(Clone, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    pub user: SupabaseUser,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .field("user", &self.user)
            .finish()
    }
}

/// An object in a storage bucket, as returned by the list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageObject {
    pub name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// A storage bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub public: bool,
}

/// Rows returned by a PostgREST query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse<T> {
    /// Returned rows.
    pub data: Vec<T>,

    /// Total number of matching rows, when requested with [`QueryBuilder::count_exact`].
    pub count: Option<u64>,
}

#[derive(Debug, Clone)]
enum QueryMethod {
    Select,
    Insert(Value),
    Update(Value),
    Delete,
}

/// Builder for a single PostgREST request against one table.
///
/// Created with [`SupabaseClient::from`]. Filters are combined with AND.
#[derive(Debug)]
#[must_use = "a query does nothing until executed"]
pub struct QueryBuilder<'a> {
    client: &'a SupabaseClient,
    table: String,
    method: QueryMethod,
    select: Option<String>,
    filters: Vec<(String, String)>,
    order: Vec<String>,
    range: Option<(u64, u64)>,
    limit: Option<u64>,
    count: bool,
}

impl<'a> QueryBuilder<'a> {
    fn new(client: &'a SupabaseClient, table: &str) -> Self {
        Self {
            client,
            table: table.to_string(),
            method: QueryMethod::Select,
            select: None,
            filters: Vec::new(),
            order: Vec::new(),
            range: None,
            limit: None,
            count: false,
        }
    }

    /// Columns to return, in PostgREST `select` syntax.
    pub fn select(mut self, columns: &str) -> Self {
        self.select = Some(columns.to_string());
        self
    }

    pub fn eq(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(column, format!("eq.{value}"))
    }

    pub fn neq(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(column, format!("neq.{value}"))
    }

    pub fn gte(self, column: &str, value: impl fmt::Display) -> Self {
        self.filter(column, format!("gte.{value}"))
    }

    /// Case-insensitive pattern match; `*` is the wildcard.
    pub fn ilike(self, column: &str, pattern: impl fmt::Display) -> Self {
        self.filter(column, format!("ilike.{pattern}"))
    }

    fn filter(mut self, column: &str, expression: String) -> Self {
        self.filters.push((column.to_string(), expression));
        self
    }

    /// Adds an ordering column. Multiple calls sort by each column in turn.
    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        let direction = if ascending { "asc" } else { "desc" };
        self.order.push(format!("{column}.{direction}"));
        self
    }

    /// Restricts the result to rows `from..=to` (zero-based, inclusive).
    pub fn range(mut self, from: u64, to: u64) -> Self {
        self.range = Some((from, to.max(from)));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Orders the rows of an embedded resource (`resource.order=...`).
    pub fn embedded_order(self, resource: &str, column: &str, ascending: bool) -> Self {
        let direction = if ascending { "asc" } else { "desc" };
        self.filter(&format!("{resource}.order"), format!("{column}.{direction}"))
    }

    /// Caps the rows of an embedded resource (`resource.limit=...`).
    pub fn embedded_limit(self, resource: &str, limit: u64) -> Self {
        self.filter(&format!("{resource}.limit"), limit.to_string())
    }

    /// Asks PostgREST for the exact number of matching rows.
    pub fn count_exact(mut self) -> Self {
        self.count = true;
        self
    }

    /// Inserts one row (object) or many rows (array).
    pub fn insert(mut self, rows: Value) -> Self {
        self.method = QueryMethod::Insert(rows);
        self
    }

    /// Updates every row matching the filters.
    pub fn update(mut self, values: Value) -> Self {
        self.method = QueryMethod::Update(values);
        self
    }

    /// Deletes every row matching the filters.
    pub fn delete(mut self) -> Self {
        self.method = QueryMethod::Delete;
        self
    }

    /// Sends the request and returns the affected or selected rows.
    ///
    /// Mutations always return the written rows.
    pub async fn execute<T: DeserializeOwned>(self) -> Result<QueryResponse<T>, SupabaseError> {
        let url = format!("{}/rest/v1/{}", self.client.base_url, self.table);

        let mut query: Vec<(String, String)> = self.filters;
        if let Some(select) = self.select {
            query.push(("select".to_string(), select));
        }
        if !self.order.is_empty() {
            query.push(("order".to_string(), self.order.join(",")));
        }
        if let Some(limit) = self.limit {
            query.push(("limit".to_string(), limit.to_string()));
        }

        let (request, mutation) = match self.method {
            QueryMethod::Select => (self.client.http_client.get(&url), false),
            QueryMethod::Insert(body) => (self.client.http_client.post(&url).json(&body), true),
            QueryMethod::Update(body) => (self.client.http_client.patch(&url).json(&body), true),
            QueryMethod::Delete => (self.client.http_client.delete(&url), true),
        };

        let mut prefer = Vec::new();
        if mutation {
            prefer.push("return=representation");
        }
        if self.count {
            prefer.push("count=exact");
        }

        let mut request = self.client.service_auth(request).query(&query);
        if !prefer.is_empty() {
            request = request.header("Prefer", prefer.join(","));
        }
        if let Some((from, to)) = self.range {
            request = request
                .header("Range-Unit", "items")
                .header("Range", format!("{from}-{to}"));
        }

        debug!(table = %self.table, "Executing PostgREST query");

        let response = check_response(send(request).await?).await?;

        let count = response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total);

        let body = response
            .text()
            .await
            .map_err(|e| SupabaseError::InvalidResponse(format!("failed to read rows: {e}")))?;

        let data = if body.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&body).map_err(|e| {
                SupabaseError::InvalidResponse(format!("failed to parse rows: {e}"))
            })?
        };

        Ok(QueryResponse { data, count })
    }

    /// Executes the query and returns the first row, if any.
    pub async fn execute_one<T: DeserializeOwned>(self) -> Result<Option<T>, SupabaseError> {
        Ok(self.execute::<T>().await?.data.into_iter().next())
    }
}

/// Client for interacting with Supabase services.
///
/// # Thread Safety
///
/// The client uses an internal `reqwest::Client` which is already
/// designed to be shared across threads. Wrap in `Arc` for sharing.
#[derive(Clone)]
pub struct SupabaseClient {
    /// The underlying HTTP client.
    http_client: Client,

    /// The base URL of the Supabase project (e.g., `https://xxx.supabase.co`).
    base_url: String,

    /// The Supabase anonymous/public key, used for auth calls.
    anon_key: String,

    /// The key used for database and storage calls.
    service_key: String,
}

impl SupabaseClient {
    /// Creates a new Supabase client.
    ///
    /// The service key defaults to the anonymous key; set it with
    /// [`with_service_key`](Self::with_service_key).
    ///
    /// # Errors
    ///
    /// Returns [`SupabaseError::Configuration`] if the HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
    ) -> Result<Self, SupabaseError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let anon_key = anon_key.into();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                SupabaseError::Configuration(format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            http_client,
            base_url,
            service_key: anon_key.clone(),
            anon_key,
        })
    }

    /// Sets the key used for database and storage calls.
    pub fn with_service_key(mut self, service_key: impl Into<String>) -> Self {
        self.service_key = service_key.into();
        self
    }

    /// Returns the base URL of the Supabase project.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn service_auth(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    // ==================== Database ====================

    /// Starts a query against `table`.
    pub fn from(&self, table: &str) -> QueryBuilder<'_> {
        QueryBuilder::new(self, table)
    }

    /// Calls a Postgres function through `/rest/v1/rpc/{function}`.
    pub async fn rpc<T: DeserializeOwned>(
        &self,
        function: &str,
        params: &Value,
    ) -> Result<T, SupabaseError> {
        let url = format!("{}/rest/v1/rpc/{function}", self.base_url);

        debug!(function = %function, "Calling Supabase RPC");

        let request = self.service_auth(self.http_client.post(&url)).json(params);
        let response = check_response(send(request).await?).await?;

        response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse {function} response: {e}"))
        })
    }

    // ==================== Auth ====================

    /// Creates an auth user with the given metadata.
    ///
    /// Depending on the project's confirmation settings Supabase answers with
    /// either a session or the bare user; both are accepted.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &Value,
    ) -> Result<SupabaseUser, SupabaseError> {
        let url = format!("{}/auth/v1/signup", self.base_url);

        debug!("Registering user with Supabase");

        let request = self
            .http_client
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&json!({
                "email": email,
                "password": password,
                "data": metadata,
            }));

        let response = check_response(send(request).await?).await?;
        let mut body: Value = response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse sign-up response: {e}"))
        })?;

        let user = if body.get("user").is_some_and(Value::is_object) {
            body["user"].take()
        } else {
            body
        };

        serde_json::from_value(user).map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse sign-up user: {e}"))
        })
    }

    /// Signs in with e-mail and password.
    ///
    /// Wrong credentials come back from Supabase as 400 and are reported as
    /// [`SupabaseError::Unauthorized`].
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, SupabaseError> {
        let url = format!("{}/auth/v1/token", self.base_url);

        let request = self
            .http_client
            .post(&url)
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password }));

        let response = send(request).await?;
        if response.status() == StatusCode::BAD_REQUEST {
            debug!("Password sign-in rejected");
            return Err(SupabaseError::Unauthorized);
        }

        let response = check_response(response).await?;
        response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse session response: {e}"))
        })
    }

    /// Ends a Supabase session.
    pub async fn sign_out(&self, access_token: &str) -> Result<(), SupabaseError> {
        let url = format!("{}/auth/v1/logout", self.base_url);

        let request = self
            .http_client
            .post(&url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {access_token}"));

        check_response(send(request).await?).await?;
        Ok(())
    }

    /// Resolves the user a Supabase JWT belongs to.
    ///
    /// Validation happens on the Supabase side, which also covers revoked
    /// sessions and recovery tokens.
    ///
    /// # Errors
    ///
    /// - [`SupabaseError::Unauthorized`] - The JWT is invalid or expired
    /// - [`SupabaseError::Timeout`] - The request timed out (5 second limit)
    /// - [`SupabaseError::Unavailable`] - Supabase is unreachable
    /// - [`SupabaseError::InvalidResponse`] - Failed to parse the response
    pub async fn get_user(&self, jwt: &str) -> Result<SupabaseUser, SupabaseError> {
        let url = format!("{}/auth/v1/user", self.base_url);

        debug!(url = %url, "Validating JWT with Supabase");

        let request = self
            .http_client
            .get(&url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {jwt}"));

        let response = check_response(send(request).await?).await?;

        let user: SupabaseUser = response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse user response: {e}"))
        })?;

        debug!(user_id = %user.id, "JWT validated successfully");
        Ok(user)
    }

    /// Sends a password recovery e-mail.
    pub async fn recover_password(&self, email: &str) -> Result<(), SupabaseError> {
        let url = format!("{}/auth/v1/recover", self.base_url);

        let request = self
            .http_client
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email }));

        check_response(send(request).await?).await?;
        Ok(())
    }

    /// Sets a new password for the user owning `access_token`.
    pub async fn update_password(
        &self,
        access_token: &str,
        new_password: &str,
    ) -> Result<SupabaseUser, SupabaseError> {
        let url = format!("{}/auth/v1/user", self.base_url);

        let request = self
            .http_client
            .put(&url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {access_token}"))
            .json(&json!({ "password": new_password }));

        let response = check_response(send(request).await?).await?;
        response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse user response: {e}"))
        })
    }

    /// Checks that the auth service is answering.
    pub async fn health(&self) -> Result<(), SupabaseError> {
        let url = format!("{}/auth/v1/health", self.base_url);

        let request = self.http_client.get(&url).header("apikey", &self.anon_key);
        check_response(send(request).await?).await?;
        Ok(())
    }

    /// Waits for Supabase to answer its health check.
    ///
    /// This method implements exponential backoff with jitter for reliable
    /// startup behavior. It will retry up to 5 times before failing, with
    /// delays calculated as:
    ///
    /// ```text
    /// delay = min(2^attempt * 100ms + random(0, 100ms), 10s)
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`SupabaseError::RetriesExhausted`] if all retry attempts fail.
    /// The server should exit with an error if this occurs during startup.
    pub async fn wait_until_ready(&self) -> Result<(), SupabaseError> {
        let mut last_error = String::new();

        for attempt in 0..MAX_RETRY_ATTEMPTS {
            match self.health().await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(
                            attempt = attempt + 1,
                            "Supabase health check succeeded after retry"
                        );
                    }
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();

                    if attempt < MAX_RETRY_ATTEMPTS - 1 {
                        let delay = calculate_backoff_delay(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_attempts = MAX_RETRY_ATTEMPTS,
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "Supabase health check failed, retrying"
                        );
                        sleep(delay).await;
                    } else {
                        error!(
                            attempts = MAX_RETRY_ATTEMPTS,
                            error = %e,
                            "Supabase health check failed, no more retries"
                        );
                    }
                }
            }
        }

        Err(SupabaseError::RetriesExhausted {
            attempts: MAX_RETRY_ATTEMPTS,
            last_error,
        })
    }

    // ==================== Storage ====================

    /// Uploads an object and returns its path inside the bucket.
    pub async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> Result<String, SupabaseError> {
        let url = format!("{}/storage/v1/object/{bucket}/{path}", self.base_url);

        debug!(bucket = %bucket, size = bytes.len(), "Uploading object");

        let request = self
            .service_auth(self.http_client.post(&url))
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", upsert.to_string())
            .body(bytes);

        check_response(send(request).await?).await?;
        Ok(path.to_string())
    }

    /// Removes objects from a bucket.
    pub async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), SupabaseError> {
        let url = format!("{}/storage/v1/object/{bucket}", self.base_url);

        let request = self
            .service_auth(self.http_client.delete(&url))
            .json(&json!({ "prefixes": paths }));

        check_response(send(request).await?).await?;
        Ok(())
    }

    /// Lists objects under `prefix`, sorted by name.
    pub async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StorageObject>, SupabaseError> {
        let url = format!("{}/storage/v1/object/list/{bucket}", self.base_url);

        let request = self.service_auth(self.http_client.post(&url)).json(&json!({
            "prefix": prefix,
            "limit": limit,
            "offset": offset,
            "sortBy": { "column": "name", "order": "asc" },
        }));

        let response = check_response(send(request).await?).await?;
        response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse object list: {e}"))
        })
    }

    /// Public URL of an object in a public bucket.
    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{bucket}/{}",
            self.base_url,
            path.trim_start_matches('/')
        )
    }

    pub async fn list_buckets(&self) -> Result<Vec<Bucket>, SupabaseError> {
        let url = format!("{}/storage/v1/bucket", self.base_url);

        let request = self.service_auth(self.http_client.get(&url));
        let response = check_response(send(request).await?).await?;
        response.json().await.map_err(|e| {
            SupabaseError::InvalidResponse(format!("failed to parse bucket list: {e}"))
        })
    }

    pub async fn create_bucket(&self, name: &str, public: bool) -> Result<(), SupabaseError> {
        let url = format!("{}/storage/v1/bucket", self.base_url);

        let request = self
            .service_auth(self.http_client.post(&url))
            .json(&json!({ "id": name, "name": name, "public": public }));

        check_response(send(request).await?).await?;
        info!(bucket = %name, "Created storage bucket");
        Ok(())
    }
}

impl fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .field("anon_key", &"[REDACTED]")
            .field("service_key", &"[REDACTED]")
            .finish()
    }
}

async fn send(request: RequestBuilder) -> Result<Response, SupabaseError> {
    request.send().await.map_err(|e| {
        if e.is_timeout() {
            SupabaseError::Timeout(REQUEST_TIMEOUT)
        } else if e.is_connect() {
            SupabaseError::Unavailable(format!("connection failed: {e}"))
        } else {
            SupabaseError::Unavailable(format!("request failed: {e}"))
        }
    })
}

/// Turns a non-success response into the matching [`SupabaseError`].
async fn check_response(response: Response) -> Result<Response, SupabaseError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED {
        debug!("Supabase request unauthorized");
        return Err(SupabaseError::Unauthorized);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);

    if status == StatusCode::SERVICE_UNAVAILABLE {
        warn!(status = %status, "Supabase unavailable");
        return Err(SupabaseError::Unavailable(format!("status {status}")));
    }

    if status.is_server_error() {
        error!(status = %status, body = %redact(&body), "Unexpected response from Supabase");
        return Err(SupabaseError::InvalidResponse(format!(
            "unexpected status {status}: {message}"
        )));
    }

    warn!(status = %status, message = %redact(&message), "Supabase rejected request");
    Err(SupabaseError::Rejected {
        status: status.as_u16(),
        message,
    })
}

/// Extracts the human-readable message from a PostgREST, GoTrue or Storage error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["message", "msg", "error_description", "error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

/// Parses the total from a `Content-Range` header (`0-9/42`, `*/0`).
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.parse().ok()
}

/// Calculates the backoff delay for a given retry attempt.
///
/// Uses exponential backoff with jitter:
/// `delay = min(2^attempt * 100ms + random(0, 100ms), 10s)`
fn calculate_backoff_delay(attempt: u32) -> Duration {
    let exponential_ms = BASE_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt));
    let jitter_ms = rand::rng().random_range(0..=MAX_JITTER_MS);
    let total_ms = exponential_ms.saturating_add(jitter_ms).min(MAX_BACKOFF_MS);
    Duration::from_millis(total_ms)
}
