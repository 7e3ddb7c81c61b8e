//! Long-lived API keys for scripts and integrations.
//!
//! A key is `vhk_` followed by 32 random bytes in URL-safe base64. It is
//! returned once, when generated or rotated; the `api_keys` table only keeps
//! its SHA-256 digest and a short display prefix. Keys carry their own scopes,
//! which can never exceed the scopes of the session that created them.
//!
//! Validation looks the digest up together with the owner's account status,
//! so disabling a user stops their keys as well.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::supabase::SupabaseClient;
use crate::types::{UserStatus, SCOPE_USER};
use crate::validation::validate_text;

const API_KEYS: &str = "api_keys";
const USERS: &str = "users";

/// Prefix of every key this server issues.
pub const API_KEY_PREFIX: &str = "vhk_";

/// Header carrying an API key.
pub const HEADER_API_KEY: &str = "X-API-Key";

const KEY_BYTES: usize = 32;

/// Characters of the key kept for display, prefix included.
const DISPLAY_PREFIX_LEN: usize = 12;

const DEFAULT_NAME: &str = "API Key";
const MAX_NAME_LEN: usize = 100;

pub const DEFAULT_EXPIRATION_DAYS: u32 = 30;
pub const MAX_EXPIRATION_DAYS: u32 = 365;

/// Columns returned to callers. `key_hash` is deliberately absent.
const KEY_COLUMNS: &str = "id,user_id,name,key_prefix,scopes,expires_at,is_active,metadata,created_at";

/// A row of the `api_keys` table, without the digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// Leading characters of the key, to tell keys apart.
    pub key_prefix: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ApiKeyInfo {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// A freshly generated key. `api_key` is never stored and cannot be shown again.
#[derive(Clone, Serialize)]
pub struct IssuedApiKey {
    pub api_key: String,
    #[serde(flatten)]
    pub key: ApiKeyInfo,
}

impl std::fmt::Debug for IssuedApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedApiKey")
            .field("api_key", &"<redacted>")
            .field("key", &self.key)
            .finish()
    }
}

/// Request to generate a key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewApiKey {
    #[serde(default)]
    pub name: Option<String>,
    /// Defaults to the `user` scope.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiration_days: Option<u32>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OwnerRow {
    #[serde(default)]
    status: UserStatus,
}

#[derive(Debug, Deserialize)]
struct KeyWithOwner {
    #[serde(flatten)]
    key: ApiKeyInfo,
    #[serde(default)]
    owner: Option<OwnerRow>,
}

#[derive(Debug, Clone)]
pub struct ApiKeyService {
    supabase: Arc<SupabaseClient>,
    rng: SystemRandom,
}

impl ApiKeyService {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self {
            supabase,
            rng: SystemRandom::new(),
        }
    }

    /// Generates a key for `user_id`.
    ///
    /// `granted_scopes` are the scopes of the caller's session; requesting
    /// any scope outside them is refused.
    pub async fn generate_api_key(
        &self,
        user_id: &str,
        granted_scopes: &[String],
        request: NewApiKey,
    ) -> Result<IssuedApiKey> {
        let name = validate_text(
            request.name.as_deref().unwrap_or(DEFAULT_NAME),
            1,
            MAX_NAME_LEN,
            "name",
        )?;

        let days = request.expiration_days.unwrap_or(DEFAULT_EXPIRATION_DAYS);
        if !(1..=MAX_EXPIRATION_DAYS).contains(&days) {
            return Err(ServerError::validation(format!(
                "expiration_days must be between 1 and {MAX_EXPIRATION_DAYS}"
            )));
        }

        let mut scopes = if request.scopes.is_empty() {
            vec![SCOPE_USER.to_string()]
        } else {
            request.scopes
        };
        scopes.sort();
        scopes.dedup();
        if let Some(scope) = scopes.iter().find(|s| !granted_scopes.contains(s)) {
            return Err(ServerError::forbidden(format!("cannot grant scope '{scope}'")));
        }

        let metadata = match request.metadata {
            None | Some(Value::Null) => json!({}),
            Some(value @ Value::Object(_)) => value,
            Some(_) => return Err(ServerError::validation("metadata must be an object")),
        };

        let exists = self
            .supabase
            .from(USERS)
            .select("id")
            .eq("id", user_id)
            .limit(1)
            .execute_one::<Value>()
            .await?;
        if exists.is_none() {
            return Err(ServerError::not_found("user"));
        }

        self.issue(user_id, &name, &scopes, i64::from(days), metadata)
            .await
    }

    /// Resolves an API key, checking expiry, the owner's status and
    /// `required_scopes`.
    pub async fn validate_api_key(&self, api_key: &str, required_scopes: &[&str]) -> Result<ApiKeyInfo> {
        if !api_key.starts_with(API_KEY_PREFIX) {
            return Err(ServerError::auth("invalid API key"));
        }

        let row: KeyWithOwner = self
            .supabase
            .from(API_KEYS)
            .select(&format!("{KEY_COLUMNS},owner:users(status)"))
            .eq("key_hash", hash_key(api_key))
            .eq("is_active", true)
            .limit(1)
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::auth("invalid API key"))?;

        let key = row.key;

        if key.is_expired() {
            debug!(key_id = %key.id, "Rejected expired API key");
            return Err(ServerError::auth("API key has expired"));
        }

        if row.owner.is_some_and(|owner| owner.status == UserStatus::Disabled) {
            return Err(ServerError::forbidden("account is disabled"));
        }

        let missing: Vec<&str> = required_scopes
            .iter()
            .copied()
            .filter(|scope| !key.has_scope(scope))
            .collect();
        if !missing.is_empty() {
            return Err(ServerError::forbidden(format!(
                "API key lacks required scopes: {}",
                missing.join(", ")
            )));
        }

        Ok(key)
    }

    /// Deactivates a key. Admins may revoke any user's key.
    pub async fn revoke_api_key(&self, key_id: &str, user_id: &str, is_admin: bool) -> Result<()> {
        let key = self.load_authorized(key_id, user_id, is_admin).await?;
        self.deactivate(&key.id).await?;

        info!(key_id = %key.id, user_id = %key.user_id, "API key revoked");
        Ok(())
    }

    /// Lists a user's keys, newest first. Revoked and expired keys are
    /// included only when asked for.
    pub async fn list_api_keys(&self, user_id: &str, include_expired: bool) -> Result<Vec<ApiKeyInfo>> {
        let mut query = self
            .supabase
            .from(API_KEYS)
            .select(KEY_COLUMNS)
            .eq("user_id", user_id);

        if !include_expired {
            query = query
                .eq("is_active", true)
                .gte("expires_at", Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        }

        Ok(query
            .order("created_at", false)
            .execute::<ApiKeyInfo>()
            .await?
            .data)
    }

    /// Replaces a key with a new one carrying the same name, scopes and
    /// metadata, and the remaining lifetime (at least one day).
    pub async fn rotate_api_key(&self, key_id: &str, user_id: &str, is_admin: bool) -> Result<IssuedApiKey> {
        let old = self.load_authorized(key_id, user_id, is_admin).await?;
        if !old.is_active {
            return Err(ServerError::conflict("API key has been revoked"));
        }

        let days = (old.expires_at - Utc::now()).num_days().max(1);
        let issued = self
            .issue(&old.user_id, &old.name, &old.scopes, days, old.metadata.clone())
            .await?;
        self.deactivate(&old.id).await?;

        info!(
            old_key_id = %old.id,
            key_id = %issued.key.id,
            user_id = %old.user_id,
            "API key rotated"
        );
        Ok(issued)
    }

    async fn issue(
        &self,
        user_id: &str,
        name: &str,
        scopes: &[String],
        days: i64,
        metadata: Value,
    ) -> Result<IssuedApiKey> {
        let api_key = self.random_key()?;
        let expires_at = Utc::now() + Duration::days(days);

        let key: ApiKeyInfo = self
            .supabase
            .from(API_KEYS)
            .select(KEY_COLUMNS)
            .insert(json!({
                "user_id": user_id,
                "name": name,
                "key_hash": hash_key(&api_key),
                "key_prefix": display_prefix(&api_key),
                "scopes": scopes,
                "expires_at": expires_at,
                "is_active": true,
                "metadata": metadata,
            }))
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::internal("API key insert returned no row"))?;

        info!(
            user_id = %user_id,
            key_id = %key.id,
            scope_count = scopes.len(),
            expiration_days = days,
            "API key generated"
        );
        Ok(IssuedApiKey { api_key, key })
    }

    /// Loads a key the caller may manage. Someone else's key is reported as
    /// missing unless the caller is an admin.
    async fn load_authorized(&self, key_id: &str, user_id: &str, is_admin: bool) -> Result<ApiKeyInfo> {
        let key: ApiKeyInfo = self
            .supabase
            .from(API_KEYS)
            .select(KEY_COLUMNS)
            .eq("id", key_id)
            .limit(1)
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::not_found("API key"))?;

        if key.user_id != user_id && !is_admin {
            warn!(key_id = %key_id, user_id = %user_id, "Refused access to another user's API key");
            return Err(ServerError::not_found("API key"));
        }

        Ok(key)
    }

    async fn deactivate(&self, key_id: &str) -> Result<()> {
        self.supabase
            .from(API_KEYS)
            .update(json!({ "is_active": false }))
            .eq("id", key_id)
            .execute::<Value>()
            .await?;
        Ok(())
    }

    fn random_key(&self) -> Result<String> {
        let mut bytes = [0u8; KEY_BYTES];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| ServerError::internal("failed to generate API key"))?;
        Ok(format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
    }
}

/// Hex SHA-256 digest stored in place of the key.
pub fn hash_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

fn display_prefix(api_key: &str) -> String {
    api_key.chars().take(DISPLAY_PREFIX_LEN).collect()
}
