//! Administration: system prompts, user management and usage metrics.
//!
//! Callers must hold the `admin` scope; the route layer enforces it, so
//! nothing here checks permissions again.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::error::{Result, ServerError};
use crate::jwt::JwtAuthManager;
use crate::supabase::SupabaseClient;
use crate::types::{
    ConversationMetrics, ConversationStatus, MetricsPeriod, PageRequest, Paginated,
    PromptCategory, SystemPrompt, User, UserRole, UserStatus, UserSummary,
};
use crate::validation::validate_text;

const PROMPTS: &str = "system_prompts";
const USERS: &str = "users";
const CONVERSATIONS: &str = "conversations";

const MAX_PROMPT_NAME_LEN: usize = 100;
const MAX_PROMPT_CONTENT_LEN: usize = 10_000;

#[derive(Debug, Clone, Deserialize)]
pub struct NewPrompt {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub category: PromptCategory,
    #[serde(default)]
    pub is_default: bool,
}

/// Partial update of a system prompt. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub category: Option<PromptCategory>,
    #[serde(default)]
    pub is_default: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct MetricsRow {
    #[serde(default)]
    total_conversations: Option<u64>,
    #[serde(default)]
    active_users: Option<u64>,
    #[serde(default)]
    total_turns: Option<u64>,
    #[serde(default)]
    avg_turns_per_conversation: Option<f64>,
    #[serde(default)]
    avg_conversation_duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

#[derive(Debug, Clone)]
pub struct AdminService {
    supabase: Arc<SupabaseClient>,
    jwt: Arc<JwtAuthManager>,
}

impl AdminService {
    pub fn new(supabase: Arc<SupabaseClient>, jwt: Arc<JwtAuthManager>) -> Self {
        Self { supabase, jwt }
    }

    // ==================== System prompts ====================

    /// Creates a prompt. A new default replaces the category's previous one.
    pub async fn create_prompt(&self, created_by: &str, prompt: NewPrompt) -> Result<SystemPrompt> {
        let name = validate_text(&prompt.name, 1, MAX_PROMPT_NAME_LEN, "name")?;
        let content = validate_text(&prompt.content, 1, MAX_PROMPT_CONTENT_LEN, "content")?;

        let created: SystemPrompt = self
            .supabase
            .from(PROMPTS)
            .insert(json!({
                "created_by": created_by,
                "name": name,
                "content": content,
                "category": prompt.category.as_str(),
                "is_default": prompt.is_default,
            }))
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::internal("prompt insert returned no row"))?;

        if created.is_default {
            self.clear_other_defaults(&created.id, created.category)
                .await?;
        }

        info!(prompt_id = %created.id, category = created.category.as_str(), "System prompt created");
        Ok(created)
    }

    pub async fn update_prompt(&self, prompt_id: &str, update: PromptUpdate) -> Result<SystemPrompt> {
        let mut values = Map::new();
        if let Some(name) = update.name.as_deref() {
            let name = validate_text(name, 1, MAX_PROMPT_NAME_LEN, "name")?;
            values.insert("name".into(), json!(name));
        }
        if let Some(content) = update.content.as_deref() {
            let content = validate_text(content, 1, MAX_PROMPT_CONTENT_LEN, "content")?;
            values.insert("content".into(), json!(content));
        }
        if let Some(category) = update.category {
            values.insert("category".into(), json!(category.as_str()));
        }
        if let Some(is_default) = update.is_default {
            values.insert("is_default".into(), json!(is_default));
        }

        if values.is_empty() {
            return self.get_prompt(prompt_id).await;
        }
        values.insert("updated_at".into(), json!(Utc::now()));

        let updated: SystemPrompt = self
            .supabase
            .from(PROMPTS)
            .eq("id", prompt_id)
            .update(Value::Object(values))
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::not_found("system prompt"))?;

        if update.is_default == Some(true) {
            self.clear_other_defaults(&updated.id, updated.category)
                .await?;
        }

        debug!(prompt_id = %prompt_id, "System prompt updated");
        Ok(updated)
    }

    /// Deletes a prompt that no live conversation uses.
    pub async fn delete_prompt(&self, prompt_id: &str) -> Result<()> {
        self.get_prompt(prompt_id).await?;

        let in_use: Option<Value> = self
            .supabase
            .from(CONVERSATIONS)
            .select("id")
            .eq("system_prompt_id", prompt_id)
            .neq("status", ConversationStatus::Deleted.as_str())
            .limit(1)
            .execute_one()
            .await?;

        if in_use.is_some() {
            return Err(ServerError::conflict(
                "system prompt is used by existing conversations",
            ));
        }

        self.supabase
            .from(PROMPTS)
            .eq("id", prompt_id)
            .delete()
            .execute::<Value>()
            .await?;

        info!(prompt_id = %prompt_id, "System prompt deleted");
        Ok(())
    }

    pub async fn get_prompt(&self, prompt_id: &str) -> Result<SystemPrompt> {
        self.supabase
            .from(PROMPTS)
            .eq("id", prompt_id)
            .limit(1)
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::not_found("system prompt"))
    }

    /// Lists prompts by name, optionally limited to one category.
    pub async fn list_prompts(
        &self,
        category: Option<PromptCategory>,
        page: PageRequest,
    ) -> Result<Paginated<SystemPrompt>> {
        let mut query = self.supabase.from(PROMPTS);
        if let Some(category) = category {
            query = query.eq("category", category.as_str());
        }

        let (from, to) = page.range();
        let response = query
            .order("name", true)
            .range(from, to)
            .count_exact()
            .execute::<SystemPrompt>()
            .await?;

        let total = response.count.unwrap_or(response.data.len() as u64);
        Ok(Paginated::new(response.data, total, page.page, page.page_size))
    }

    pub async fn get_default_prompt(&self, category: PromptCategory) -> Result<Option<SystemPrompt>> {
        Ok(self
            .supabase
            .from(PROMPTS)
            .eq("category", category.as_str())
            .eq("is_default", true)
            .limit(1)
            .execute_one()
            .await?)
    }

    /// Makes a prompt the default of its category.
    pub async fn set_default_prompt(&self, prompt_id: &str) -> Result<SystemPrompt> {
        let prompt = self.get_prompt(prompt_id).await?;
        self.clear_other_defaults(&prompt.id, prompt.category)
            .await?;

        let updated: SystemPrompt = self
            .supabase
            .from(PROMPTS)
            .eq("id", prompt_id)
            .update(json!({ "is_default": true, "updated_at": Utc::now() }))
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::not_found("system prompt"))?;

        info!(prompt_id = %prompt_id, category = prompt.category.as_str(), "Default prompt set");
        Ok(updated)
    }

    async fn clear_other_defaults(&self, keep_id: &str, category: PromptCategory) -> Result<()> {
        self.supabase
            .from(PROMPTS)
            .eq("category", category.as_str())
            .eq("is_default", true)
            .neq("id", keep_id)
            .update(json!({ "is_default": false }))
            .execute::<Value>()
            .await?;
        Ok(())
    }

    // ==================== Users ====================

    pub async fn list_users(
        &self,
        status: Option<UserStatus>,
        page: PageRequest,
    ) -> Result<Paginated<UserSummary>> {
        let status_param = status.map(UserStatus::as_str);

        let users: Vec<UserSummary> = self
            .supabase
            .rpc(
                "get_user_summaries",
                &json!({
                    "limit_param": page.page_size,
                    "offset_param": page.offset(),
                    "status_param": status_param,
                }),
            )
            .await?;

        let counts: Vec<CountRow> = self
            .supabase
            .rpc("get_user_count", &json!({ "status_param": status_param }))
            .await?;
        let total = counts.first().map_or(0, |row| row.count);

        Ok(Paginated::new(users, total, page.page, page.page_size))
    }

    /// Changes a user's role.
    ///
    /// A demotion revokes the user's tokens so the `admin` scope doesn't
    /// outlive it. Promotions apply from the next login or refresh.
    pub async fn update_user_role(&self, user_id: &str, role: UserRole) -> Result<User> {
        let user = self
            .update_user(user_id, json!({ "role": role.as_str(), "updated_at": Utc::now() }))
            .await?;

        if role == UserRole::User {
            self.jwt.revoke_all_for_user(user_id);
        }

        info!(user_id = %user_id, role = role.as_str(), "User role updated");
        Ok(user)
    }

    /// Changes a user's status. Disabling revokes all of the user's tokens.
    pub async fn update_user_status(&self, user_id: &str, status: UserStatus) -> Result<User> {
        let user = self
            .update_user(user_id, json!({ "status": status.as_str(), "updated_at": Utc::now() }))
            .await?;

        if status == UserStatus::Disabled {
            self.jwt.revoke_all_for_user(user_id);
        }

        info!(user_id = %user_id, status = status.as_str(), "User status updated");
        Ok(user)
    }

    async fn update_user(&self, user_id: &str, values: Value) -> Result<User> {
        self.supabase
            .from(USERS)
            .eq("id", user_id)
            .update(values)
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::not_found("user"))
    }

    // ==================== Metrics ====================

    /// Conversation activity over the period ending now.
    pub async fn conversation_metrics(&self, period: MetricsPeriod) -> Result<ConversationMetrics> {
        let end_date = Utc::now();
        let start_date = period.start(end_date);

        let rows: Vec<MetricsRow> = self
            .supabase
            .rpc(
                "get_conversation_metrics",
                &json!({
                    "start_date_param": start_date,
                    "end_date_param": end_date,
                }),
            )
            .await?;
        let row = rows.into_iter().next().unwrap_or_default();

        Ok(ConversationMetrics {
            total_conversations: row.total_conversations.unwrap_or(0),
            active_users: row.active_users.unwrap_or(0),
            total_turns: row.total_turns.unwrap_or(0),
            avg_turns_per_conversation: row.avg_turns_per_conversation.unwrap_or(0.0),
            avg_conversation_duration: row.avg_conversation_duration.unwrap_or(0.0),
            period,
            start_date,
            end_date,
        })
    }

    /// Drops revocation entries for tokens that have expired anyway.
    pub fn cleanup_revocations(&self) -> usize {
        let removed = self.jwt.cleanup_expired_tokens();
        info!(removed, "Revocation cleanup triggered");
        removed
    }
}
