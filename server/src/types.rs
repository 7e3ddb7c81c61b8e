//! Shared domain types for the VoiceHub server.
//!
//! Row types mirror the Supabase tables (`users`, `conversations`,
//! `conversation_turns`, `system_prompts`) and are also what the HTTP API
//! returns. Encrypted columns are decrypted by the services before a value of
//! these types leaves the server.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Scope granted to every authenticated user.
pub const SCOPE_USER: &str = "user";

/// Scope required by the admin API.
pub const SCOPE_ADMIN: &str = "admin";

/// Role of a user account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    User,
    Admin,
}

impl UserRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    /// Token scopes granted to this role.
    pub fn scopes(self) -> Vec<String> {
        match self {
            Self::User => vec![SCOPE_USER.to_string()],
            Self::Admin => vec![SCOPE_USER.to_string(), SCOPE_ADMIN.to_string()],
        }
    }
}

/// Account status. Disabled users cannot sign in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Active,
    Disabled,
    Pending,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Pending => "pending",
        }
    }
}

/// A row of the `users` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a conversation. Deletion is a soft delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
    Deleted,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// A row of the `conversation_turns` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub role: TurnRole,
    pub content: String,
    #[serde(default)]
    pub audio_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A conversation, with its turns when loaded individually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub system_prompt_id: Option<String>,
    #[serde(default)]
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

/// List entry for a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: u64,
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
}

impl<T> Paginated<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, page_size: u32) -> Self {
        let has_more = total > u64::from(page) * u64::from(page_size);
        Self {
            items,
            total,
            page,
            page_size,
            has_more,
        }
    }
}

/// Validated page parameters (1-based page).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub const DEFAULT_PAGE_SIZE: u32 = 10;
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Clamps `page` to at least 1 and `page_size` to `1..=100`.
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(Self::DEFAULT_PAGE_SIZE)
                .clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    pub fn offset(self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    /// Inclusive row range for a PostgREST `Range` header.
    pub fn range(self) -> (u64, u64) {
        let from = self.offset();
        (from, from + u64::from(self.page_size) - 1)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Category of a system prompt. Each category has at most one default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptCategory {
    #[default]
    General,
    CustomerService,
    TechnicalSupport,
    Sales,
    Custom,
}

impl PromptCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::CustomerService => "customer_service",
            Self::TechnicalSupport => "technical_support",
            Self::Sales => "sales",
            Self::Custom => "custom",
        }
    }
}

/// A row of the `system_prompts` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub id: String,
    pub created_by: String,
    pub name: String,
    pub content: String,
    pub category: PromptCategory,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Admin view of a user, as returned by `get_user_summaries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub role: UserRole,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub conversation_count: u64,
}

/// Reporting window for conversation metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsPeriod {
    Day,
    #[default]
    Week,
    Month,
    Year,
    All,
}

impl MetricsPeriod {
    /// Start of the window ending at `end`.
    ///
    /// A month is 30 days and a year 365 days; `All` starts at 2000-01-01.
    pub fn start(self, end: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Day => end - Duration::days(1),
            Self::Week => end - Duration::weeks(1),
            Self::Month => end - Duration::days(30),
            Self::Year => end - Duration::days(365),
            Self::All => Utc
                .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
        }
    }
}

/// Aggregates returned by `get_conversation_metrics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMetrics {
    pub total_conversations: u64,
    pub active_users: u64,
    pub total_turns: u64,
    pub avg_turns_per_conversation: f64,
    /// Average time between first and last turn, in seconds.
    pub avg_conversation_duration: f64,
    pub period: MetricsPeriod,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

/// Ordering of search results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSortOrder {
    #[default]
    Relevance,
    CreatedAt,
    UpdatedAt,
    Newest,
}

impl SearchSortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relevance => "relevance",
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Newest => "newest",
        }
    }
}

/// A turn matched by full-text search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSearchHit {
    #[serde(flatten)]
    pub turn: Turn,
    #[serde(default)]
    pub relevance: f64,
}

/// Search results with the query that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults<T> {
    pub query: String,
    #[serde(flatten)]
    pub results: Paginated<T>,
}

/// A stored user file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// Credentials for joining a LiveKit room.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceToken {
    pub url: String,
    pub token: String,
    pub room: String,
}

impl std::fmt::Debug for VoiceToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceToken")
            .field("url", &self.url)
            .field("token", &"[REDACTED]")
            .field("room", &self.room)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_row_defaults_missing_fields() {
        let user: User = serde_json::from_value(json!({
            "id": "u1",
            "email": "a@example.com"
        }))
        .unwrap();

        assert_eq!(user.role, UserRole::User);
        assert_eq!(user.status, UserStatus::Active);
        assert!(user.full_name.is_none());
    }

    #[test]
    fn role_scopes() {
        assert_eq!(UserRole::User.scopes(), vec!["user"]);
        assert_eq!(UserRole::Admin.scopes(), vec!["user", "admin"]);
    }

    #[test]
    fn enums_use_snake_case() {
        assert_eq!(
            serde_json::to_value(PromptCategory::CustomerService).unwrap(),
            "customer_service"
        );
        assert_eq!(serde_json::to_value(TurnRole::Assistant).unwrap(), "assistant");
        assert_eq!(
            serde_json::from_value::<ConversationStatus>(json!("archived")).unwrap(),
            ConversationStatus::Archived
        );
        assert_eq!(PromptCategory::TechnicalSupport.as_str(), "technical_support");
        assert_eq!(SearchSortOrder::UpdatedAt.as_str(), "updated_at");
    }

    #[test]
    fn turn_parses_postgres_timestamps() {
        let turn: Turn = serde_json::from_value(json!({
            "id": "t1",
            "conversation_id": "c1",
            "role": "user",
            "content": "hello",
            "created_at": "2024-05-01T12:30:00.123456+00:00"
        }))
        .unwrap();

        assert_eq!(turn.role, TurnRole::User);
        assert!(turn.audio_url.is_none());
    }

    #[test]
    fn paginated_has_more() {
        let page = Paginated::new(vec![1, 2], 12, 1, 10);
        assert!(page.has_more);

        let page = Paginated::new(vec![1, 2], 12, 2, 10);
        assert!(!page.has_more);

        let page: Paginated<u8> = Paginated::new(vec![], 0, 1, 10);
        assert!(!page.has_more);
    }

    #[test]
    fn page_request_clamps_and_computes_range() {
        let req = PageRequest::new(Some(0), Some(500));
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, 100);

        let req = PageRequest::new(Some(3), Some(20));
        assert_eq!(req.offset(), 40);
        assert_eq!(req.range(), (40, 59));

        assert_eq!(PageRequest::default().page_size, 10);
    }

    #[test]
    fn metrics_period_start() {
        let end = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();

        assert_eq!(MetricsPeriod::Day.start(end), end - Duration::days(1));
        assert_eq!(MetricsPeriod::Month.start(end), end - Duration::days(30));
        assert_eq!(MetricsPeriod::Year.start(end), end - Duration::days(365));
        assert_eq!(
            MetricsPeriod::All.start(end),
            Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn search_results_flatten_page_fields() {
        let results = SearchResults {
            query: "hello".to_string(),
            results: Paginated::new(vec!["a"], 1, 1, 10),
        };
        let value = serde_json::to_value(&results).unwrap();

        assert_eq!(value["query"], "hello");
        assert_eq!(value["total"], 1);
        assert_eq!(value["has_more"], false);
    }

    #[test]
    fn voice_token_debug_hides_token() {
        let token = VoiceToken {
            url: "wss://lk.example.com".into(),
            token: "secret-jwt".into(),
            room: "conv-1".into(),
        };
        assert!(!format!("{token:?}").contains("secret-jwt"));
    }
}
