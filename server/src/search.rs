//! Full-text search over conversations and turns.
//!
//! Searching is delegated to Postgres functions exposed through PostgREST
//! RPC. Each search issues a page query and a matching count query with the
//! same filters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::encryption::FieldEncryption;
use crate::error::{Result, ServerError};
use crate::supabase::SupabaseClient;
use crate::types::{
    ConversationStatus, ConversationSummary, PageRequest, Paginated, SearchResults,
    SearchSortOrder, TurnRole, TurnSearchHit,
};
use crate::validation::validate_text;

const DEFAULT_MIN_SIMILARITY: f64 = 0.1;
const MAX_QUERY_LEN: usize = 200;
const MIN_SUGGESTION_QUERY_LEN: usize = 2;
const DEFAULT_SUGGESTION_LIMIT: u32 = 5;
const MAX_SUGGESTION_LIMIT: u32 = 20;

/// Search request shared by conversation and turn search.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub sort: SearchSortOrder,
    #[serde(default)]
    pub min_similarity: Option<f64>,
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
    /// Turn search only: restrict to one conversation.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Turn search only: restrict to one speaker.
    #[serde(default)]
    pub role: Option<TurnRole>,
}

#[derive(Debug, Deserialize)]
struct ConversationHit {
    conversation_id: String,
    title: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    turn_count: u64,
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    relevance: f64,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct SuggestionRow {
    #[serde(default)]
    suggestion: Option<String>,
}

/// Converts free text into a `to_tsquery` expression.
///
/// The text is lowercased, everything but letters, digits and whitespace is
/// dropped, and the words are AND-ed together. With `partial` every word
/// becomes a prefix match.
pub fn prepare_search_query(query: &str, partial: bool) -> String {
    let cleaned: String = query
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();

    cleaned
        .split_whitespace()
        .map(|word| {
            if partial {
                format!("{word}:*")
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" & ")
}

#[derive(Debug, Clone)]
pub struct SearchService {
    supabase: Arc<SupabaseClient>,
    encryption: Arc<FieldEncryption>,
}

impl SearchService {
    pub fn new(supabase: Arc<SupabaseClient>, encryption: Arc<FieldEncryption>) -> Self {
        Self {
            supabase,
            encryption,
        }
    }

    /// Searches the user's conversations.
    pub async fn search_conversations(
        &self,
        user_id: &str,
        params: &SearchParams,
    ) -> Result<SearchResults<ConversationSummary>> {
        let query = validate_text(&params.query, 1, MAX_QUERY_LEN, "query")?;
        let page = PageRequest::new(params.page, params.page_size);
        let prepared = prepare_search_query(&query, false);

        if prepared.is_empty() {
            return Ok(empty_results(query, page));
        }

        let mut rpc_params = base_params(user_id, &prepared, params);

        let total = self
            .count("count_search_conversations_enhanced", &rpc_params)
            .await?;

        add_page(&mut rpc_params, page);
        let hits: Vec<ConversationHit> = self
            .supabase
            .rpc("search_conversations_enhanced", &Value::Object(rpc_params))
            .await?;

        debug!(hits = hits.len(), total, "Conversation search completed");

        let items = hits
            .into_iter()
            .map(|hit| ConversationSummary {
                id: hit.conversation_id,
                title: self.encryption.decrypt_or_raw(&hit.title),
                status: ConversationStatus::Active,
                created_at: hit.created_at,
                updated_at: hit.updated_at,
                turn_count: hit.turn_count,
                last_message: hit
                    .last_message
                    .map(|m| self.encryption.decrypt_or_raw(&m)),
                relevance: Some(hit.relevance),
            })
            .collect();

        Ok(SearchResults {
            query,
            results: Paginated::new(items, total, page.page, page.page_size),
        })
    }

    /// Searches turns in the user's conversations.
    ///
    /// With `conversation_id` set, the conversation must belong to the user.
    pub async fn search_turns(
        &self,
        user_id: &str,
        params: &SearchParams,
    ) -> Result<SearchResults<TurnSearchHit>> {
        let query = validate_text(&params.query, 1, MAX_QUERY_LEN, "query")?;
        let page = PageRequest::new(params.page, params.page_size);

        if let Some(conversation_id) = params.conversation_id.as_deref() {
            self.ensure_owned(conversation_id, user_id).await?;
        }

        let prepared = prepare_search_query(&query, false);
        if prepared.is_empty() {
            return Ok(empty_results(query, page));
        }

        let mut rpc_params = base_params(user_id, &prepared, params);
        if let Some(conversation_id) = params.conversation_id.as_deref() {
            rpc_params.insert("conversation_id_param".into(), json!(conversation_id));
        }
        if let Some(role) = params.role {
            rpc_params.insert("role_param".into(), json!(role.as_str()));
        }

        let total = self
            .count("count_search_conversation_turns", &rpc_params)
            .await?;

        add_page(&mut rpc_params, page);
        let hits: Vec<TurnSearchHit> = self
            .supabase
            .rpc("search_conversation_turns", &Value::Object(rpc_params))
            .await?;

        debug!(hits = hits.len(), total, "Turn search completed");

        let items = hits
            .into_iter()
            .map(|mut hit| {
                hit.turn.content = self.encryption.decrypt_or_raw(&hit.turn.content);
                hit
            })
            .collect();

        Ok(SearchResults {
            query,
            results: Paginated::new(items, total, page.page, page.page_size),
        })
    }

    /// Completions for a partially typed query.
    ///
    /// Queries shorter than two characters return no suggestions.
    pub async fn get_search_suggestions(
        &self,
        user_id: &str,
        query: &str,
        limit: Option<u32>,
    ) -> Result<Vec<String>> {
        let query = query.trim();
        if query.chars().count() < MIN_SUGGESTION_QUERY_LEN {
            return Ok(Vec::new());
        }

        let prepared = prepare_search_query(query, true);
        if prepared.is_empty() {
            return Ok(Vec::new());
        }

        let limit = limit
            .unwrap_or(DEFAULT_SUGGESTION_LIMIT)
            .clamp(1, MAX_SUGGESTION_LIMIT);

        let rows: Vec<SuggestionRow> = self
            .supabase
            .rpc(
                "get_search_suggestions",
                &json!({
                    "user_id_param": user_id,
                    "query_param": prepared,
                    "limit_param": limit,
                }),
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.suggestion)
            .map(|s| self.encryption.decrypt_or_raw(&s))
            .collect())
    }

    async fn count(&self, function: &str, params: &Map<String, Value>) -> Result<u64> {
        let rows: Vec<CountRow> = self
            .supabase
            .rpc(function, &Value::Object(params.clone()))
            .await?;
        Ok(rows.first().map_or(0, |row| row.count))
    }

    async fn ensure_owned(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        let row: Option<Value> = self
            .supabase
            .from("conversations")
            .select("id")
            .eq("id", conversation_id)
            .eq("user_id", user_id)
            .neq("status", ConversationStatus::Deleted.as_str())
            .limit(1)
            .execute_one()
            .await?;

        row.map(|_| ())
            .ok_or_else(|| ServerError::not_found("conversation"))
    }
}

fn base_params(user_id: &str, prepared: &str, params: &SearchParams) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("user_id_param".into(), json!(user_id));
    map.insert("query_param".into(), json!(prepared));
    map.insert(
        "min_similarity_param".into(),
        json!(params
            .min_similarity
            .unwrap_or(DEFAULT_MIN_SIMILARITY)
            .clamp(0.0, 1.0)),
    );
    map.insert("sort_order".into(), json!(params.sort.as_str()));
    if let Some(from) = params.date_from {
        map.insert("start_date".into(), json!(from));
    }
    if let Some(to) = params.date_to {
        map.insert("end_date".into(), json!(to));
    }
    map
}

fn add_page(params: &mut Map<String, Value>, page: PageRequest) {
    params.insert("limit_param".into(), json!(page.page_size));
    params.insert("offset_param".into(), json!(page.offset()));
}

fn empty_results<T>(query: String, page: PageRequest) -> SearchResults<T> {
    SearchResults {
        query,
        results: Paginated::new(Vec::new(), 0, page.page, page.page_size),
    }
}
