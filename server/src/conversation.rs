//! Conversation and turn persistence.
//!
//! Every operation is scoped to the calling user: a conversation that belongs
//! to someone else, or that has been soft-deleted, is reported as not found.
//! Turn operations resolve the owning conversation first.
//!
//! Titles and turn content are stored encrypted (see [`crate::encryption`]).

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::encryption::FieldEncryption;
use crate::error::{Result, ServerError};
use crate::storage::{turn_audio_path, StorageService};
use crate::supabase::SupabaseClient;
use crate::types::{
    Conversation, ConversationStatus, ConversationSummary, PageRequest, Paginated, Turn, TurnRole,
};
use crate::validation::validate_text;

const CONVERSATIONS: &str = "conversations";
const TURNS: &str = "conversation_turns";
const PROMPTS: &str = "system_prompts";

/// Conversation columns plus the turn count and the latest non-system turn,
/// embedded so a page of summaries is a single request.
const SUMMARY_SELECT: &str = "id,title,status,created_at,updated_at,\
turn_count:conversation_turns(count),\
last_turn:conversation_turns(content)";

const MAX_TITLE_LEN: usize = 200;
const MAX_CONTENT_LEN: usize = 50_000;

/// Changes to apply to a conversation. Absent fields are left as they are.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub system_prompt_id: Option<String>,
    #[serde(default)]
    pub status: Option<ConversationStatus>,
}

/// A new turn, with optional audio to store alongside it.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub role: TurnRole,
    pub content: String,
    pub audio: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct ConversationRow {
    id: String,
    title: String,
    #[serde(default)]
    status: ConversationStatus,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ContentRow {
    content: String,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct SummaryRow {
    #[serde(flatten)]
    conversation: ConversationRow,
    #[serde(default)]
    turn_count: Vec<CountRow>,
    #[serde(default)]
    last_turn: Vec<ContentRow>,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}

#[derive(Debug, Clone)]
pub struct ConversationService {
    supabase: Arc<SupabaseClient>,
    encryption: Arc<FieldEncryption>,
    storage: StorageService,
}

impl ConversationService {
    pub fn new(
        supabase: Arc<SupabaseClient>,
        encryption: Arc<FieldEncryption>,
        storage: StorageService,
    ) -> Self {
        Self {
            supabase,
            encryption,
            storage,
        }
    }

    // ==================== Conversations ====================

    /// Creates a conversation. A system prompt adds a leading `system` turn.
    pub async fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
        system_prompt_id: Option<&str>,
    ) -> Result<Conversation> {
        let title = validate_text(title, 1, MAX_TITLE_LEN, "title")?;

        let prompt_content = match system_prompt_id {
            Some(prompt_id) => Some(self.load_prompt_content(prompt_id).await?),
            None => None,
        };

        let now = Utc::now();
        let row = json!({
            "id": Uuid::new_v4().to_string(),
            "user_id": user_id,
            "title": self.encryption.encrypt_field(&title)?,
            "system_prompt_id": system_prompt_id,
            "status": ConversationStatus::Active.as_str(),
            "created_at": now,
            "updated_at": now,
        });

        let mut conversation: Conversation = self
            .supabase
            .from(CONVERSATIONS)
            .insert(row)
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::internal("conversation insert returned no row"))?;

        conversation.title = self.encryption.decrypt_or_raw(&conversation.title);

        if let Some(content) = prompt_content {
            let turn = self
                .insert_turn(&conversation.id, &Uuid::new_v4().to_string(), TurnRole::System, &content, None)
                .await?;
            conversation.turns.push(turn);
        }

        info!(conversation_id = %conversation.id, "Conversation created");
        Ok(conversation)
    }

    /// Loads a conversation with its turns in chronological order.
    pub async fn get_conversation(&self, conversation_id: &str, user_id: &str) -> Result<Conversation> {
        let mut conversation = self.ensure_conversation_owned(conversation_id, user_id).await?;

        let turns: Vec<Turn> = self
            .supabase
            .from(TURNS)
            .select("*")
            .eq("conversation_id", conversation_id)
            .order("created_at", true)
            .execute()
            .await?
            .data;

        conversation.turns = turns.into_iter().map(|t| self.decrypt_turn(t)).collect();
        Ok(conversation)
    }

    /// Returns the conversation if it exists, is not deleted and belongs to `user_id`.
    ///
    /// The returned value has no turns loaded.
    pub async fn ensure_conversation_owned(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Conversation> {
        let conversation: Option<Conversation> = self
            .supabase
            .from(CONVERSATIONS)
            .select("*")
            .eq("id", conversation_id)
            .eq("user_id", user_id)
            .neq("status", ConversationStatus::Deleted.as_str())
            .limit(1)
            .execute_one()
            .await?;

        let mut conversation = conversation.ok_or_else(|| ServerError::not_found("conversation"))?;
        conversation.title = self.encryption.decrypt_or_raw(&conversation.title);
        Ok(conversation)
    }

    /// Lists the user's conversations, most recently updated first.
    ///
    /// Without a status filter deleted conversations are excluded.
    pub async fn list_conversations(
        &self,
        user_id: &str,
        status: Option<ConversationStatus>,
        page: PageRequest,
    ) -> Result<Paginated<ConversationSummary>> {
        let (from, to) = page.range();

        let mut query = self
            .supabase
            .from(CONVERSATIONS)
            .select(SUMMARY_SELECT)
            .eq("user_id", user_id)
            .neq("last_turn.role", TurnRole::System.as_str())
            .embedded_order("last_turn", "created_at", false)
            .embedded_limit("last_turn", 1);
        query = match status {
            Some(status) => query.eq("status", status.as_str()),
            None => query.neq("status", ConversationStatus::Deleted.as_str()),
        };

        let response = query
            .order("updated_at", false)
            .range(from, to)
            .count_exact()
            .execute::<SummaryRow>()
            .await?;

        let total = response.count.unwrap_or(response.data.len() as u64);

        let items = response
            .data
            .into_iter()
            .map(|row| {
                let conversation = row.conversation;
                ConversationSummary {
                    title: self.encryption.decrypt_or_raw(&conversation.title),
                    id: conversation.id,
                    status: conversation.status,
                    created_at: conversation.created_at,
                    updated_at: conversation.updated_at,
                    turn_count: row.turn_count.first().map_or(0, |c| c.count),
                    last_message: row
                        .last_turn
                        .first()
                        .map(|turn| self.encryption.decrypt_or_raw(&turn.content)),
                    relevance: None,
                }
            })
            .collect();

        Ok(Paginated::new(items, total, page.page, page.page_size))
    }

    /// Applies `update` and returns the conversation with its turns.
    ///
    /// Changing the system prompt rewrites the existing `system` turn, or adds
    /// one if the conversation has none.
    pub async fn update_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
        update: ConversationUpdate,
    ) -> Result<Conversation> {
        self.ensure_conversation_owned(conversation_id, user_id).await?;

        let mut changes = Map::new();

        if let Some(title) = update.title.as_deref() {
            let title = validate_text(title, 1, MAX_TITLE_LEN, "title")?;
            changes.insert("title".into(), Value::String(self.encryption.encrypt_field(&title)?));
        }

        if let Some(status) = update.status {
            if status == ConversationStatus::Deleted {
                return Err(ServerError::validation(
                    "use DELETE to remove a conversation",
                ));
            }
            changes.insert("status".into(), Value::from(status.as_str()));
        }

        if let Some(prompt_id) = update.system_prompt_id.as_deref() {
            let content = self.load_prompt_content(prompt_id).await?;
            self.replace_system_turn(conversation_id, &content).await?;
            changes.insert("system_prompt_id".into(), Value::from(prompt_id));
        }

        changes.insert("updated_at".into(), json!(Utc::now()));

        self.supabase
            .from(CONVERSATIONS)
            .update(Value::Object(changes))
            .eq("id", conversation_id)
            .execute::<Value>()
            .await?;

        debug!(conversation_id = %conversation_id, "Conversation updated");
        self.get_conversation(conversation_id, user_id).await
    }

    /// Soft-deletes a conversation.
    pub async fn delete_conversation(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.ensure_conversation_owned(conversation_id, user_id).await?;

        self.supabase
            .from(CONVERSATIONS)
            .update(json!({
                "status": ConversationStatus::Deleted.as_str(),
                "updated_at": Utc::now(),
            }))
            .eq("id", conversation_id)
            .execute::<Value>()
            .await?;

        info!(conversation_id = %conversation_id, "Conversation deleted");
        Ok(())
    }

    // ==================== Turns ====================

    /// Appends a turn. Audio, when present, is stored first and linked by URL.
    pub async fn add_turn(&self, conversation_id: &str, user_id: &str, turn: NewTurn) -> Result<Turn> {
        self.ensure_conversation_owned(conversation_id, user_id).await?;
        let content = validate_text(&turn.content, 1, MAX_CONTENT_LEN, "content")?;

        let turn_id = Uuid::new_v4().to_string();

        let audio_url = match turn.audio {
            Some(bytes) if !bytes.is_empty() => Some(
                self.storage
                    .upload_audio(&turn_audio_path(conversation_id, &turn_id), bytes)
                    .await?,
            ),
            _ => None,
        };

        let turn = self
            .insert_turn(conversation_id, &turn_id, turn.role, &content, audio_url)
            .await?;
        self.touch_conversation(conversation_id).await?;

        Ok(turn)
    }

    /// Loads a turn if its conversation belongs to `user_id`.
    pub async fn get_turn(&self, turn_id: &str, user_id: &str) -> Result<Turn> {
        let turn: Turn = self
            .supabase
            .from(TURNS)
            .select("*")
            .eq("id", turn_id)
            .limit(1)
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::not_found("turn"))?;

        self.ensure_conversation_owned(&turn.conversation_id, user_id)
            .await
            .map_err(|err| match err {
                ServerError::NotFound(_) => ServerError::not_found("turn"),
                other => other,
            })?;

        Ok(self.decrypt_turn(turn))
    }

    pub async fn update_turn(&self, turn_id: &str, user_id: &str, content: &str) -> Result<Turn> {
        let existing = self.get_turn(turn_id, user_id).await?;
        let content = validate_text(content, 1, MAX_CONTENT_LEN, "content")?;

        let updated: Turn = self
            .supabase
            .from(TURNS)
            .update(json!({ "content": self.encryption.encrypt_field(&content)? }))
            .eq("id", turn_id)
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::not_found("turn"))?;

        self.touch_conversation(&existing.conversation_id).await?;
        Ok(self.decrypt_turn(updated))
    }

    /// Deletes a turn and its stored audio.
    pub async fn delete_turn(&self, turn_id: &str, user_id: &str) -> Result<()> {
        let turn = self.get_turn(turn_id, user_id).await?;

        self.supabase
            .from(TURNS)
            .delete()
            .eq("id", turn_id)
            .execute::<Value>()
            .await?;

        if let Some(path) = turn
            .audio_url
            .as_deref()
            .and_then(|url| self.storage.audio_path_from_url(url))
        {
            if let Err(err) = self.storage.delete_audio(&path).await {
                warn!(turn_id = %turn_id, error = %err, "Failed to delete turn audio");
            }
        }

        self.touch_conversation(&turn.conversation_id).await?;
        Ok(())
    }

    /// Lists a conversation's turns in chronological order.
    pub async fn list_turns(
        &self,
        conversation_id: &str,
        user_id: &str,
        page: PageRequest,
    ) -> Result<Paginated<Turn>> {
        self.ensure_conversation_owned(conversation_id, user_id).await?;
        let (from, to) = page.range();

        let response = self
            .supabase
            .from(TURNS)
            .select("*")
            .eq("conversation_id", conversation_id)
            .order("created_at", true)
            .range(from, to)
            .count_exact()
            .execute::<Turn>()
            .await?;

        let total = response.count.unwrap_or(response.data.len() as u64);
        let items = response
            .data
            .into_iter()
            .map(|t| self.decrypt_turn(t))
            .collect();

        Ok(Paginated::new(items, total, page.page, page.page_size))
    }

    // ==================== Helpers ====================

    async fn insert_turn(
        &self,
        conversation_id: &str,
        turn_id: &str,
        role: TurnRole,
        content: &str,
        audio_url: Option<String>,
    ) -> Result<Turn> {
        let row = json!({
            "id": turn_id,
            "conversation_id": conversation_id,
            "role": role.as_str(),
            "content": self.encryption.encrypt_field(content)?,
            "audio_url": audio_url,
            "created_at": Utc::now(),
        });

        let turn: Turn = self
            .supabase
            .from(TURNS)
            .insert(row)
            .execute_one()
            .await?
            .ok_or_else(|| ServerError::internal("turn insert returned no row"))?;

        Ok(self.decrypt_turn(turn))
    }

    async fn replace_system_turn(&self, conversation_id: &str, content: &str) -> Result<()> {
        let existing: Option<IdRow> = self
            .supabase
            .from(TURNS)
            .select("id")
            .eq("conversation_id", conversation_id)
            .eq("role", TurnRole::System.as_str())
            .limit(1)
            .execute_one()
            .await?;

        match existing {
            Some(row) => {
                self.supabase
                    .from(TURNS)
                    .update(json!({ "content": self.encryption.encrypt_field(content)? }))
                    .eq("id", &row.id)
                    .execute::<Value>()
                    .await?;
            }
            None => {
                self.insert_turn(
                    conversation_id,
                    &Uuid::new_v4().to_string(),
                    TurnRole::System,
                    content,
                    None,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn touch_conversation(&self, conversation_id: &str) -> Result<()> {
        self.supabase
            .from(CONVERSATIONS)
            .update(json!({ "updated_at": Utc::now() }))
            .eq("id", conversation_id)
            .execute::<Value>()
            .await?;
        Ok(())
    }

    async fn load_prompt_content(&self, prompt_id: &str) -> Result<String> {
        let row: Option<ContentRow> = self
            .supabase
            .from(PROMPTS)
            .select("content")
            .eq("id", prompt_id)
            .limit(1)
            .execute_one()
            .await?;

        row.map(|r| r.content)
            .ok_or_else(|| ServerError::not_found("system prompt"))
    }

    fn decrypt_turn(&self, mut turn: Turn) -> Turn {
        turn.content = self.encryption.decrypt_or_raw(&turn.content);
        turn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FIELD_KEY_LEN;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const USER: &str = "user-1";
    const NOW: &str = "2024-05-01T12:00:00+00:00";

    fn encryption() -> Arc<FieldEncryption> {
        Arc::new(FieldEncryption::new(&[9u8; FIELD_KEY_LEN]).unwrap())
    }

    fn service(server: &MockServer, encryption: Arc<FieldEncryption>) -> ConversationService {
        let client = Arc::new(SupabaseClient::new(server.uri(), "anon").unwrap());
        let storage = StorageService::new(Arc::clone(&client), "audio", "files");
        ConversationService::new(client, encryption, storage)
    }

    fn conversation_row(enc: &FieldEncryption, id: &str, title: &str) -> Value {
        json!({
            "id": id,
            "user_id": USER,
            "title": enc.encrypt_field(title).unwrap(),
            "system_prompt_id": null,
            "status": "active",
            "created_at": NOW,
            "updated_at": NOW
        })
    }

    fn turn_row(enc: &FieldEncryption, id: &str, role: &str, content: &str) -> Value {
        json!({
            "id": id,
            "conversation_id": "c1",
            "role": role,
            "content": enc.encrypt_field(content).unwrap(),
            "audio_url": null,
            "created_at": NOW
        })
    }

    async fn mount_owned_conversation(server: &MockServer, enc: &FieldEncryption) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/conversations"))
            .and(query_param("id", "eq.c1"))
            .and(query_param("user_id", format!("eq.{USER}")))
            .and(query_param("status", "neq.deleted"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([conversation_row(enc, "c1", "Planning")])),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn create_conversation_encrypts_title_and_adds_system_turn() {
        let server = MockServer::start().await;
        let enc = encryption();

        Mock::given(method("GET"))
            .and(path("/rest/v1/system_prompts"))
            .and(query_param("id", "eq.p1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"content": "You are helpful."}])),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/conversations"))
            .and(body_partial_json(json!({"user_id": USER, "system_prompt_id": "p1"})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!([conversation_row(&enc, "c1", "Planning")])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/conversation_turns"))
            .and(body_partial_json(json!({"conversation_id": "c1", "role": "system"})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!([turn_row(&enc, "t0", "system", "You are helpful.")])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let conversation = service(&server, Arc::clone(&enc))
            .create_conversation(USER, "  Planning ", Some("p1"))
            .await
            .unwrap();

        assert_eq!(conversation.title, "Planning");
        assert_eq!(conversation.turns.len(), 1);
        assert_eq!(conversation.turns[0].content, "You are helpful.");

        let requests = server.received_requests().await.unwrap();
        let insert = requests
            .iter()
            .find(|r| r.url.path() == "/rest/v1/conversations")
            .unwrap();
        let body: Value = serde_json::from_slice(&insert.body).unwrap();
        let stored_title = body["title"].as_str().unwrap();
        assert!(stored_title.starts_with("ENC:"));
        assert_eq!(enc.decrypt_field(stored_title).unwrap(), "Planning");
    }

    #[tokio::test]
    async fn create_conversation_rejects_empty_title() {
        let server = MockServer::start().await;
        let result = service(&server, encryption())
            .create_conversation(USER, "   ", None)
            .await;
        assert!(matches!(result, Err(ServerError::Validation(_))));
    }

    #[tokio::test]
    async fn unknown_prompt_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/system_prompts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let result = service(&server, encryption())
            .create_conversation(USER, "Title", Some("missing"))
            .await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn get_conversation_of_other_user_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let result = service(&server, encryption())
            .get_conversation("c1", "intruder")
            .await;
        assert!(matches!(result, Err(ServerError::NotFound(ref what)) if what == "conversation"));
    }

    #[tokio::test]
    async fn get_conversation_decrypts_turns() {
        let server = MockServer::start().await;
        let enc = encryption();
        mount_owned_conversation(&server, &enc).await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/conversation_turns"))
            .and(query_param("order", "created_at.asc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                turn_row(&enc, "t1", "user", "Hello"),
                turn_row(&enc, "t2", "assistant", "Hi there"),
            ])))
            .mount(&server)
            .await;

        let conversation = service(&server, Arc::clone(&enc))
            .get_conversation("c1", USER)
            .await
            .unwrap();

        assert_eq!(conversation.title, "Planning");
        let contents: Vec<_> = conversation.turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["Hello", "Hi there"]);
    }

    #[tokio::test]
    async fn list_conversations_builds_summaries() {
        let server = MockServer::start().await;
        let enc = encryption();

        let mut with_turns = conversation_row(&enc, "c1", "Weekly sync");
        with_turns["turn_count"] = json!([{"count": 4}]);
        with_turns["last_turn"] = json!([{"content": enc.encrypt_field("See you Monday").unwrap()}]);
        let mut empty = conversation_row(&enc, "c2", "Fresh start");
        empty["turn_count"] = json!([{"count": 0}]);
        empty["last_turn"] = json!([]);

        Mock::given(method("GET"))
            .and(path("/rest/v1/conversations"))
            .and(query_param("select", SUMMARY_SELECT))
            .and(query_param("status", "neq.deleted"))
            .and(query_param("order", "updated_at.desc"))
            .and(query_param("last_turn.role", "neq.system"))
            .and(query_param("last_turn.order", "created_at.desc"))
            .and(query_param("last_turn.limit", "1"))
            .and(header("Range", "0-9"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Range", "0-1/12")
                    .set_body_json(json!([with_turns, empty])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let page = service(&server, Arc::clone(&enc))
            .list_conversations(USER, None, PageRequest::default())
            .await
            .unwrap();

        assert_eq!(page.total, 12);
        assert!(page.has_more);
        let summary = &page.items[0];
        assert_eq!(summary.title, "Weekly sync");
        assert_eq!(summary.turn_count, 4);
        assert_eq!(summary.last_message.as_deref(), Some("See you Monday"));

        assert_eq!(page.items[1].turn_count, 0);
        assert!(page.items[1].last_message.is_none());

        // One request for the whole page, however many rows it holds.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_conversation_refuses_deleted_status() {
        let server = MockServer::start().await;
        let enc = encryption();
        mount_owned_conversation(&server, &enc).await;

        let update = ConversationUpdate {
            status: Some(ConversationStatus::Deleted),
            ..Default::default()
        };
        let result = service(&server, enc)
            .update_conversation("c1", USER, update)
            .await;

        assert!(matches!(result, Err(ServerError::Validation(_))));
    }

    #[tokio::test]
    async fn delete_conversation_is_soft() {
        let server = MockServer::start().await;
        let enc = encryption();
        mount_owned_conversation(&server, &enc).await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/conversations"))
            .and(query_param("id", "eq.c1"))
            .and(body_partial_json(json!({"status": "deleted"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        service(&server, enc)
            .delete_conversation("c1", USER)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn add_turn_uploads_audio_and_touches_conversation() {
        let server = MockServer::start().await;
        let enc = encryption();
        mount_owned_conversation(&server, &enc).await;

        Mock::given(method("POST"))
            .and(wiremock::matchers::path_regex(
                r"^/storage/v1/object/audio/conversations/c1/[0-9a-f-]+\.mp3$",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Key": "k"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/conversation_turns"))
            .and(body_partial_json(json!({"conversation_id": "c1", "role": "user"})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!([turn_row(&enc, "t1", "user", "Hello")])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let turn = service(&server, Arc::clone(&enc))
            .add_turn(
                "c1",
                USER,
                NewTurn {
                    role: TurnRole::User,
                    content: "Hello".into(),
                    audio: Some(vec![1, 2, 3]),
                },
            )
            .await
            .unwrap();

        assert_eq!(turn.content, "Hello");

        let requests = server.received_requests().await.unwrap();
        let insert = requests
            .iter()
            .find(|r| r.url.path() == "/rest/v1/conversation_turns")
            .unwrap();
        let body: Value = serde_json::from_slice(&insert.body).unwrap();
        let audio_url = body["audio_url"].as_str().unwrap();
        assert!(audio_url.contains("/storage/v1/object/public/audio/conversations/c1/"));
        assert!(audio_url.ends_with(&format!("{}.mp3", body["id"].as_str().unwrap())));
    }

    #[tokio::test]
    async fn turn_in_foreign_conversation_is_not_found() {
        let server = MockServer::start().await;
        let enc = encryption();

        Mock::given(method("GET"))
            .and(path("/rest/v1/conversation_turns"))
            .and(query_param("id", "eq.t1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([turn_row(&enc, "t1", "user", "secret")])),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let result = service(&server, enc).get_turn("t1", "intruder").await;
        assert!(matches!(result, Err(ServerError::NotFound(ref what)) if what == "turn"));
    }

    #[tokio::test]
    async fn delete_turn_removes_row_and_audio() {
        let server = MockServer::start().await;
        let enc = encryption();
        mount_owned_conversation(&server, &enc).await;

        let mut row = turn_row(&enc, "t1", "user", "Hello");
        row["audio_url"] = json!(format!(
            "{}/storage/v1/object/public/audio/conversations/c1/t1.mp3",
            server.uri()
        ));

        Mock::given(method("GET"))
            .and(path("/rest/v1/conversation_turns"))
            .and(query_param("id", "eq.t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([row])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/conversation_turns"))
            .and(query_param("id", "eq.t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/object/audio"))
            .and(body_partial_json(json!({"prefixes": ["conversations/c1/t1.mp3"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        service(&server, enc).delete_turn("t1", USER).await.unwrap();
    }

    #[tokio::test]
    async fn list_turns_paginates() {
        let server = MockServer::start().await;
        let enc = encryption();
        mount_owned_conversation(&server, &enc).await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/conversation_turns"))
            .and(header("Range", "2-3"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "2-3/4")
                    .set_body_json(json!([
                        turn_row(&enc, "t3", "user", "three"),
                        turn_row(&enc, "t4", "assistant", "four"),
                    ])),
            )
            .mount(&server)
            .await;

        let page = service(&server, enc)
            .list_turns("c1", USER, PageRequest::new(Some(2), Some(2)))
            .await
            .unwrap();

        assert_eq!(page.total, 4);
        assert!(!page.has_more);
        assert_eq!(page.items[1].content, "four");
    }
}
