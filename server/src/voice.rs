//! LiveKit room access tokens for voice conversations.
//!
//! Each conversation maps to one LiveKit room, `conv-{conversation_id}`.
//! The server never talks to LiveKit itself; it only signs join tokens that
//! clients present to the LiveKit server.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::LiveKitConfig;
use crate::conversation::ConversationService;
use crate::error::{Result, ServerError};
use crate::rate_limit::{LimitType, RateLimitResult, RateLimiter};
use crate::types::VoiceToken;
use crate::validation::{validate_participant_name, validate_room_name};

/// Lifetime of a room token.
pub const ROOM_TOKEN_TTL: Duration = Duration::from_secs(6 * 3600);

/// LiveKit room name for a conversation.
pub fn room_name(conversation_id: &str) -> String {
    format!("conv-{conversation_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoGrant {
    room: String,
    room_join: bool,
    can_publish: bool,
    can_subscribe: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RoomClaims {
    iss: String,
    sub: String,
    name: String,
    nbf: i64,
    exp: i64,
    video: VideoGrant,
}

#[derive(Debug, Clone)]
pub struct VoiceService {
    livekit: Option<LiveKitConfig>,
    conversations: ConversationService,
    rate_limiter: RateLimiter,
}

impl VoiceService {
    pub fn new(
        livekit: Option<LiveKitConfig>,
        conversations: ConversationService,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            livekit,
            conversations,
            rate_limiter,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.livekit.is_some()
    }

    /// Issues a token for joining the room of one of the user's conversations.
    ///
    /// The participant identity is the user ID; `participant_name` is the
    /// display name shown to other participants.
    pub async fn create_room_token(
        &self,
        user_id: &str,
        conversation_id: &str,
        participant_name: &str,
    ) -> Result<VoiceToken> {
        let livekit = self
            .livekit
            .as_ref()
            .ok_or_else(|| ServerError::unavailable("voice is not configured"))?;

        if let RateLimitResult::Limited {
            retry_after_secs, ..
        } = self
            .rate_limiter
            .check_user_rate_limit(user_id, LimitType::Voice, true)
            .await
        {
            return Err(ServerError::rate_limit(
                LimitType::Voice.as_str(),
                retry_after_secs,
            ));
        }

        let name = validate_participant_name(participant_name)?;
        self.conversations
            .ensure_conversation_owned(conversation_id, user_id)
            .await?;

        let room = room_name(conversation_id);
        validate_room_name(&room)?;

        let now = Utc::now().timestamp();
        let claims = RoomClaims {
            iss: livekit.api_key.clone(),
            sub: user_id.to_string(),
            name,
            nbf: now,
            exp: now + ROOM_TOKEN_TTL.as_secs() as i64,
            video: VideoGrant {
                room: room.clone(),
                room_join: true,
                can_publish: true,
                can_subscribe: true,
            },
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(livekit.api_secret.as_bytes()),
        )
        .map_err(|e| ServerError::internal(format!("failed to sign room token: {e}")))?;

        info!(user_id = %user_id, room = %room, "Issued voice room token");

        Ok(VoiceToken {
            url: livekit.url.clone(),
            token,
            room,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FIELD_KEY_LEN;
    use crate::encryption::FieldEncryption;
    use crate::storage::StorageService;
    use crate::supabase::SupabaseClient;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const API_SECRET: &str = "livekit-secret";

    fn livekit() -> LiveKitConfig {
        LiveKitConfig {
            url: "wss://voice.example.com".into(),
            api_key: "lk-key".into(),
            api_secret: API_SECRET.into(),
        }
    }

    fn service(server: &MockServer, livekit: Option<LiveKitConfig>) -> VoiceService {
        let client = Arc::new(SupabaseClient::new(server.uri(), "anon").unwrap());
        let storage = StorageService::new(Arc::clone(&client), "audio", "files");
        let encryption = Arc::new(FieldEncryption::new(&[1u8; FIELD_KEY_LEN]).unwrap());
        let conversations = ConversationService::new(client, encryption, storage);
        VoiceService::new(livekit, conversations, RateLimiter::new("salt"))
    }

    async fn mount_conversation(server: &MockServer, rows: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/conversations"))
            .and(query_param("id", "eq.c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(rows))
            .mount(server)
            .await;
    }

    fn conversation_row() -> serde_json::Value {
        json!([{
            "id": "c1",
            "user_id": "user-1",
            "title": "Call",
            "status": "active",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        }])
    }

    #[tokio::test]
    async fn token_carries_room_grant() {
        let server = MockServer::start().await;
        mount_conversation(&server, conversation_row()).await;

        let token = service(&server, Some(livekit()))
            .create_room_token("user-1", "c1", "Ada")
            .await
            .unwrap();

        assert_eq!(token.room, "conv-c1");
        assert_eq!(token.url, "wss://voice.example.com");

        let claims = decode::<RoomClaims>(
            &token.token,
            &DecodingKey::from_secret(API_SECRET.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap()
        .claims;

        assert_eq!(claims.iss, "lk-key");
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.name, "Ada");
        assert_eq!(claims.exp - claims.nbf, 6 * 3600);
        assert!(claims.video.room_join && claims.video.can_publish && claims.video.can_subscribe);
    }

    #[test]
    fn video_grant_uses_camel_case() {
        let grant = VideoGrant {
            room: "conv-1".into(),
            room_join: true,
            can_publish: false,
            can_subscribe: true,
        };
        let value = serde_json::to_value(grant).unwrap();
        assert_eq!(value["roomJoin"], true);
        assert_eq!(value["canPublish"], false);
    }

    #[tokio::test]
    async fn unconfigured_voice_is_unavailable() {
        let server = MockServer::start().await;
        let voice = service(&server, None);

        assert!(!voice.is_enabled());
        let result = voice.create_room_token("user-1", "c1", "Ada").await;
        assert!(matches!(result, Err(ServerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn foreign_conversation_is_not_found() {
        let server = MockServer::start().await;
        mount_conversation(&server, json!([])).await;

        let result = service(&server, Some(livekit()))
            .create_room_token("user-2", "c1", "Eve")
            .await;
        assert!(matches!(result, Err(ServerError::NotFound(_))));
    }

    #[tokio::test]
    async fn token_requests_are_rate_limited_per_user() {
        let server = MockServer::start().await;
        mount_conversation(&server, conversation_row()).await;

        let voice = service(&server, Some(livekit()));
        for _ in 0..30 {
            voice.create_room_token("user-1", "c1", "Ada").await.unwrap();
        }

        let result = voice.create_room_token("user-1", "c1", "Ada").await;
        assert!(matches!(result, Err(ServerError::RateLimit { .. })));
    }
}
