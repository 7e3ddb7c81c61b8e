//! HTTP API for the VoiceHub server.
//!
//! # Routes
//!
//! - `GET /health` - Liveness and Supabase reachability
//! - `/auth/*` - Registration, login, token refresh, logout, password reset
//! - `/auth/api-keys` - API key generation, listing, rotation and revocation
//! - `/conversations`, `/turns/{id}` - Conversation and turn CRUD
//! - `/search/*` - Full-text search and suggestions
//! - `POST /voice/token` - LiveKit room tokens
//! - `/storage/files` - User file upload, listing and deletion
//! - `/admin/*` - Prompts, users, metrics (requires the `admin` scope)
//!
//! # Authentication
//!
//! Protected handlers take an [`AuthUser`] or [`AdminUser`] extractor, which
//! validates the `Authorization: Bearer` access token. Admin routes answer
//! 403 when the token lacks the `admin` scope.
//!
//! Conversation, search, voice and storage handlers take a [`Caller`]
//! instead, which also accepts an `X-API-Key` header carrying a key with the
//! `user` scope. Account and key management always need an access token.
//!
//! # Rate limiting
//!
//! Every route except `/health` goes through an IP-keyed `api` limit that
//! sets `X-RateLimit-*` headers and answers 429 with `Retry-After` once the
//! budget is spent. The key is the TCP peer address; `X-Forwarded-For` is
//! read only when the peer is listed in `VOICEHUB_TRUSTED_PROXIES`.
//!
//! # Example
//!
//! ```rust,no_run
//! use voicehub_server::config::Config;
//! use voicehub_server::routes::{create_router, AppState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config).expect("failed to build state");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Path, Query, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::admin::{AdminService, NewPrompt, PromptUpdate};
use crate::api_keys::{ApiKeyInfo, ApiKeyService, IssuedApiKey, NewApiKey, HEADER_API_KEY};
use crate::auth::{AuthResponse, AuthService};
use crate::config::Config;
use crate::conversation::{ConversationService, ConversationUpdate, NewTurn};
use crate::encryption::FieldEncryption;
use crate::error::{Result, ServerError};
use crate::jwt::{Claims, JwtAuthManager, JwtConfig, TokenPair, TokenType};
use crate::rate_limit::{LimitType, RateLimiter};
use crate::revocation::TokenRevocationStore;
use crate::search::{SearchParams, SearchService};
use crate::storage::StorageService;
use crate::supabase::SupabaseClient;
use crate::types::{
    Conversation, ConversationMetrics, ConversationStatus, ConversationSummary, FileInfo,
    MetricsPeriod, PageRequest, Paginated, PromptCategory, SearchResults, SystemPrompt, Turn,
    TurnRole, TurnSearchHit, User, UserRole, UserStatus, UserSummary, VoiceToken, SCOPE_ADMIN,
    SCOPE_USER,
};
use crate::voice::VoiceService;

// ============================================================================
// Constants
// ============================================================================

/// Maximum request body size (10 MB); audio and files travel base64-encoded.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Header carrying the client address; honoured only from trusted proxies.
const HEADER_FORWARDED_FOR: &str = "X-Forwarded-For";

/// Client key used when no address is known.
const UNKNOWN_CLIENT: &str = "unknown";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Every service is cheap to clone; clones share the same Supabase client,
/// token manager and rate limiter.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub supabase: Arc<SupabaseClient>,
    pub jwt: Arc<JwtAuthManager>,
    pub rate_limiter: RateLimiter,
    pub auth: AuthService,
    pub conversations: ConversationService,
    pub search: SearchService,
    pub storage: StorageService,
    pub voice: VoiceService,
    pub admin: AdminService,
    pub api_keys: ApiKeyService,
    /// Server start time for uptime reporting.
    pub start_time: Instant,
}

impl AppState {
    /// Builds all services from the configuration.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be created or the field encryption
    /// key is unusable.
    pub fn new(config: Config) -> Result<Self> {
        let supabase = Arc::new(
            SupabaseClient::new(&config.supabase_url, &config.supabase_anon_key)?
                .with_service_key(&config.supabase_service_key),
        );

        let revocations = TokenRevocationStore::new(config.refresh_token_ttl);
        let jwt = Arc::new(JwtAuthManager::new(
            JwtConfig {
                secret: config.jwt_secret.clone(),
                access_token_ttl: config.access_token_ttl,
                refresh_token_ttl: config.refresh_token_ttl,
            },
            revocations,
        ));

        let rate_limiter = RateLimiter::new(config.rate_limit_salt.clone());
        let encryption = Arc::new(FieldEncryption::from_config(
            config.field_encryption_key.as_ref(),
        )?);

        let storage = StorageService::new(
            Arc::clone(&supabase),
            config.audio_bucket.clone(),
            config.files_bucket.clone(),
        );
        let conversations = ConversationService::new(
            Arc::clone(&supabase),
            Arc::clone(&encryption),
            storage.clone(),
        );

        Ok(Self {
            auth: AuthService::new(Arc::clone(&supabase), Arc::clone(&jwt), rate_limiter.clone()),
            search: SearchService::new(Arc::clone(&supabase), encryption),
            voice: VoiceService::new(
                config.livekit.clone(),
                conversations.clone(),
                rate_limiter.clone(),
            ),
            admin: AdminService::new(Arc::clone(&supabase), Arc::clone(&jwt)),
            api_keys: ApiKeyService::new(Arc::clone(&supabase)),
            conversations,
            storage,
            config: Arc::new(config),
            supabase,
            jwt,
            rate_limiter,
            start_time: Instant::now(),
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("jwt", &self.jwt)
            .field("rate_limiter", &self.rate_limiter)
            .field("voice_enabled", &self.voice.is_enabled())
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/logout-all", post(logout_all))
        .route("/auth/me", get(me))
        .route("/auth/password-reset", post(request_password_reset))
        .route("/auth/password-reset/confirm", post(confirm_password_reset))
        .route("/auth/api-keys", get(list_api_keys).post(create_api_key))
        .route("/auth/api-keys/{id}", delete(revoke_api_key))
        .route("/auth/api-keys/{id}/rotate", post(rotate_api_key))
        .route("/conversations", get(list_conversations).post(create_conversation))
        .route(
            "/conversations/{id}",
            get(get_conversation)
                .patch(update_conversation)
                .delete(delete_conversation),
        )
        .route("/conversations/{id}/turns", get(list_turns).post(add_turn))
        .route(
            "/turns/{id}",
            get(get_turn).patch(update_turn).delete(delete_turn),
        )
        .route("/search/conversations", post(search_conversations))
        .route("/search/turns", post(search_turns))
        .route("/search/suggestions", get(search_suggestions))
        .route("/voice/token", post(voice_token))
        .route(
            "/storage/files",
            get(list_files).post(upload_file).delete(delete_file),
        )
        .route("/admin/users", get(admin_list_users))
        .route("/admin/users/{id}/role", patch(admin_update_role))
        .route("/admin/users/{id}/status", patch(admin_update_status))
        .route("/admin/prompts", get(admin_list_prompts).post(admin_create_prompt))
        .route("/admin/prompts/default", get(admin_default_prompt))
        .route(
            "/admin/prompts/{id}",
            get(admin_get_prompt)
                .patch(admin_update_prompt)
                .delete(admin_delete_prompt),
        )
        .route("/admin/prompts/{id}/default", post(admin_set_default_prompt))
        .route("/admin/metrics", get(admin_metrics))
        .route("/admin/revocations/cleanup", post(admin_cleanup_revocations))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api_rate_limit,
        ));

    Router::new()
        .merge(api)
        .route("/health", get(get_health))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Extractors
// ============================================================================

/// Client address used for rate limiting.
///
/// This is the TCP peer address. When the peer is one of the configured
/// trusted proxies, the nearest `X-Forwarded-For` hop that is not itself a
/// trusted proxy is used instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Infallible> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        Ok(Self(client_ip(
            &parts.headers,
            peer,
            &state.config.trusted_proxies,
        )))
    }
}

fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trusted_proxies: &[IpAddr]) -> String {
    let Some(peer) = peer else {
        return UNKNOWN_CLIENT.to_string();
    };

    if !trusted_proxies.contains(&peer) {
        return peer.to_string();
    }

    let Some(forwarded) = headers
        .get(HEADER_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    else {
        return peer.to_string();
    };

    // Proxies append, so walk from the right.
    for hop in forwarded.rsplit(',') {
        match hop.trim().parse::<IpAddr>() {
            Ok(ip) if trusted_proxies.contains(&ip) => continue,
            Ok(ip) => return ip.to_string(),
            Err(_) => break,
        }
    }

    peer.to_string()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Caller authenticated by a valid access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub claims: Claims,
}

impl AuthUser {
    pub fn id(&self) -> &str {
        &self.claims.sub
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ServerError::auth("missing bearer token"))?;
        let claims = state.jwt.validate_token(token, &[], TokenType::Access)?;
        Ok(Self { claims })
    }
}

/// Caller of the data routes: an access token or an API key.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
}

impl Caller {
    pub fn id(&self) -> &str {
        &self.user_id
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        if let Some(token) = bearer_token(&parts.headers) {
            let claims = state.jwt.validate_token(token, &[], TokenType::Access)?;
            return Ok(Self {
                user_id: claims.sub,
            });
        }

        let api_key = parts
            .headers
            .get(HEADER_API_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ServerError::auth("missing bearer token"))?;

        let key = state
            .api_keys
            .validate_api_key(api_key, &[SCOPE_USER])
            .await?;
        Ok(Self {
            user_id: key.user_id,
        })
    }
}

/// Caller whose access token carries the `admin` scope.
#[derive(Debug, Clone)]
pub struct AdminUser {
    pub claims: Claims,
}

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| ServerError::auth("missing bearer token"))?;
        let claims = state
            .jwt
            .validate_token(token, &[SCOPE_ADMIN], TokenType::Access)?;
        Ok(Self { claims })
    }
}

// ============================================================================
// Middleware
// ============================================================================

async fn api_rate_limit(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    request: Request,
    next: Next,
) -> Response {
    let result = state
        .rate_limiter
        .check_ip_rate_limit(&ip, LimitType::Api, true)
        .await;

    let mut response = match result.retry_after() {
        Some(retry_after) => {
            ServerError::rate_limit(LimitType::Api.as_str(), retry_after).into_response()
        }
        None => next.run(request).await,
    };

    for (name, value) in result.info().headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, value);
        }
    }

    response
}

// ============================================================================
// Request types
// ============================================================================

/// Query string for `GET /auth/api-keys`.
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeyListQuery {
    #[serde(default)]
    pub include_expired: bool,
}

/// Query string for paginated listings.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl PageQuery {
    fn page(&self) -> PageRequest {
        PageRequest::new(self.page, self.page_size)
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetConfirmRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct ConversationListQuery {
    pub status: Option<ConversationStatus>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub title: String,
    #[serde(default)]
    pub system_prompt_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddTurnRequest {
    pub role: TurnRole,
    pub content: String,
    /// Base64-encoded audio recording.
    #[serde(default)]
    pub audio: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTurnRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct SuggestionQuery {
    pub q: String,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct VoiceTokenRequest {
    pub conversation_id: String,
    #[serde(default)]
    pub participant_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadFileRequest {
    pub filename: String,
    /// Base64-encoded file content.
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct UserListQuery {
    pub status: Option<UserStatus>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: UserRole,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: UserStatus,
}

#[derive(Debug, Deserialize)]
pub struct PromptListQuery {
    pub category: Option<PromptCategory>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CategoryQuery {
    #[serde(default)]
    pub category: PromptCategory,
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub period: MetricsPeriod,
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(value.trim())
        .map_err(|_| ServerError::validation(format!("{field} must be valid base64")))
}

// ============================================================================
// GET /health
// ============================================================================

/// Response body for the health check.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when Supabase is unreachable.
    pub status: String,
    pub supabase: bool,
    pub voice_enabled: bool,
    pub uptime_seconds: u64,
}

async fn get_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let supabase = match state.supabase.health().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Supabase health check failed");
            false
        }
    };

    let (status, label) = if supabase {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            supabase,
            voice_enabled: state.voice.is_enabled(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
        }),
    )
}

// ============================================================================
// /auth
// ============================================================================

async fn register(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let response = state
        .auth
        .register(&body.email, &body.password, &body.full_name, &ip)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(body): Json<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    Ok(Json(state.auth.login(&body.email, &body.password, &ip).await?))
}

async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<TokenPair>> {
    Ok(Json(state.auth.refresh(&body.refresh_token).await?))
}

/// The body is optional; an empty body only revokes the access token.
async fn logout(State(state): State<AppState>, user: AuthUser, body: Bytes) -> Result<StatusCode> {
    let request: LogoutRequest = if body.is_empty() {
        LogoutRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ServerError::validation(format!("invalid request body: {e}")))?
    };

    state
        .auth
        .logout(&user.claims, request.refresh_token.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn logout_all(State(state): State<AppState>, user: AuthUser) -> Result<StatusCode> {
    state.auth.logout_all(user.id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn me(State(state): State<AppState>, user: AuthUser) -> Result<Json<User>> {
    Ok(Json(state.auth.current_user(user.id()).await?))
}

async fn request_password_reset(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(body): Json<PasswordResetRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    state.auth.request_password_reset(&body.email, &ip).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "If an account exists for this address, a reset link has been sent"
        })),
    ))
}

async fn confirm_password_reset(
    State(state): State<AppState>,
    Json(body): Json<PasswordResetConfirmRequest>,
) -> Result<StatusCode> {
    state
        .auth
        .confirm_password_reset(&body.token, &body.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// /auth/api-keys
// ============================================================================

async fn list_api_keys(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ApiKeyListQuery>,
) -> Result<Json<Vec<ApiKeyInfo>>> {
    Ok(Json(
        state
            .api_keys
            .list_api_keys(user.id(), query.include_expired)
            .await?,
    ))
}

async fn create_api_key(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<NewApiKey>,
) -> Result<(StatusCode, Json<IssuedApiKey>)> {
    let issued = state
        .api_keys
        .generate_api_key(user.id(), &user.claims.scopes, body)
        .await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn revoke_api_key(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state
        .api_keys
        .revoke_api_key(&id, user.id(), user.claims.has_scope(SCOPE_ADMIN))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rotate_api_key(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<IssuedApiKey>)> {
    let issued = state
        .api_keys
        .rotate_api_key(&id, user.id(), user.claims.has_scope(SCOPE_ADMIN))
        .await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

// ============================================================================
// /conversations and /turns
// ============================================================================

async fn list_conversations(
    State(state): State<AppState>,
    user: Caller,
    Query(query): Query<ConversationListQuery>,
) -> Result<Json<Paginated<ConversationSummary>>> {
    let page = PageRequest::new(query.page, query.page_size);
    Ok(Json(
        state
            .conversations
            .list_conversations(user.id(), query.status, page)
            .await?,
    ))
}

async fn create_conversation(
    State(state): State<AppState>,
    user: Caller,
    Json(body): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>)> {
    let conversation = state
        .conversations
        .create_conversation(user.id(), &body.title, body.system_prompt_id.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_conversation(
    State(state): State<AppState>,
    user: Caller,
    Path(id): Path<String>,
) -> Result<Json<Conversation>> {
    Ok(Json(state.conversations.get_conversation(&id, user.id()).await?))
}

async fn update_conversation(
    State(state): State<AppState>,
    user: Caller,
    Path(id): Path<String>,
    Json(body): Json<ConversationUpdate>,
) -> Result<Json<Conversation>> {
    Ok(Json(
        state
            .conversations
            .update_conversation(&id, user.id(), body)
            .await?,
    ))
}

async fn delete_conversation(
    State(state): State<AppState>,
    user: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.conversations.delete_conversation(&id, user.id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_turns(
    State(state): State<AppState>,
    user: Caller,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Paginated<Turn>>> {
    Ok(Json(
        state
            .conversations
            .list_turns(&id, user.id(), query.page())
            .await?,
    ))
}

async fn add_turn(
    State(state): State<AppState>,
    user: Caller,
    Path(id): Path<String>,
    Json(body): Json<AddTurnRequest>,
) -> Result<(StatusCode, Json<Turn>)> {
    let audio = body
        .audio
        .as_deref()
        .map(|audio| decode_base64("audio", audio))
        .transpose()?;

    let turn = state
        .conversations
        .add_turn(
            &id,
            user.id(),
            NewTurn {
                role: body.role,
                content: body.content,
                audio,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(turn)))
}

async fn get_turn(
    State(state): State<AppState>,
    user: Caller,
    Path(id): Path<String>,
) -> Result<Json<Turn>> {
    Ok(Json(state.conversations.get_turn(&id, user.id()).await?))
}

async fn update_turn(
    State(state): State<AppState>,
    user: Caller,
    Path(id): Path<String>,
    Json(body): Json<UpdateTurnRequest>,
) -> Result<Json<Turn>> {
    Ok(Json(
        state
            .conversations
            .update_turn(&id, user.id(), &body.content)
            .await?,
    ))
}

async fn delete_turn(
    State(state): State<AppState>,
    user: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.conversations.delete_turn(&id, user.id()).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// /search
// ============================================================================

async fn search_conversations(
    State(state): State<AppState>,
    user: Caller,
    Json(params): Json<SearchParams>,
) -> Result<Json<SearchResults<ConversationSummary>>> {
    Ok(Json(
        state.search.search_conversations(user.id(), &params).await?,
    ))
}

async fn search_turns(
    State(state): State<AppState>,
    user: Caller,
    Json(params): Json<SearchParams>,
) -> Result<Json<SearchResults<TurnSearchHit>>> {
    Ok(Json(state.search.search_turns(user.id(), &params).await?))
}

async fn search_suggestions(
    State(state): State<AppState>,
    user: Caller,
    Query(query): Query<SuggestionQuery>,
) -> Result<Json<Vec<String>>> {
    Ok(Json(
        state
            .search
            .get_search_suggestions(user.id(), &query.q, query.limit)
            .await?,
    ))
}

// ============================================================================
// /voice
// ============================================================================

async fn voice_token(
    State(state): State<AppState>,
    user: Caller,
    Json(body): Json<VoiceTokenRequest>,
) -> Result<Json<VoiceToken>> {
    let name = body.participant_name.as_deref().unwrap_or(user.id());
    Ok(Json(
        state
            .voice
            .create_room_token(user.id(), &body.conversation_id, name)
            .await?,
    ))
}

// ============================================================================
// /storage
// ============================================================================

async fn list_files(State(state): State<AppState>, user: Caller) -> Result<Json<Vec<FileInfo>>> {
    Ok(Json(state.storage.list_user_files(user.id()).await?))
}

async fn upload_file(
    State(state): State<AppState>,
    user: Caller,
    Json(body): Json<UploadFileRequest>,
) -> Result<(StatusCode, Json<FileInfo>)> {
    let bytes = decode_base64("content", &body.content)?;
    let info = state
        .storage
        .upload_file(user.id(), &body.filename, bytes, body.content_type.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

async fn delete_file(
    State(state): State<AppState>,
    user: Caller,
    Query(query): Query<FileQuery>,
) -> Result<StatusCode> {
    state.storage.delete_file(user.id(), &query.name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// /admin
// ============================================================================

async fn admin_list_users(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<UserListQuery>,
) -> Result<Json<Paginated<UserSummary>>> {
    let page = PageRequest::new(query.page, query.page_size);
    Ok(Json(state.admin.list_users(query.status, page).await?))
}

async fn admin_update_role(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
    Json(body): Json<RoleRequest>,
) -> Result<Json<User>> {
    debug!(admin_id = %admin.claims.sub, user_id = %id, "Admin role change");
    Ok(Json(state.admin.update_user_role(&id, body.role).await?))
}

async fn admin_update_status(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
    Json(body): Json<StatusRequest>,
) -> Result<Json<User>> {
    debug!(admin_id = %admin.claims.sub, user_id = %id, "Admin status change");
    Ok(Json(state.admin.update_user_status(&id, body.status).await?))
}

async fn admin_list_prompts(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<PromptListQuery>,
) -> Result<Json<Paginated<SystemPrompt>>> {
    let page = PageRequest::new(query.page, query.page_size);
    Ok(Json(state.admin.list_prompts(query.category, page).await?))
}

async fn admin_create_prompt(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(body): Json<NewPrompt>,
) -> Result<(StatusCode, Json<SystemPrompt>)> {
    let prompt = state.admin.create_prompt(&admin.claims.sub, body).await?;
    Ok((StatusCode::CREATED, Json(prompt)))
}

async fn admin_default_prompt(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<CategoryQuery>,
) -> Result<Json<SystemPrompt>> {
    state
        .admin
        .get_default_prompt(query.category)
        .await?
        .map(Json)
        .ok_or_else(|| ServerError::not_found("default prompt"))
}

async fn admin_get_prompt(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> Result<Json<SystemPrompt>> {
    Ok(Json(state.admin.get_prompt(&id).await?))
}

async fn admin_update_prompt(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
    Json(body): Json<PromptUpdate>,
) -> Result<Json<SystemPrompt>> {
    Ok(Json(state.admin.update_prompt(&id, body).await?))
}

async fn admin_delete_prompt(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.admin.delete_prompt(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_set_default_prompt(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> Result<Json<SystemPrompt>> {
    Ok(Json(state.admin.set_default_prompt(&id).await?))
}

async fn admin_metrics(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<ConversationMetrics>> {
    Ok(Json(state.admin.conversation_metrics(query.period).await?))
}

async fn admin_cleanup_revocations(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Json<serde_json::Value> {
    let removed = state.admin.cleanup_revocations();
    Json(json!({ "removed": removed }))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LiveKitConfig;
    use crate::rate_limit::{HEADER_LIMIT, HEADER_REMAINING};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;
    use crate::api_keys::hash_key;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "routes-test-secret-with-at-least-32-bytes";

    fn test_state(server: &MockServer) -> AppState {
        AppState::new(Config::new(server.uri(), "anon", SECRET)).unwrap()
    }

    fn token_for(state: &AppState, role: UserRole) -> String {
        state
            .jwt
            .create_token_pair("user-1", &role.scopes())
            .unwrap()
            .access_token
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok_when_supabase_answers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let response = create_router(test_state(&server))
            .oneshot(get("/health", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(HEADER_LIMIT).is_none());

        let health: HealthResponse = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(health.status, "ok");
        assert!(health.supabase);
        assert!(!health.voice_enabled);
    }

    #[tokio::test]
    async fn health_is_degraded_without_supabase() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let response = create_router(test_state(&server))
            .oneshot(get("/health", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], "degraded");
    }

    #[tokio::test]
    async fn protected_route_requires_bearer_token() {
        let server = MockServer::start().await;

        let response = create_router(test_state(&server))
            .oneshot(get("/auth/me", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "unauthorized");
    }

    #[tokio::test]
    async fn refresh_token_is_not_accepted_as_access_token() {
        let server = MockServer::start().await;
        let state = test_state(&server);
        let refresh = state
            .jwt
            .create_token_pair("user-1", &UserRole::User.scopes())
            .unwrap()
            .refresh_token;

        let response = create_router(state)
            .oneshot(get("/conversations", Some(&refresh)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_routes_need_admin_scope() {
        let server = MockServer::start().await;
        let state = test_state(&server);
        let token = token_for(&state, UserRole::User);

        let response = create_router(state)
            .oneshot(get("/admin/metrics", Some(&token)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    fn with_api_key(uri: &str, key: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(HEADER_API_KEY, key)
            .body(Body::empty())
            .unwrap()
    }

    async fn mount_api_key(server: &MockServer, key: &str) {
        Mock::given(method("GET"))
            .and(path("/rest/v1/api_keys"))
            .and(query_param("key_hash", format!("eq.{}", hash_key(key))))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": "k1",
                "user_id": "user-1",
                "name": "CI upload",
                "key_prefix": "vhk_AAAAAAAA",
                "scopes": ["user"],
                "expires_at": chrono::Utc::now() + chrono::Duration::days(1),
                "is_active": true,
                "owner": {"status": "active"}
            }])))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn api_key_reaches_conversation_routes() {
        let server = MockServer::start().await;
        let key = "vhk_BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";
        mount_api_key(&server, key).await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/conversations"))
            .and(query_param("user_id", "eq.user-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let response = create_router(test_state(&server))
            .oneshot(with_api_key("/conversations", key))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["total"], 0);
    }

    #[tokio::test]
    async fn unknown_api_key_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/api_keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let response = create_router(test_state(&server))
            .oneshot(with_api_key(
                "/conversations",
                "vhk_CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC",
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn api_keys_cannot_manage_api_keys() {
        let server = MockServer::start().await;
        let key = "vhk_DDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDD";
        mount_api_key(&server, key).await;

        let response = create_router(test_state(&server))
            .oneshot(with_api_key("/auth/api-keys", key))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn creating_an_api_key_returns_it_once() {
        let server = MockServer::start().await;
        let state = test_state(&server);
        let token = token_for(&state, UserRole::User);
        Mock::given(method("GET"))
            .and(path("/rest/v1/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": "user-1"}])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/api_keys"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([{
                "id": "k9",
                "user_id": "user-1",
                "name": "API Key",
                "key_prefix": "vhk_xxxxxxxx",
                "scopes": ["user"],
                "expires_at": chrono::Utc::now() + chrono::Duration::days(30),
                "is_active": true
            }])))
            .mount(&server)
            .await;

        let response = create_router(state)
            .oneshot(post_json("/auth/api-keys", Some(&token), json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["id"], "k9");
        assert!(body["api_key"].as_str().unwrap().starts_with("vhk_"));
        assert!(body.get("key_hash").is_none());
    }

    #[tokio::test]
    async fn user_token_cannot_mint_admin_keys() {
        let server = MockServer::start().await;
        let state = test_state(&server);
        let token = token_for(&state, UserRole::User);

        let response = create_router(state)
            .oneshot(post_json(
                "/auth/api-keys",
                Some(&token),
                json!({"scopes": ["admin"]}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_can_trigger_revocation_cleanup() {
        let server = MockServer::start().await;
        let state = test_state(&server);
        let token = token_for(&state, UserRole::Admin);

        let response = create_router(state)
            .oneshot(post_json("/admin/revocations/cleanup", Some(&token), json!({})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["removed"], 0);
    }

    #[tokio::test]
    async fn api_routes_carry_rate_limit_headers_and_answer_429() {
        let server = MockServer::start().await;
        let state = test_state(&server);
        state
            .rate_limiter
            .update_limit(LimitType::Api, Duration::from_secs(60), 2)
            .await;
        let app = create_router(state);

        let first = app.clone().oneshot(get("/auth/me", None)).await.unwrap();
        assert_eq!(first.headers()[HEADER_LIMIT], "2");
        assert_eq!(first.headers()[HEADER_REMAINING], "1");

        app.clone().oneshot(get("/auth/me", None)).await.unwrap();

        let limited = app.oneshot(get("/auth/me", None)).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().contains_key("Retry-After"));
    }

    #[tokio::test]
    async fn logout_revokes_the_access_token() {
        let server = MockServer::start().await;
        let state = test_state(&server);
        let token = token_for(&state, UserRole::User);
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/logout")
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(get("/auth/me", Some(&token))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_conversation_returns_created() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/conversations"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([{
                "id": "c1",
                "user_id": "user-1",
                "title": "stored",
                "status": "active",
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z"
            }])))
            .mount(&server)
            .await;

        let state = test_state(&server);
        let token = token_for(&state, UserRole::User);

        let response = create_router(state)
            .oneshot(post_json(
                "/conversations",
                Some(&token),
                json!({"title": "Weekly sync"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["id"], "c1");

        let requests = server.received_requests().await.unwrap();
        let stored: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(stored["user_id"], "user-1");
        assert_ne!(stored["title"], "Weekly sync");
    }

    #[tokio::test]
    async fn invalid_audio_encoding_is_bad_request() {
        let server = MockServer::start().await;
        let state = test_state(&server);
        let token = token_for(&state, UserRole::User);

        let response = create_router(state)
            .oneshot(post_json(
                "/conversations/c1/turns",
                Some(&token),
                json!({"role": "user", "content": "hi", "audio": "***"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn voice_token_without_livekit_is_unavailable() {
        let server = MockServer::start().await;
        let state = test_state(&server);
        let token = token_for(&state, UserRole::User);

        let response = create_router(state)
            .oneshot(post_json(
                "/voice/token",
                Some(&token),
                json!({"conversation_id": "c1"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn voice_token_is_issued_for_owned_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": "c1",
                "user_id": "user-1",
                "title": "Call",
                "status": "active",
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z"
            }])))
            .mount(&server)
            .await;

        let mut config = Config::new(server.uri(), "anon", SECRET);
        config.livekit = Some(LiveKitConfig {
            url: "wss://voice.example.com".into(),
            api_key: "key".into(),
            api_secret: "secret".into(),
        });
        let state = AppState::new(config).unwrap();
        let token = token_for(&state, UserRole::User);

        let response = create_router(state)
            .oneshot(post_json(
                "/voice/token",
                Some(&token),
                json!({"conversation_id": "c1", "participant_name": "Ada"}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["room"], "conv-c1");
        assert_eq!(body["url"], "wss://voice.example.com");
    }

    fn ip(value: &str) -> IpAddr {
        value.parse().unwrap()
    }

    #[test]
    fn client_ip_uses_peer_address_by_default() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, None, &[]), UNKNOWN_CLIENT);
        assert_eq!(client_ip(&headers, Some(ip("10.0.0.1")), &[]), "10.0.0.1");

        headers.insert(
            HEADER_FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.7"),
        );
        assert_eq!(client_ip(&headers, Some(ip("10.0.0.1")), &[]), "10.0.0.1");
        assert_eq!(client_ip(&headers, None, &[ip("10.0.0.1")]), UNKNOWN_CLIENT);
    }

    #[test]
    fn client_ip_reads_forwarded_for_from_trusted_proxies() {
        let proxies = [ip("10.0.0.1"), ip("10.0.0.2")];
        let mut headers = HeaderMap::new();

        assert_eq!(client_ip(&headers, Some(ip("10.0.0.1")), &proxies), "10.0.0.1");

        headers.insert(
            HEADER_FORWARDED_FOR,
            HeaderValue::from_static("198.51.100.1, 203.0.113.7, 10.0.0.2"),
        );
        assert_eq!(
            client_ip(&headers, Some(ip("10.0.0.1")), &proxies),
            "203.0.113.7"
        );

        headers.insert(HEADER_FORWARDED_FOR, HeaderValue::from_static("garbage"));
        assert_eq!(client_ip(&headers, Some(ip("10.0.0.1")), &proxies), "10.0.0.1");
    }

    #[tokio::test]
    async fn rotating_forwarded_for_does_not_reset_the_auth_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })))
            .mount(&server)
            .await;

        let app = create_router(test_state(&server));
        let peer = SocketAddr::from(([192, 0, 2, 10], 40_000));

        let mut statuses = Vec::new();
        for i in 0..6 {
            let mut request = post_json(
                "/auth/login",
                None,
                json!({"email": "ada@example.com", "password": "Wrong-Pass-1"}),
            );
            request
                .headers_mut()
                .insert(HEADER_FORWARDED_FOR, format!("10.{i}.0.1").parse().unwrap());
            request.extensions_mut().insert(ConnectInfo(peer));

            statuses.push(app.clone().oneshot(request).await.unwrap().status());
        }

        assert_eq!(&statuses[..5], &[StatusCode::UNAUTHORIZED; 5]);
        assert_eq!(statuses[5], StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }

    #[test]
    fn app_state_debug_hides_secrets() {
        let state = AppState::new(Config::new("http://localhost:54321", "anon", SECRET)).unwrap();
        let debug = format!("{state:?}");
        assert!(!debug.contains(SECRET));
    }
}
