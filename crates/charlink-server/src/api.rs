use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use charlink_client::feed::filter_for;
use charlink_client::{CharacterCreator, CharacterDraft, ConversationOrchestrator, ConversationView};
use charlink_net::ImageHost;
use charlink_prompt::SystemInstructionTemplate;
use charlink_shared::constants::{FEED_ALL, SEARCH_LIMIT};
use charlink_shared::error::require_text;
use charlink_shared::{
    Character, CharacterId, ConversationKey, Counter, Message, MessageId, UserId,
};
use charlink_store::{MessageLog, PersonaStore, ViewSide};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{ServerConfig, StoreBackend};
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::sessions::SessionRegistry;

/// Header carrying the caller's user id.  Authentication happens upstream.
pub const USER_HEADER: &str = "x-user-id";

/// Multipart framing allowance on top of the avatar limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub personas: Arc<dyn PersonaStore>,
    pub log: Arc<dyn MessageLog>,
    /// `None` disables character creation.
    pub images: Option<Arc<dyn ImageHost>>,
    pub sessions: Arc<SessionRegistry>,
    pub template: SystemInstructionTemplate,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
    pub replies_enabled: bool,
    pub started_at: DateTime<Utc>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let body_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD;

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/characters", get(list_characters).post(create_character))
        .route("/characters/:id", get(get_character))
        .route("/conversations/:character_id/start", post(start_conversation))
        .route(
            "/conversations/:character_id/messages",
            get(get_messages).post(send_message),
        )
        .route("/conversations/:character_id/quick-reply", post(send_quick_reply))
        .route(
            "/conversations/:character_id/messages/:message_id",
            delete(delete_message),
        )
        .route(
            "/admin/system-instruction",
            get(get_system_instruction).put(put_system_instruction),
        )
        .route("/admin/system-instruction/reset", post(reset_system_instruction))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    store: &'static str,
    replies_enabled: bool,
    creation_enabled: bool,
    history_window: usize,
    active_sessions: usize,
    rate_limited_clients: usize,
    uptime_secs: i64,
}

#[derive(Deserialize)]
struct ListQuery {
    /// Feed label: "All", "New", "Trending", "Popular" or a category.
    filter: Option<String>,
    q: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SendRequest {
    text: String,
    #[serde(default = "default_true")]
    reply: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct QuickReplyRequest {
    emoji: String,
}

#[derive(Serialize)]
struct SendResponse {
    message: Message,
    reply: Option<Message>,
}

#[derive(Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    for_everyone: bool,
}

#[derive(Serialize)]
struct TemplateResponse {
    text: String,
    revision: u64,
    is_default: bool,
}

#[derive(Deserialize)]
struct TemplateUpdate {
    text: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn user_from(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(UserId::new)
}

fn require_user(headers: &HeaderMap) -> Result<UserId, ServerError> {
    user_from(headers).ok_or(ServerError::MissingUser)
}

/// The character, if it exists and `viewer` may see it.  Hidden characters
/// are reported as missing.
async fn visible_character(
    state: &AppState,
    id: &CharacterId,
    viewer: Option<&UserId>,
) -> Result<Character, ServerError> {
    let anonymous = UserId::new("");
    let viewer = viewer.unwrap_or(&anonymous);
    match state.personas.get(id).await? {
        Some(character) if character.can_view(viewer) => Ok(character),
        _ => Err(ServerError::NotFound(format!("character {id}"))),
    }
}

/// The user's orchestrator, subscribed to `character_id` with the
/// character's persona.
async fn conversation_for(
    state: &AppState,
    user: &UserId,
    character_id: &CharacterId,
) -> Result<Arc<ConversationOrchestrator>, ServerError> {
    let session = state.sessions.get_or_create(user).await;
    if session.current_character().as_ref() == Some(character_id) {
        return Ok(session);
    }

    let character = visible_character(state, character_id, Some(user)).await?;
    session
        .start_conversation(character_id, Some(character.persona))
        .await?;
    if let Err(e) = state.personas.increment(character_id, Counter::Chats).await {
        warn!(character = %character_id, error = %e, "failed to count chat");
    }
    Ok(session)
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    use subtle::ConstantTimeEq;

    let Some(expected) = config.admin_token.as_deref() else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
        .as_bytes();

    // ct_eq on slices of different length is already false.
    if presented.ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        store: match state.config.store_backend {
            StoreBackend::Memory => "memory",
            StoreBackend::Sqlite => "sqlite",
        },
        replies_enabled: state.replies_enabled,
        creation_enabled: state.images.is_some(),
        history_window: state.config.history_window,
        active_sessions: state.sessions.len().await,
        rate_limited_clients: state.rate_limiter.tracked_clients().await,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

// ---------------------------------------------------------------------------
// Characters
// ---------------------------------------------------------------------------

async fn list_characters(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Character>>, ServerError> {
    let label = query.filter.as_deref().unwrap_or(FEED_ALL);
    let (filter, default_limit) = filter_for(label, query.q.as_deref().map(str::trim));
    let limit = query.limit.unwrap_or(default_limit).min(SEARCH_LIMIT);

    let characters = state.personas.query(&filter, limit).await?;
    debug!(?filter, limit, count = characters.len(), "characters listed");
    Ok(Json(characters))
}

async fn get_character(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Character>, ServerError> {
    let id = CharacterId::new(id);
    let viewer = user_from(&headers);
    let character = visible_character(&state, &id, viewer.as_ref()).await?;

    if let Err(e) = state.personas.increment(&id, Counter::Views).await {
        warn!(character = %id, error = %e, "failed to count view");
    }
    Ok(Json(character))
}

async fn create_character(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Character>), ServerError> {
    let owner = require_user(&headers)?;
    let Some(images) = state.images.clone() else {
        return Err(ServerError::Unavailable("Image host (IMGBB_API_KEY)"));
    };

    let mut draft = CharacterDraft::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "avatar" {
            let data: Bytes = field
                .bytes()
                .await
                .map_err(|e| ServerError::BadRequest(format!("Failed to read avatar: {e}")))?;
            draft.avatar = Some(data);
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field {name}: {e}")))?;
        match name.as_str() {
            "name" => draft.name = value,
            "age" => draft.age = value,
            "gender" => draft.gender = value,
            "traits" => draft
                .traits
                .extend(value.split(',').map(|t| t.trim().to_string())),
            "background" => draft.background = value,
            "address_as" => draft.address_as = value,
            "private" => draft.private = matches!(value.trim(), "true" | "1" | "on"),
            other => debug!(field = other, "ignoring unknown form field"),
        }
    }

    let creator = CharacterCreator::new(state.personas.clone(), images)
        .with_max_avatar_bytes(state.config.max_upload_bytes);
    let character = creator.create(&owner, draft).await?;

    info!(owner = %owner, character = %character.id, "Character created via API");
    Ok((StatusCode::CREATED, Json(character)))
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

async fn start_conversation(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(character_id): Path<String>,
) -> Result<Json<ConversationView>, ServerError> {
    let user = require_user(&headers)?;
    let character_id = CharacterId::new(character_id);
    let session = conversation_for(&state, &user, &character_id).await?;
    Ok(Json(session.view()))
}

async fn get_messages(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(character_id): Path<String>,
) -> Result<Json<ConversationView>, ServerError> {
    let user = require_user(&headers)?;
    let character_id = CharacterId::new(character_id);

    if let Some(session) = state.sessions.get(&user).await {
        if session.current_character().as_ref() == Some(&character_id) {
            return Ok(Json(session.view()));
        }
    }

    // Not the live conversation: read once without subscribing.
    let key = ConversationKey::new(user, character_id);
    let order = state.sessions.order();
    let messages = state.log.snapshot(&key, ViewSide::Owner, order).await?;
    Ok(Json(ConversationView {
        messages: Arc::from(messages),
        ..ConversationView::default()
    }))
}

async fn send_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(character_id): Path<String>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, ServerError> {
    let user = require_user(&headers)?;
    let character_id = CharacterId::new(character_id);
    require_text("Message", &req.text)?;

    let session = conversation_for(&state, &user, &character_id).await?;
    let outcome = session
        .send_message(&req.text, &character_id, req.reply)
        .await?;
    Ok(Json(SendResponse {
        message: outcome.message,
        reply: outcome.reply,
    }))
}

async fn send_quick_reply(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(character_id): Path<String>,
    Json(req): Json<QuickReplyRequest>,
) -> Result<Json<SendResponse>, ServerError> {
    let user = require_user(&headers)?;
    let character_id = CharacterId::new(character_id);
    require_text("Quick reply", &req.emoji)?;

    let session = conversation_for(&state, &user, &character_id).await?;
    let outcome = session.send_quick_reply(&req.emoji, &character_id).await?;
    Ok(Json(SendResponse {
        message: outcome.message,
        reply: outcome.reply,
    }))
}

async fn delete_message(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((character_id, message_id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user = require_user(&headers)?;
    let message_id = MessageId::parse(&message_id)
        .map_err(|e| ServerError::BadRequest(format!("Invalid message id: {e}")))?;

    let session = state.sessions.get_or_create(&user).await;
    let deleted = session
        .delete_message(&CharacterId::new(character_id), message_id, query.for_everyone)
        .await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

// ---------------------------------------------------------------------------
// Admin
// ---------------------------------------------------------------------------

fn template_response(template: &SystemInstructionTemplate) -> TemplateResponse {
    let snapshot = template.snapshot();
    TemplateResponse {
        text: snapshot.text.to_string(),
        revision: snapshot.revision,
        is_default: template.is_default(),
    }
}

async fn get_system_instruction(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<TemplateResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(template_response(&state.template)))
}

async fn put_system_instruction(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<TemplateUpdate>,
) -> Result<Json<TemplateResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let revision = state.template.set(req.text)?;
    info!(revision, "System instruction replaced");
    Ok(Json(template_response(&state.template)))
}

async fn reset_system_instruction(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<TemplateResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let revision = state.template.reset_to_default();
    info!(revision, "System instruction reset to default");
    Ok(Json(template_response(&state.template)))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
