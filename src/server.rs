//! HTTP surface and push channel.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat/message` | Answer a question (blocking) |
//! | `POST` | `/chat/message/stream` | Answer as an SSE frame stream |
//! | `POST` | `/chat/conversation` | Allocate a conversation id |
//! | `GET`  | `/chat/history/{conversationId}` | Chronological turns |
//! | `POST` | `/sync/{source}` | Start a sync, returns the sync id |
//! | `GET`  | `/sync/status/{syncId}` | Sync log for one run |
//! | `GET`  | `/sync/history` | Recent sync logs |
//! | `POST` | `/embedding/generate` | Run one embedding batch |
//! | `GET`  | `/embedding/status` | Coverage counters |
//! | `GET`  | `/embedding/stats` | Coverage plus recent cost rows |
//! | `POST` | `/embedding/reprocess` | Flag listed documents and drain |
//! | `POST` | `/embedding/mark-pending` | Flag documents for re-embedding |
//! | `GET`  | `/embedding/diagnose` | Inconsistent embedding state |
//! | `GET`  | `/ws` | Push channel (progress events) |
//! | `GET`  | `/health` | Liveness |
//!
//! All JSON responses use the `{ success, data?, error? }` envelope.
//! Invalid input maps to 4xx, internal failures to 5xx; streaming requests
//! emit a final `error` frame and close.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderValue, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, TimeZone};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::bus::ProgressBus;
use crate::chat::ChatService;
use crate::config::Config;
use crate::embed_pipeline::EmbeddingPipeline;
use crate::error::{RecallError, Result as RecallResult};
use crate::models::DocumentSource;
use crate::store::DocumentStore;
use crate::sync::{SyncCoordinator, SyncMode};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: DocumentStore,
    pub coordinator: Arc<SyncCoordinator>,
    pub pipeline: Arc<EmbeddingPipeline>,
    pub chat: Arc<ChatService>,
    pub bus: ProgressBus,
    /// Root token cancelled at shutdown; request-scoped work derives from it.
    pub shutdown: CancellationToken,
}

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/chat/message", post(handle_chat_message))
        .route("/chat/message/stream", post(handle_chat_stream))
        .route("/chat/conversation", post(handle_new_conversation))
        .route("/chat/history/{conversation_id}", get(handle_chat_history))
        .route("/sync/{source}", post(handle_start_sync))
        .route("/sync/status/{sync_id}", get(handle_sync_status))
        .route("/sync/history", get(handle_sync_history))
        .route("/embedding/generate", post(handle_embedding_generate))
        .route("/embedding/status", get(handle_embedding_status))
        .route("/embedding/stats", get(handle_embedding_stats))
        .route("/embedding/reprocess", post(handle_embedding_reprocess))
        .route("/embedding/mark-pending", post(handle_embedding_mark_pending))
        .route("/embedding/diagnose", get(handle_embedding_diagnose))
        .route("/ws", get(handle_ws_upgrade))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .server
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// ============ response envelope ============

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

/// Error wrapper converting [`RecallError`] into the envelope with the
/// right status code. Internal details are logged, not exposed.
struct AppError(RecallError);

impl From<RecallError> for AppError {
    fn from(e: RecallError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            RecallError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
            RecallError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            RecallError::Duplicate(m) => (StatusCode::CONFLICT, m.clone()),
            RecallError::RateLimited { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "upstream rate limit, try again shortly".to_string(),
            ),
            RecallError::Cancelled => {
                (StatusCode::SERVICE_UNAVAILABLE, "request cancelled".to_string())
            }
            other => {
                warn!(error = %other, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };

        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

fn default_user() -> String {
    "default".to_string()
}

// ============ chat ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    message: String,
    conversation_id: Option<String>,
    #[serde(default = "default_user")]
    user_id: String,
}

async fn handle_chat_message(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> ApiResult<impl IntoResponse> {
    let cancel = state.shutdown.child_token();
    let outcome = state
        .chat
        .handle_message(&body.user_id, &body.message, body.conversation_id, &cancel)
        .await?;
    Ok(ok(outcome))
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> ApiResult<impl IntoResponse> {
    let cancel = state.shutdown.child_token();
    let rx = state
        .chat
        .handle_message_stream(&body.user_id, &body.message, body.conversation_id, cancel)
        .await?;

    let stream = ReceiverStream::new(rx)
        .map(|frame| {
            let payload =
                serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
            Ok::<Event, Infallible>(Event::default().data(payload))
        })
        .chain(futures::stream::once(async {
            Ok(Event::default().data("[DONE]"))
        }));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewConversationRequest {
    #[serde(default = "default_user")]
    user_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewConversationResponse {
    conversation_id: String,
}

async fn handle_new_conversation(
    State(state): State<AppState>,
    body: Option<Json<NewConversationRequest>>,
) -> ApiResult<impl IntoResponse> {
    let user_id = body
        .map(|Json(b)| b.user_id)
        .unwrap_or_else(default_user);
    let conversation_id = state.chat.create_conversation(&user_id).await?;
    Ok(ok(NewConversationResponse { conversation_id }))
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<i64>,
}

async fn handle_chat_history(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<impl IntoResponse> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let turns = state.chat.history(&conversation_id, limit).await?;
    Ok(ok(turns))
}

// ============ sync ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSyncRequest {
    user_id: String,
    #[serde(default)]
    sync_type: Option<String>,
    since_date: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartSyncResponse {
    sync_id: String,
    status: &'static str,
}

async fn handle_start_sync(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Json(body): Json<StartSyncRequest>,
) -> ApiResult<impl IntoResponse> {
    let source = DocumentSource::parse(&source)?;
    let mode = match body.sync_type.as_deref() {
        None | Some("full") => SyncMode::Full,
        Some("incremental") => SyncMode::Incremental,
        Some(other) => {
            return Err(RecallError::validation(format!(
                "unknown syncType '{other}' (expected full or incremental)"
            ))
            .into())
        }
    };
    let since = body
        .since_date
        .as_deref()
        .map(parse_since_date)
        .transpose()?;

    let sync_id = state
        .coordinator
        .start_sync(
            &body.user_id,
            source,
            mode,
            since,
            state.shutdown.child_token(),
        )
        .await?;

    info!(sync_id, %source, user_id = %body.user_id, "sync started");
    Ok(ok(StartSyncResponse {
        sync_id,
        status: "running",
    }))
}

fn parse_since_date(raw: &str) -> RecallResult<chrono::DateTime<chrono::Utc>> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| RecallError::validation(format!("invalid sinceDate '{raw}'")))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| RecallError::validation("invalid sinceDate"))?;
    Ok(chrono::Utc.from_utc_datetime(&midnight))
}

async fn handle_sync_status(
    State(state): State<AppState>,
    Path(sync_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let log = state
        .store
        .get_sync_log(&sync_id)
        .await?
        .ok_or_else(|| RecallError::not_found(format!("sync {sync_id}")))?;
    Ok(ok(log))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncHistoryParams {
    user_id: Option<String>,
    source: Option<String>,
    limit: Option<i64>,
}

async fn handle_sync_history(
    State(state): State<AppState>,
    Query(params): Query<SyncHistoryParams>,
) -> ApiResult<impl IntoResponse> {
    let user_id = params.user_id.unwrap_or_else(default_user);
    let source = params
        .source
        .as_deref()
        .map(DocumentSource::parse)
        .transpose()?;
    let limit = params.limit.unwrap_or(20).clamp(1, 200);
    let logs = state.store.list_sync_logs(&user_id, source, limit).await?;
    Ok(ok(logs))
}

// ============ embedding ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    limit: Option<usize>,
}

async fn handle_embedding_generate(
    State(state): State<AppState>,
    body: Option<Json<GenerateRequest>>,
) -> ApiResult<impl IntoResponse> {
    let limit = body.and_then(|Json(b)| b.limit);
    let outcome = state.pipeline.process_pending(limit).await?;
    Ok(ok(serde_json::json!({
        "batchId": outcome.batch_id,
        "processed": outcome.processed,
        "failed": outcome.failed,
        "totalTokens": outcome.total_tokens,
    })))
}

async fn handle_embedding_status(
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let stats = state.store.embedding_stats().await?;
    Ok(ok(stats))
}

async fn handle_embedding_stats(
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let stats = state.store.embedding_stats().await?;
    let costs = state.store.list_embedding_costs(20).await?;
    Ok(ok(serde_json::json!({
        "coverage": stats,
        "recentRuns": costs,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReprocessRequest {
    document_ids: Vec<String>,
    #[serde(default = "default_user")]
    user_id: String,
}

async fn handle_embedding_reprocess(
    State(state): State<AppState>,
    Json(body): Json<ReprocessRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.document_ids.is_empty() {
        return Err(RecallError::validation("documentIds must not be empty").into());
    }
    let flagged = state
        .store
        .mark_for_reembedding(&body.user_id, Some(&body.document_ids))
        .await?;

    // Drain on a background task; progress lands on the bus.
    let pipeline = Arc::clone(&state.pipeline);
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        if let Err(e) = pipeline.drain_all_pending(None, &cancel).await {
            warn!(error = %e, "reprocess drain failed");
        }
    });

    Ok(ok(serde_json::json!({ "flagged": flagged, "status": "running" })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkPendingRequest {
    #[serde(default = "default_user")]
    user_id: String,
    document_ids: Option<Vec<String>>,
}

async fn handle_embedding_mark_pending(
    State(state): State<AppState>,
    body: Option<Json<MarkPendingRequest>>,
) -> ApiResult<impl IntoResponse> {
    let body = body.map(|Json(b)| b).unwrap_or(MarkPendingRequest {
        user_id: default_user(),
        document_ids: None,
    });
    let flagged = state
        .store
        .mark_for_reembedding(&body.user_id, body.document_ids.as_deref())
        .await?;
    Ok(ok(serde_json::json!({ "flagged": flagged })))
}

async fn handle_embedding_diagnose(
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let diagnoses = state
        .store
        .diagnose_embeddings(state.config.embedding.dimensions)
        .await?;
    Ok(ok(diagnoses))
}

// ============ push channel ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsParams {
    user_id: Option<String>,
}

async fn handle_ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let bus = state.bus.clone();
    let shutdown = state.shutdown.clone();
    upgrade.on_upgrade(move |socket| serve_ws(socket, bus, params.user_id, shutdown))
}

/// Forward bus events to one subscriber, filtered by user id. Lagged
/// subscribers skip missed events rather than blocking publishers.
async fn serve_ws(
    mut socket: WebSocket,
    bus: ProgressBus,
    user_id: Option<String>,
    shutdown: CancellationToken,
) {
    let mut events = bus.subscribe();
    debug!(?user_id, "push channel subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Some(filter) = &user_id {
                            if event.user_id.as_deref().is_some_and(|u| u != filter) {
                                continue;
                            }
                        }
                        let named = serde_json::json!({
                            "event": event.channel,
                            "scopeId": event.scope_id,
                            "timestamp": event.timestamp,
                            "data": event.payload,
                        });
                        let text = named.to_string();
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "push subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    debug!(?user_id, "push channel subscriber disconnected");
}

// ============ health ============

async fn handle_health() -> impl IntoResponse {
    ok(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}
