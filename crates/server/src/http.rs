//! HTTP endpoints
//!
//! REST API for the memory service. All payload timestamps must carry an
//! explicit UTC offset; naive datetimes are rejected with 400 rather than
//! silently localized.

use axum::{
    extract::{Json, OriginalUri, Path, Query, State},
    http::{HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Router,
};
use chatmem_cache::BufferCache;
use chatmem_core::{
    ConversationMeta, GroupProfile, MemoryScope, RawMessage, RecordType, RetrievalMode, Scene,
    TimeRange,
};
use chatmem_pipeline::{DeliveryStatus, PipelineError, ProcessOutcome};
use chatmem_retrieval::{AgenticRequest, RetrievalError, SearchRequest};
use chatmem_storage::{DeleteFilter, SortOrder, StorageError};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics::metrics_handler;
use crate::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors_layer = build_cors_layer(
        &state.settings.server.cors_origins,
        state.settings.server.cors_enabled,
    );

    Router::new()
        // Memory endpoints
        .route(
            "/api/v1/memories",
            post(memorize).get(fetch_memories).delete(delete_memories),
        )
        .route("/api/v1/memories/search", get(search_memories))
        .route("/api/v1/memories/:event_id", delete(delete_memory))
        .route("/api/v1/memories/conversation-meta", post(save_conversation_meta))
        .route("/api/v1/memories/conversation-meta", patch(patch_conversation_meta))
        .route("/api/v1/memories/conversation-meta", get(get_conversation_meta))
        // Profile aggregates (version-tagged)
        .route("/api/v1/profiles", post(upsert_profile))
        // Agentic endpoints
        .route("/api/v1/agentic/retrieve_lightweight", post(retrieve_lightweight))
        .route("/api/v1/agentic/retrieve_agentic", post(retrieve_agentic))
        // Observability and buffer operations
        .route("/api/v1/queues", get(queue_stats))
        .route(
            "/api/v1/buffers/:group_id",
            get(buffer_stats).delete(clear_buffer),
        )
        .route("/api/v1/buffers/:group_id/trim", post(trim_buffer))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Build the CORS layer from configured origins
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();

    if parsed.is_empty() {
        tracing::info!("no valid CORS origins configured, restricting to localhost");
        return CorsLayer::new()
            .allow_origin("http://localhost:3000".parse::<HeaderValue>().expect("static origin"))
            .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers(Any)
}

// ---------------------------------------------------------------------------
// Error envelope

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorCode {
    InvalidParameter,
    ResourceNotFound,
    SystemError,
}

impl ErrorCode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
            Self::SystemError => "SYSTEM_ERROR",
        }
    }
}

/// API error rendered as the uniform failure envelope
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
    path: String,
}

impl ApiError {
    fn invalid(uri: &Uri, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: ErrorCode::InvalidParameter,
            message: message.into(),
            path: uri.path().to_string(),
        }
    }

    fn not_found(uri: &Uri, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: ErrorCode::ResourceNotFound,
            message: message.into(),
            path: uri.path().to_string(),
        }
    }

    fn system(uri: &Uri, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: ErrorCode::SystemError,
            message: message.into(),
            path: uri.path().to_string(),
        }
    }

    fn overloaded(uri: &Uri) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: ErrorCode::SystemError,
            message: "dispatcher over capacity, retry later".into(),
            path: uri.path().to_string(),
        }
    }

    fn from_retrieval(uri: &Uri, err: RetrievalError) -> Self {
        match err {
            RetrievalError::InvalidRequest(msg) => Self::invalid(uri, msg),
            other => Self::system(uri, other.to_string()),
        }
    }

    fn from_storage(uri: &Uri, err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => Self::not_found(uri, msg),
            StorageError::InvalidFilter(msg) => Self::invalid(uri, msg),
            other => Self::system(uri, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "failed",
            "code": self.code.as_str(),
            "message": self.message,
            "timestamp": Utc::now().to_rfc3339(),
            "path": self.path,
        });
        (self.status, Json(body)).into_response()
    }
}

fn ok_envelope(message: &str, result: serde_json::Value) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": message,
        "result": result,
    }))
}

// ---------------------------------------------------------------------------
// Memorize

#[derive(Debug, Deserialize)]
struct MemorizeBody {
    message_id: String,
    create_time: String,
    sender: String,
    #[serde(default)]
    group_id: String,
    #[serde(default)]
    group_name: String,
    #[serde(default)]
    sender_name: Option<String>,
    content: String,
    #[serde(default)]
    refer_list: Vec<String>,
    #[serde(default)]
    scene: Option<String>,
}

/// Parse the wire message, rejecting naive timestamps
fn parse_message(uri: &Uri, body: MemorizeBody) -> Result<RawMessage, ApiError> {
    if body.message_id.trim().is_empty() {
        return Err(ApiError::invalid(uri, "message_id is required"));
    }
    if body.sender.trim().is_empty() {
        return Err(ApiError::invalid(uri, "sender is required"));
    }
    if body.content.is_empty() {
        return Err(ApiError::invalid(uri, "content is required"));
    }

    let timestamp = DateTime::parse_from_rfc3339(&body.create_time).map_err(|_| {
        ApiError::invalid(
            uri,
            "create_time must be ISO-8601 with an explicit UTC offset",
        )
    })?;

    let scene = match body.scene.as_deref() {
        None | Some("") | Some("assistant") => Scene::Assistant,
        Some("group_chat") => Scene::GroupChat,
        Some(other) => {
            return Err(ApiError::invalid(
                uri,
                format!("unknown scene: {other}"),
            ))
        }
    };

    Ok(RawMessage {
        message_id: body.message_id,
        group_id: body.group_id,
        group_name: body.group_name,
        sender_id: body.sender,
        sender_name: body.sender_name,
        content: body.content,
        timestamp,
        refer_list: body.refer_list,
        scene,
    })
}

/// POST /api/v1/memories
async fn memorize(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<MemorizeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let message = parse_message(&uri, body)?;
    tracing::debug!(message_id = %message.message_id, group = message.routing_key(), "memorize request");

    let receiver = match state.dispatcher.deliver(message) {
        DeliveryStatus::Accepted(rx) => rx,
        DeliveryStatus::Rejected => return Err(ApiError::overloaded(&uri)),
    };

    let timeout = Duration::from_secs(state.settings.server.memorize_timeout_s);
    let outcome = tokio::time::timeout(timeout, receiver)
        .await
        .map_err(|_| ApiError::system(&uri, "memorize timed out"))?
        .map_err(|_| ApiError::system(&uri, PipelineError::WorkerGone.to_string()))?
        .map_err(|e| ApiError::system(&uri, e.to_string()))?;

    let response = match outcome {
        ProcessOutcome::Accumulated => ok_envelope(
            "Message queued, awaiting boundary detection",
            json!({
                "saved_memories": [],
                "count": 0,
                "status_info": "accumulated",
            }),
        ),
        ProcessOutcome::Extracted { event_ids } => ok_envelope(
            &format!("Extracted {} memories", event_ids.len()),
            json!({
                "saved_memories": event_ids,
                "count": event_ids.len(),
                "status_info": "extracted",
            }),
        ),
    };
    Ok(response)
}

// ---------------------------------------------------------------------------
// Fetch

#[derive(Debug, Deserialize)]
struct FetchParams {
    user_id: String,
    #[serde(default)]
    memory_type: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    sort_order: Option<String>,
    #[serde(default)]
    version_start: Option<String>,
    #[serde(default)]
    version_end: Option<String>,
}

/// GET /api/v1/memories — reads the document store directly
async fn fetch_memories(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<FetchParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if params.user_id.is_empty() {
        return Err(ApiError::invalid(&uri, "user_id is required"));
    }

    let limit = params.limit.unwrap_or(40).clamp(1, 500);
    let offset = params.offset.unwrap_or(0);
    let memory_type = params.memory_type.as_deref().unwrap_or("multiple");

    if memory_type == "profile" || memory_type == "group_profile" {
        let range = if params.version_start.is_some() || params.version_end.is_some() {
            Some((params.version_start.clone(), params.version_end.clone()))
        } else {
            None
        };
        let versions = state
            .profiles
            .list_versions(
                &params.user_id,
                params.group_id.as_deref().unwrap_or(""),
                range,
            )
            .await
            .map_err(|e| ApiError::from_storage(&uri, e))?;

        let total_count = versions.len();
        let page: Vec<_> = versions.into_iter().skip(offset).take(limit).collect();
        let has_more = offset + page.len() < total_count;

        return Ok(ok_envelope(
            "memories fetched",
            json!({
                "memories": page,
                "total_count": total_count,
                "has_more": has_more,
                "metadata": {
                    "source": "profile_store",
                    "user_id": params.user_id,
                    "memory_type": memory_type,
                },
            }),
        ));
    }

    let record_type = match memory_type {
        "multiple" | "all" | "" => None,
        "episode_memory" | "episode" => Some(RecordType::Episode),
        "conversation" | "base_memory" => Some(RecordType::Conversation),
        "document" => Some(RecordType::Document),
        other => {
            return Err(ApiError::invalid(
                &uri,
                format!("unknown memory_type: {other}"),
            ))
        }
    };

    let sort = SortOrder::parse(params.sort_order.as_deref().unwrap_or("desc"));
    let page = state
        .records
        .fetch_page(&params.user_id, record_type, limit, offset, sort)
        .await
        .map_err(|e| ApiError::from_storage(&uri, e))?;

    Ok(ok_envelope(
        "memories fetched",
        json!({
            "memories": page.records,
            "total_count": page.total_count,
            "has_more": page.has_more,
            "metadata": {
                "source": "document_store",
                "user_id": params.user_id,
                "memory_type": memory_type,
            },
        }),
    ))
}

// ---------------------------------------------------------------------------
// Deletes (three-backend fan-out)

/// DELETE /api/v1/memories/{event_id}
async fn delete_memory(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(event_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let found = state
        .writer
        .delete_by_event_id(&event_id)
        .await
        .map_err(|e| ApiError::from_storage(&uri, e))?;

    if !found {
        return Err(ApiError::not_found(
            &uri,
            format!("memory {event_id} does not exist"),
        ));
    }

    Ok(ok_envelope(
        "memory deleted",
        json!({ "event_id": event_id }),
    ))
}

#[derive(Debug, Deserialize)]
struct DeleteBody {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    time_range: Option<TimeRange>,
}

/// DELETE /api/v1/memories — bulk delete by scope and time range. At least
/// one of user_id/group_id is required; a blank filter never wipes data.
async fn delete_memories(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<DeleteBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let filter = DeleteFilter {
        user_id: body.user_id.filter(|u| !u.is_empty()),
        group_id: body.group_id.filter(|g| !g.is_empty()),
        start_ms: body
            .time_range
            .and_then(|r| r.start)
            .map(|t| t.timestamp_millis()),
        end_ms: body
            .time_range
            .and_then(|r| r.end)
            .map(|t| t.timestamp_millis()),
    };

    let deleted = state
        .writer
        .delete_by_filters(&filter)
        .await
        .map_err(|e| ApiError::from_storage(&uri, e))?;

    Ok(ok_envelope(
        "memories deleted",
        json!({ "deleted_count": deleted }),
    ))
}

// ---------------------------------------------------------------------------
// Search

#[derive(Debug, Deserialize)]
struct SearchBody {
    #[serde(default)]
    query: String,
    user_id: String,
    #[serde(default)]
    top_k: Option<usize>,
    /// Accepted for compatibility; the service serves one data source
    #[serde(default)]
    #[allow(dead_code)]
    data_source: Option<String>,
    #[serde(default)]
    memory_scope: Option<MemoryScope>,
    #[serde(default)]
    retrieval_mode: Option<RetrievalMode>,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    time_range: Option<TimeRange>,
    #[serde(default)]
    current_time: Option<DateTime<FixedOffset>>,
}

fn search_request(state: &AppState, body: SearchBody) -> SearchRequest {
    SearchRequest {
        query: body.query,
        user_id: body.user_id,
        group_id: body.group_id,
        scope: body.memory_scope.unwrap_or_default(),
        mode: body.retrieval_mode.unwrap_or_default(),
        top_k: body
            .top_k
            .unwrap_or(state.settings.retrieval.default_top_k),
        time_range: body.time_range,
        current_time: body.current_time,
    }
}

/// GET /api/v1/memories/search
async fn search_memories(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<SearchBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.user_id.is_empty() {
        return Err(ApiError::invalid(&uri, "user_id is required"));
    }

    let request = search_request(&state, body);
    let response = state
        .retriever
        .search(&request)
        .await
        .map_err(|e| ApiError::from_retrieval(&uri, e))?;

    let total_count = response.results.len();
    Ok(ok_envelope(
        "memories retrieved",
        json!({
            "memories": response.results,
            "importance_scores": response.results.iter().map(|r| r.score).collect::<Vec<_>>(),
            "total_count": total_count,
            "has_more": false,
            "metadata": response.metadata,
        }),
    ))
}

/// POST /api/v1/agentic/retrieve_lightweight — single-pass hybrid search
async fn retrieve_lightweight(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<SearchBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.user_id.is_empty() {
        return Err(ApiError::invalid(&uri, "user_id is required"));
    }

    let request = search_request(&state, body);
    let response = state
        .retriever
        .search(&request)
        .await
        .map_err(|e| ApiError::from_retrieval(&uri, e))?;

    Ok(ok_envelope(
        "memories retrieved",
        json!({
            "memories": response.results,
            "metadata": response.metadata,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct AgenticBody {
    query: String,
    user_id: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    time_range_days: Option<i64>,
    #[serde(default)]
    current_time: Option<DateTime<FixedOffset>>,
}

/// POST /api/v1/agentic/retrieve_agentic — two-round LLM-judged retrieval
async fn retrieve_agentic(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<AgenticBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.user_id.is_empty() {
        return Err(ApiError::invalid(&uri, "user_id is required"));
    }
    if body.query.trim().is_empty() {
        return Err(ApiError::invalid(&uri, "query is required"));
    }

    let request = AgenticRequest {
        query: body.query,
        user_id: body.user_id,
        group_id: body.group_id,
        top_k: body
            .top_k
            .unwrap_or(state.settings.retrieval.default_top_k),
        time_range_days: body.time_range_days,
        current_time: body.current_time,
    };

    let response = state
        .agentic
        .search(&request)
        .await
        .map_err(|e| ApiError::from_retrieval(&uri, e))?;

    Ok(ok_envelope(
        "memories retrieved",
        json!({
            "memories": response.results,
            "metadata": response.metadata,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Profiles

#[derive(Debug, Deserialize)]
struct ProfileBody {
    user_id: String,
    group_id: String,
    version: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// POST /api/v1/profiles — upsert one profile version; `is_latest` is
/// re-normalized across the pair's versions by the store
async fn upsert_profile(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(body): Json<ProfileBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.user_id.is_empty() && body.group_id.is_empty() {
        return Err(ApiError::invalid(&uri, "user_id or group_id is required"));
    }
    if body.version.trim().is_empty() {
        return Err(ApiError::invalid(&uri, "version is required"));
    }

    let now = Utc::now();
    let profile = GroupProfile {
        user_id: body.user_id,
        group_id: body.group_id,
        version: body.version,
        is_latest: false,
        payload: body.payload,
        created_at: now,
        updated_at: now,
    };

    state
        .profiles
        .upsert_version(&profile)
        .await
        .map_err(|e| ApiError::from_storage(&uri, e))?;

    let latest = state
        .profiles
        .get_latest(&profile.user_id, &profile.group_id)
        .await
        .map_err(|e| ApiError::from_storage(&uri, e))?;

    Ok(ok_envelope(
        "profile version saved",
        json!({
            "user_id": profile.user_id,
            "group_id": profile.group_id,
            "version": profile.version,
            "latest_version": latest.map(|p| p.version),
        }),
    ))
}

// ---------------------------------------------------------------------------
// Conversation metadata

/// POST /api/v1/memories/conversation-meta — full upsert
async fn save_conversation_meta(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(meta): Json<ConversationMeta>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if meta.group_id.is_empty() {
        return Err(ApiError::invalid(&uri, "group_id is required"));
    }

    state
        .meta
        .upsert(&meta)
        .await
        .map_err(|e| ApiError::from_storage(&uri, e))?;

    Ok(ok_envelope(
        "conversation meta saved",
        json!({ "group_id": meta.group_id }),
    ))
}

/// PATCH /api/v1/memories/conversation-meta — partial update by group_id
async fn patch_conversation_meta(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Json(partial): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group_id = partial
        .get("group_id")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::invalid(&uri, "group_id is required"))?
        .to_string();

    let merged = state
        .meta
        .patch(&group_id, &partial)
        .await
        .map_err(|e| ApiError::from_storage(&uri, e))?;

    Ok(ok_envelope("conversation meta updated", json!(merged)))
}

#[derive(Debug, Deserialize)]
struct MetaQuery {
    group_id: String,
}

/// GET /api/v1/memories/conversation-meta?group_id=...
async fn get_conversation_meta(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<MetaQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if params.group_id.is_empty() {
        return Err(ApiError::invalid(&uri, "group_id is required"));
    }

    let meta = state
        .meta
        .get(&params.group_id)
        .await
        .map_err(|e| ApiError::from_storage(&uri, e))?
        .ok_or_else(|| {
            ApiError::not_found(
                &uri,
                format!("conversation meta {} does not exist", params.group_id),
            )
        })?;

    Ok(ok_envelope("conversation meta fetched", json!(meta)))
}

// ---------------------------------------------------------------------------
// Observability

fn buffer_key(group_id: &str) -> String {
    format!(
        "{}{group_id}",
        chatmem_config::constants::queue::BUFFER_KEY_PREFIX
    )
}

/// GET /api/v1/buffers/{group_id} — buffer queue statistics
async fn buffer_stats(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state
        .buffer
        .stats(&buffer_key(&group_id))
        .await
        .map_err(|e| ApiError::system(&uri, e.to_string()))?;

    Ok(ok_envelope(
        "buffer stats",
        json!({
            "group_id": group_id,
            "total_count": stats.total_count,
            "max_length": stats.max_length,
            "oldest_score": stats.oldest_score,
            "newest_score": stats.newest_score,
            "ttl_seconds": stats.ttl_seconds,
            "is_full": stats.is_full,
        }),
    ))
}

/// POST /api/v1/buffers/{group_id}/trim — force the length bound
async fn trim_buffer(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state
        .buffer
        .trim_excess(&buffer_key(&group_id))
        .await
        .map_err(|e| ApiError::system(&uri, e.to_string()))?;

    Ok(ok_envelope(
        "buffer trimmed",
        json!({ "group_id": group_id, "removed_count": removed }),
    ))
}

/// DELETE /api/v1/buffers/{group_id} — drop a group's buffered messages
async fn clear_buffer(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    Path(group_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let existed = state
        .buffer
        .clear(&buffer_key(&group_id))
        .await
        .map_err(|e| ApiError::system(&uri, e.to_string()))?;

    Ok(ok_envelope(
        "buffer cleared",
        json!({ "group_id": group_id, "existed": existed }),
    ))
}

/// GET /api/v1/queues — dispatcher queue counters
async fn queue_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "result": {
            "in_flight": state.dispatcher.in_flight(),
            "queues": state.dispatcher.queue_stats(),
        },
    }))
}

/// GET /health — liveness
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": format!("{:?}", state.settings.environment),
        "in_flight": state.dispatcher.in_flight(),
    }))
}

/// GET /ready — readiness incl. LLM backend connectivity
async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let llm_url = format!(
        "{}/models",
        state.settings.llm.base_url.trim_end_matches('/')
    );

    let llm_status = match tokio::time::timeout(
        Duration::from_secs(2),
        reqwest::get(&llm_url),
    )
    .await
    {
        Ok(Ok(resp)) if resp.status().is_success() => "ok",
        Ok(Ok(_)) => "error",
        Ok(Err(_)) => "unreachable",
        Err(_) => "timeout",
    };

    let ready = llm_status == "ok";
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checks": {
                "llm_backend": { "status": llm_status, "url": llm_url },
                "dispatcher": { "in_flight": state.dispatcher.in_flight() },
            },
        })),
    )
}
