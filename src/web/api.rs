// src/web/api.rs
// REST API handlers
//
// Every response carries `success` plus either the payload fields or an
// `error` string (validation errors also carry a `code`). Handler errors map
// through MemError: 400 validation, 403 feature-off, 404 missing, 429 rate
// limit, 500 otherwise.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::context::{ContextParams, build_context};
use crate::db::cleanup::{cleanup_project_sync, purge_sync};
use crate::db::memories::{
    StoreMemoryParams, delete_memory_sync, list_memories_sync, memories_by_session_sync,
    store_memory_sync,
};
use crate::db::observations::{
    get_observations_by_ids_sync, resolve_anchor_by_query_sync, timeline_window_sync,
};
use crate::db::queue::{EnqueueParams, enqueue_sync, get_dead_letters_sync, queue_stats_sync};
use crate::db::sync::last_sync_run_sync;
use crate::db::types::{Observation, SessionStatus, UserPrompt};
use crate::error::MemError;
use crate::events::EventKind;
use crate::ingest::{INGEST_QUEUE, IngestEvent};
use crate::search::SearchOptions;
use crate::utils::{now_ms, truncate_with_ellipsis};
use crate::web::state::AppState;

/// Search result snippet length cap.
const SNIPPET_CHARS: usize = 150;

/// Handler error adapter: MemError → JSON error response.
#[derive(Debug)]
pub struct ApiError(pub MemError);

impl<E: Into<MemError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        let mut body = json!({ "success": false, "error": self.0.to_string() });
        if let Some(code) = self.0.code() {
            body["code"] = json!(code);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Wrap a payload object with `success: true`.
fn ok(mut payload: Value) -> Json<Value> {
    if let Some(map) = payload.as_object_mut() {
        map.insert("success".to_string(), json!(true));
    }
    Json(payload)
}

fn bad_request(msg: impl Into<String>) -> ApiError {
    ApiError(MemError::InvalidInput(msg.into()))
}

fn require_str(value: &Value, field: &str) -> Result<String, ApiError> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_request(format!("missing required field '{field}'")))
}

/// JSON fallback for unknown routes.
pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": "route not found" })),
    )
        .into_response()
}

// ═══════════════════════════════════════
// HEALTH & STATS
// ═══════════════════════════════════════

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let db_connected = state
        .pool
        .try_interact("health probe", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(Into::into)
        })
        .await
        .is_some();

    let checks = json!([
        { "name": "database", "ok": db_connected },
        { "name": "embeddings", "ok": state.embeddings.enabled() },
        { "name": "replicator", "ok": state.replicator.configured() },
    ]);

    Json(json!({
        "success": db_connected,
        "status": if db_connected { "ok" } else { "error" },
        "dbConnected": db_connected,
        "vectorEnabled": state.embeddings.enabled(),
        "queueRunning": state.queue_running(),
        "sseClients": state.broadcaster.client_count(),
        "checks": checks,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn stats(State(state): State<AppState>) -> ApiResult {
    let counts = state
        .pool
        .run(crate::db::store_counts_sync)
        .await?;
    let queue = state.pool.run(queue_stats_sync).await?;
    let last_sync = state.pool.run(last_sync_run_sync).await?;

    Ok(ok(json!({
        "counts": counts,
        "queue": queue,
        "ingest": state.ingest.stats(),
        "embeddings": state.embeddings.stats(),
        "pool": state.pool.status(),
        "routes": state.metrics.summary(),
        "lastSyncRun": last_sync,
        "lastSearchDiagnostics": state.search.last_diagnostics(),
    })))
}

// ═══════════════════════════════════════
// SESSIONS
// ═══════════════════════════════════════

pub async fn session_init(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let session_id = require_str(&body, "sessionId")?;
    let project = require_str(&body, "project")?;
    state.sessions.init_session(&session_id, &project).await?;
    Ok(ok(json!({ "sessionId": session_id, "project": project })))
}

pub async fn session_complete(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let session_id = require_str(&body, "sessionId")?;
    let project = require_str(&body, "project")?;
    let status = match body.get("status").and_then(|v| v.as_str()) {
        None => SessionStatus::Completed,
        Some(raw) => SessionStatus::parse(raw)
            .filter(|s| *s != SessionStatus::Active)
            .ok_or_else(|| bad_request(format!("unknown terminal status {raw:?}")))?,
    };

    let completed = state
        .sessions
        .complete_session(&session_id, &project, status)
        .await?;
    Ok(ok(json!({
        "sessionId": session_id,
        "status": status.as_str(),
        "completed": completed,
    })))
}

// ═══════════════════════════════════════
// EVENT INGEST
// ═══════════════════════════════════════

pub async fn events_ingest(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    if !state.ingest_limiter.check() {
        return Err(ApiError(MemError::RateLimited));
    }

    let event_type = require_str(&body, "eventType")?;
    let session_id = require_str(&body, "sessionId")?;
    let project = require_str(&body, "project")?;
    let dedup_key = body
        .get("dedupKey")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    // Validate against the closed event enum; unknown types are a 400.
    let event_value = json!({
        "eventType": event_type,
        "sessionId": session_id,
        "project": project,
        "data": body.get("data").cloned().unwrap_or_else(|| json!({})),
    });
    let event: IngestEvent = serde_json::from_value(event_value)
        .map_err(|e| bad_request(format!("invalid event: {e}")))?;
    match &event {
        IngestEvent::Observation { data, .. } => {
            if data.title.trim().is_empty() || data.text.trim().is_empty() {
                return Err(bad_request("observation events require 'title' and 'text'"));
            }
        }
        IngestEvent::UserPrompt { data, .. } => {
            if data.text.trim().is_empty() {
                return Err(bad_request("user_prompt events require 'text'"));
            }
        }
        _ => {}
    }

    let payload = serde_json::to_string(&event)?;
    let entity = session_id.clone();
    let dedup_for_queue = dedup_key.clone();
    let message_id = state
        .pool
        .run(move |conn| {
            enqueue_sync(
                conn,
                EnqueueParams {
                    queue_name: INGEST_QUEUE,
                    entity_id: &entity,
                    payload: &payload,
                    max_retries: None,
                    delay_ms: None,
                    dedup_key: dedup_for_queue.as_deref(),
                },
            )
        })
        .await?;

    let duplicate = message_id == crate::db::queue::DUPLICATE;
    Ok(ok(json!({
        "queued": !duplicate,
        "duplicate": duplicate,
        "queueMessageId": if duplicate { Value::Null } else { json!(message_id) },
        "dedupKey": dedup_key,
    })))
}

// ═══════════════════════════════════════
// SEARCH / TIMELINE / BATCH
// ═══════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub query: String,
    pub project: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub date_start: Option<i64>,
    pub date_end: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub include_diagnostics: Option<bool>,
    pub use_fts: Option<bool>,
    pub use_semantic: Option<bool>,
    pub min_relevance: Option<f64>,
}

pub async fn search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> ApiResult {
    if params.query.trim().is_empty() {
        return Err(bad_request("missing required field 'query'"));
    }
    let settings = state.settings_snapshot();
    let options = SearchOptions {
        project: params.project,
        kind: params.kind,
        date_start_ms: params.date_start,
        date_end_ms: params.date_end,
        limit: params.limit.unwrap_or(20).min(100),
        offset: params.offset.unwrap_or(0),
        use_fts: params.use_fts.unwrap_or(settings.use_fts),
        use_semantic: params.use_semantic.unwrap_or(settings.use_semantic),
        min_relevance: params.min_relevance,
    };

    let outcome = state.search.search(&params.query, options).await?;
    let results: Vec<Value> = outcome
        .results
        .iter()
        .map(|hit| {
            let obs = &hit.observation;
            json!({
                "id": obs.id,
                "title": obs.title,
                "subtitle": obs.subtitle,
                "snippet": truncate_with_ellipsis(&obs.text, SNIPPET_CHARS),
                "type": obs.kind,
                "prompt_number": obs.prompt_number,
                "created_at_epoch": obs.created_at_ms,
                "similarity": (hit.final_score * 100.0).round().clamp(0.0, 100.0),
                "scores": {
                    "lexical": hit.scores.lexical,
                    "semantic": hit.scores.semantic,
                    "recency": hit.scores.recency,
                },
            })
        })
        .collect();

    let mut payload = json!({
        "results": results,
        "total": outcome.total,
        "strategies": outcome.strategies,
        "timingMs": outcome.timing_ms,
    });
    if params.include_diagnostics.unwrap_or(false) {
        payload["diagnostics"] = serde_json::to_value(&outcome.diagnostics)?;
    }
    Ok(ok(payload))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineParams {
    pub anchor: Option<i64>,
    pub query: Option<String>,
    #[serde(default = "default_depth")]
    pub depth_before: usize,
    #[serde(default = "default_depth")]
    pub depth_after: usize,
    pub project: Option<String>,
}

fn default_depth() -> usize {
    3
}

fn observation_json(obs: &Observation) -> Value {
    json!({
        "id": obs.id,
        "sessionId": obs.session_id,
        "project": obs.project,
        "type": obs.kind,
        "title": obs.title,
        "subtitle": obs.subtitle,
        "text": obs.text,
        "facts": obs.facts,
        "filesRead": obs.files_read,
        "filesModified": obs.files_modified,
        "prompt_number": obs.prompt_number,
        "created_at_epoch": obs.created_at_ms,
    })
}

fn prompt_json(prompt: &UserPrompt) -> Value {
    json!({
        "id": prompt.id,
        "sessionId": prompt.session_id,
        "prompt_number": prompt.prompt_number,
        "text": prompt.text,
        "created_at_epoch": prompt.created_at_ms,
    })
}

pub async fn timeline(
    State(state): State<AppState>,
    Query(params): Query<TimelineParams>,
) -> ApiResult {
    let started = std::time::Instant::now();

    let anchor_id = match (params.anchor, params.query.as_ref()) {
        (Some(id), _) => Some(id),
        (None, Some(query)) => {
            let query = query.clone();
            let project = params.project.clone();
            state
                .pool
                .run(move |conn| resolve_anchor_by_query_sync(conn, &query, project.as_deref()))
                .await?
        }
        (None, None) => {
            return Err(bad_request("either 'anchor' or 'query' is required"));
        }
    };

    let window = match anchor_id {
        Some(id) => {
            let project = params.project.clone();
            let (before, after) = (params.depth_before, params.depth_after);
            state
                .pool
                .run(move |conn| timeline_window_sync(conn, id, before, after, project.as_deref()))
                .await?
        }
        None => None,
    };

    let timing_ms = started.elapsed().as_millis() as u64;
    match window {
        Some(window) => Ok(ok(json!({
            "anchor": { "id": window.anchor.id, "created_at_epoch": window.anchor.created_at_ms },
            "before": window.before.iter().map(observation_json).collect::<Vec<_>>(),
            "after": window.after.iter().map(observation_json).collect::<Vec<_>>(),
            "prompts": window.prompts.iter().map(prompt_json).collect::<Vec<_>>(),
            "timingMs": timing_ms,
        }))),
        None => Ok(ok(json!({
            "anchor": Value::Null,
            "before": [],
            "after": [],
            "prompts": [],
            "timingMs": timing_ms,
        }))),
    }
}

pub async fn observations_batch(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult {
    let started = std::time::Instant::now();

    let ids: Vec<i64> = body
        .get("ids")
        .and_then(|v| v.as_array())
        .ok_or_else(|| bad_request("missing required field 'ids'"))?
        .iter()
        .map(|v| v.as_i64().ok_or_else(|| bad_request("malformed ids list")))
        .collect::<Result<_, _>>()?;
    if ids.is_empty() {
        return Err(bad_request("'ids' must not be empty"));
    }
    let order_by_date = match body.get("orderBy").and_then(|v| v.as_str()) {
        None | Some("date") => true,
        Some("id") => false,
        Some(other) => return Err(bad_request(format!("unknown orderBy {other:?}"))),
    };
    let project = body
        .get("project")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let observations = state
        .pool
        .run(move |conn| {
            get_observations_by_ids_sync(conn, &ids, project.as_deref(), order_by_date)
        })
        .await?;

    Ok(ok(json!({
        "observations": observations.iter().map(observation_json).collect::<Vec<_>>(),
        "count": observations.len(),
        "timingMs": started.elapsed().as_millis() as u64,
    })))
}

// ═══════════════════════════════════════
// MEMORY
// ═══════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryListParams {
    pub project: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn memory_list(
    State(state): State<AppState>,
    Query(params): Query<MemoryListParams>,
) -> ApiResult {
    let limit = params.limit.unwrap_or(20).min(100);
    let offset = params.offset.unwrap_or(0);
    let memories = state
        .pool
        .run(move |conn| {
            list_memories_sync(
                conn,
                params.project.as_deref(),
                params.kind.as_deref(),
                limit,
                offset,
            )
        })
        .await?;
    let count = memories.len();
    Ok(ok(json!({ "memories": memories, "count": count })))
}

pub async fn memory_save(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let project = require_str(&body, "project")?;
    let content_raw = require_str(&body, "content")?;

    let filter = state.settings_snapshot().privacy_filter();
    let content = filter.sanitize(&content_raw)?;
    let summary = body
        .get("summary")
        .and_then(|v| v.as_str())
        .and_then(|s| filter.sanitize(s).ok())
        .map(|s| s.text);

    let kind = body
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("general")
        .to_string();
    let tags: Vec<String> = body
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let metadata = body.get("metadata").cloned();
    let session_id = body
        .get("sessionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let explicit_id = body.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());

    let project_for_row = project.clone();
    let session_for_row = session_id.clone();
    let content_text = content.text.clone();
    let id = state
        .pool
        .run(move |conn| {
            store_memory_sync(
                conn,
                StoreMemoryParams {
                    id: explicit_id.as_deref(),
                    project: &project_for_row,
                    content: &content_text,
                    summary: summary.as_deref(),
                    kind: &kind,
                    tags: &tags,
                    metadata: metadata.as_ref(),
                    session_id: session_for_row.as_deref(),
                },
            )
        })
        .await?;

    state.broadcaster.broadcast(
        EventKind::MemorySaved,
        json!({ "id": id, "project": project }),
        Some(&project),
        session_id.as_deref(),
    );

    Ok(ok(json!({ "id": id, "warnings": content.warnings })))
}

pub async fn memory_delete(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id_for_row = id.clone();
    let deleted = state
        .pool
        .run(move |conn| delete_memory_sync(conn, &id_for_row))
        .await?;
    if !deleted {
        return Err(ApiError(MemError::NotFound(format!("memory {id}"))));
    }
    Ok(ok(json!({ "deleted": true, "id": id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryBySessionParams {
    pub session_id: String,
    pub project: String,
    pub limit: Option<usize>,
}

pub async fn memory_by_session(
    State(state): State<AppState>,
    Query(params): Query<MemoryBySessionParams>,
) -> ApiResult {
    let limit = params.limit.unwrap_or(5).min(50);
    let memories = state
        .pool
        .run(move |conn| {
            memories_by_session_sync(conn, &params.session_id, &params.project, limit)
        })
        .await?;
    let count = memories.len();
    Ok(ok(json!({ "memories": memories, "count": count })))
}

// ═══════════════════════════════════════
// CONTEXT INJECTION
// ═══════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextQueryParams {
    pub project: String,
    pub max_tokens: Option<usize>,
    pub max_memories: Option<usize>,
    pub session_id: Option<String>,
    pub max_age_days: Option<u32>,
}

pub async fn context_inject(
    State(state): State<AppState>,
    Query(params): Query<ContextQueryParams>,
) -> ApiResult {
    let injection = build_context(
        &state.pool,
        ContextParams {
            project: params.project,
            max_tokens: params.max_tokens.unwrap_or(state.config.context.max_tokens),
            max_memories: params
                .max_memories
                .unwrap_or(state.config.context.max_memories),
            session_id: params.session_id,
            max_age_days: params.max_age_days,
        },
    )
    .await?;

    Ok(ok(json!({
        "context": injection.context,
        "count": injection.count,
        "tokenEstimate": injection.token_estimate,
    })))
}

// ═══════════════════════════════════════
// DIAGNOSTICS
// ═══════════════════════════════════════

pub async fn diagnostics_queue(State(state): State<AppState>) -> ApiResult {
    let queue = state.pool.run(queue_stats_sync).await?;
    let letters = state
        .pool
        .run(|conn| get_dead_letters_sync(conn, None, 20))
        .await?;
    Ok(ok(json!({
        "queue": queue,
        "ingest": state.ingest.stats(),
        "embeddings": state.embeddings.stats(),
        "deadLetters": letters,
    })))
}

pub async fn diagnostics_search(State(state): State<AppState>) -> ApiResult {
    Ok(ok(json!({ "lastSearch": state.search.last_diagnostics() })))
}

pub async fn diagnostics_sync(State(state): State<AppState>) -> ApiResult {
    let last_run = state.pool.run(last_sync_run_sync).await?;
    let letters = state
        .pool
        .run(|conn| get_dead_letters_sync(conn, Some(crate::replicator::SYNC_QUEUE), 20))
        .await?;
    Ok(ok(json!({
        "configured": state.replicator.configured(),
        "lastRun": last_run,
        "deadLetters": letters,
    })))
}

pub async fn diagnostics_sync_replay(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult {
    let limit = body.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
    let report = state.replicator.replay_failed(limit.min(100)).await?;
    Ok(ok(json!({
        "replayed": report.replayed,
        "failed": report.failed,
    })))
}

// ═══════════════════════════════════════
// SETTINGS
// ═══════════════════════════════════════

pub async fn settings_get(State(state): State<AppState>) -> ApiResult {
    let settings = state.settings_snapshot();
    Ok(ok(json!({ "settings": settings })))
}

pub async fn settings_update(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    {
        let mut settings = state.settings.write().unwrap_or_else(|e| e.into_inner());
        let mut merged = serde_json::to_value(*settings)?;
        if let (Some(base), Some(overlay)) = (merged.as_object_mut(), body.as_object()) {
            for (key, value) in overlay {
                if !base.contains_key(key) {
                    return Err(bad_request(format!("unknown setting {key:?}")));
                }
                base.insert(key.clone(), value.clone());
            }
        }
        *settings = serde_json::from_value(merged)
            .map_err(|e| bad_request(format!("invalid settings: {e}")))?;
    }
    let settings = state.settings_snapshot();
    Ok(ok(json!({ "settings": settings })))
}

// ═══════════════════════════════════════
// CLEANUP
// ═══════════════════════════════════════

pub async fn cleanup_run(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let project = require_str(&body, "project")?;
    let max_memories = body
        .get("maxMemories")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize);
    let max_age_days = body
        .get("maxAgeDays")
        .and_then(|v| v.as_u64())
        .map(|n| n as u32);
    let dry_run = body
        .get("dryRun")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let report = state
        .pool
        .run(move |conn| {
            cleanup_project_sync(conn, &project, max_memories, max_age_days, dry_run)
        })
        .await?;
    Ok(ok(serde_json::to_value(report)?))
}

pub async fn cleanup_purge(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    if !body
        .get("confirm")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return Err(bad_request("purge requires confirm=true"));
    }
    let project = body
        .get("project")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let project_for_db = project.clone();
    let report = state
        .pool
        .run(move |conn| purge_sync(conn, project_for_db.as_deref()))
        .await?;

    // Best-effort remote cleanup of the replicated copies
    if let Some(ref project) = project {
        if let Err(e) = state.replicator.delete_by_project(project).await {
            tracing::warn!(project, "replica purge failed (continuing): {}", e);
        }
    }

    Ok(ok(json!({ "purged": report, "project": project, "purgedAtMs": now_ms() })))
}
