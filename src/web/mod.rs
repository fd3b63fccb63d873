// src/web/mod.rs
// HTTP server layer

pub mod api;
pub mod sse;
pub mod state;

use axum::{
    Router,
    extract::{MatchedPath, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::web::state::AppState;

/// Create the HTTP router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_router = Router::new()
        .route("/health", get(api::health))
        .route("/stats", get(api::stats))
        // Session lifecycle
        .route("/sessions/init", post(api::session_init))
        .route("/sessions/complete", post(api::session_complete))
        // Durable event ingestion
        .route("/events/ingest", post(api::events_ingest))
        // Retrieval layers: ranked index, chronological window, full details
        .route("/search", get(api::search))
        .route("/timeline", get(api::timeline))
        .route("/observations/batch", post(api::observations_batch))
        // Memories
        .route("/memory/list", get(api::memory_list))
        .route("/memory/save", post(api::memory_save))
        .route("/memory/{id}", axum::routing::delete(api::memory_delete))
        .route("/memory/by-session", get(api::memory_by_session))
        // Context injection
        .route("/context/inject", get(api::context_inject))
        // Diagnostics
        .route("/diagnostics/queue", get(api::diagnostics_queue))
        .route("/diagnostics/search", get(api::diagnostics_search))
        .route("/diagnostics/sync", get(api::diagnostics_sync))
        .route("/diagnostics/sync/replay", post(api::diagnostics_sync_replay))
        // Live events
        .route("/stream", get(sse::stream))
        // Runtime settings
        .route("/settings", get(api::settings_get).post(api::settings_update))
        // Retention
        .route("/cleanup/run", post(api::cleanup_run))
        .route("/cleanup/purge", post(api::cleanup_purge));

    Router::new()
        .nest("/api", api_router)
        .fallback(api::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), track_route))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Record per-route latency and error rate for /api/stats.
async fn track_route(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let started = std::time::Instant::now();

    let response = next.run(request).await;

    state.metrics.record(
        &route,
        started.elapsed().as_millis() as u64,
        response.status().is_client_error() || response.status().is_server_error(),
    );
    response
}
