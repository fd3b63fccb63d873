//! End-to-end tests across the ingest → store → retrieval pipeline,
//! exercised through the same service handles the HTTP layer uses.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use serde_json::{Value, json};

use opencode_mem::config::{Config, RuntimeSettings};
use opencode_mem::db::DatabasePool;
use opencode_mem::embeddings::worker::EmbeddingWorker;
use opencode_mem::events::EventBroadcaster;
use opencode_mem::ingest::IngestProcessor;
use opencode_mem::ranker::RankWeights;
use opencode_mem::replicator::Replicator;
use opencode_mem::search::{SearchOptions, SearchOrchestrator};
use opencode_mem::session_service::SessionService;
use opencode_mem::web::state::{AppState, RateLimiter, RouteMetrics};

/// Assembled in-memory service graph for tests.
struct TestHarness {
    state: AppState,
}

impl TestHarness {
    async fn new() -> Self {
        let pool = Arc::new(DatabasePool::open_in_memory().await.expect("open pool"));
        let broadcaster = EventBroadcaster::new();
        let settings = Arc::new(RwLock::new(RuntimeSettings::default()));
        let sessions = Arc::new(SessionService::new(pool.clone(), broadcaster.clone()));
        let embeddings = EmbeddingWorker::new(pool.clone(), None, Duration::from_millis(1));
        let ingest = IngestProcessor::new(
            pool.clone(),
            sessions.clone(),
            embeddings.clone(),
            broadcaster.clone(),
            settings.clone(),
            50,
            0,
            Duration::from_millis(1_000),
        );
        let search = Arc::new(SearchOrchestrator::new(
            pool.clone(),
            embeddings.clone(),
            RankWeights::default(),
        ));
        let replicator = Replicator::new(pool.clone(), None, None, 100, Duration::from_secs(60));

        let state = AppState {
            pool,
            sessions,
            ingest,
            embeddings,
            search,
            replicator,
            broadcaster,
            settings,
            config: Arc::new(Config::default()),
            metrics: Arc::new(RouteMetrics::default()),
            ingest_limiter: Arc::new(RateLimiter::new(0)),
            loops_running: Arc::new(AtomicBool::new(true)),
        };
        Self { state }
    }

    /// POST /api/events/ingest followed by one processor batch.
    async fn ingest_and_process(&self, body: Value) -> Value {
        let response =
            opencode_mem::web::api::events_ingest(State(self.state.clone()), Json(body))
                .await
                .expect("ingest accepted");
        self.state.ingest.process_batch().await.expect("batch");
        response.0
    }

    async fn seed_observation(&self, session: &str, title: &str, text: &str) {
        self.ingest_and_process(json!({
            "eventType": "observation",
            "sessionId": session,
            "project": "proj",
            "data": { "type": "fact", "title": title, "text": text },
        }))
        .await;
    }
}

#[tokio::test]
async fn ingested_observation_is_searchable() {
    let harness = TestHarness::new().await;
    let response = harness
        .ingest_and_process(json!({
            "eventType": "observation",
            "sessionId": "s-1",
            "project": "proj",
            "data": {
                "type": "decision",
                "title": "search diagnostics should contain strategy timings",
                "text": "we record per-strategy elapsed milliseconds",
            },
            "dedupKey": "obs-1",
        }))
        .await;
    assert_eq!(response["queued"], true);
    assert_eq!(response["duplicate"], false);
    assert!(response["queueMessageId"].as_i64().unwrap() > 0);

    let outcome = harness
        .state
        .search
        .search(
            "strategy timings",
            SearchOptions {
                project: Some("proj".to_string()),
                use_semantic: false,
                limit: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(outcome.total > 0);
    assert!(!outcome.diagnostics.strategy_timings_ms.is_empty());
    assert!(outcome.diagnostics.ended_at_epoch_ms >= outcome.diagnostics.started_at_epoch_ms);
    assert!(outcome.results[0].final_score > 0.0);
}

#[tokio::test]
async fn duplicate_ingest_reports_duplicate_after_processing() {
    let harness = TestHarness::new().await;
    let body = json!({
        "eventType": "observation",
        "sessionId": "s-1",
        "project": "proj",
        "data": { "title": "once", "text": "only once" },
        "dedupKey": "dedup-once",
    });

    let first = harness.ingest_and_process(body.clone()).await;
    assert_eq!(first["queued"], true);

    // The dedup key is now in the processed-event log
    let second = opencode_mem::web::api::events_ingest(State(harness.state.clone()), Json(body))
        .await
        .unwrap()
        .0;
    assert_eq!(second["duplicate"], true);
    assert!(second["queueMessageId"].is_null());

    let count: i64 = harness
        .state
        .pool
        .interact_raw(|conn| {
            conn.query_row("SELECT COUNT(*) FROM observations", [], |r| r.get(0))
        })
        .await
        .unwrap();
    assert_eq!(count, 1, "the observation was persisted exactly once");
}

#[tokio::test]
async fn unknown_event_type_is_rejected_not_dropped() {
    let harness = TestHarness::new().await;
    let err = opencode_mem::web::api::events_ingest(
        State(harness.state.clone()),
        Json(json!({
            "eventType": "telemetry",
            "sessionId": "s-1",
            "project": "proj",
        })),
    )
    .await
    .err()
    .expect("must be rejected");
    assert_eq!(err.0.http_status(), 400);
}

#[tokio::test]
async fn timeline_window_spans_the_anchor() {
    let harness = TestHarness::new().await;
    for i in 0..5 {
        harness
            .seed_observation("s-1", &format!("step {i}"), &format!("work item {i}"))
            .await;
        // Distinct created_at_ms per row
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    harness
        .ingest_and_process(json!({
            "eventType": "user_prompt",
            "sessionId": "s-1",
            "project": "proj",
            "data": { "text": "please walk through the steps" },
        }))
        .await;

    let response = opencode_mem::web::api::timeline(
        State(harness.state.clone()),
        Query(opencode_mem::web::api::TimelineParams {
            anchor: None,
            query: Some("step 2".to_string()),
            depth_before: 2,
            depth_after: 2,
            project: Some("proj".to_string()),
        }),
    )
    .await
    .unwrap()
    .0;

    assert!(response["anchor"]["id"].as_i64().is_some());
    assert_eq!(response["before"].as_array().unwrap().len(), 2);
    assert_eq!(response["after"].as_array().unwrap().len(), 2);
    assert_eq!(response["prompts"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn observations_batch_orders_and_counts() {
    let harness = TestHarness::new().await;
    harness.seed_observation("s-1", "alpha", "first").await;
    harness.seed_observation("s-1", "beta", "second").await;

    let response = opencode_mem::web::api::observations_batch(
        State(harness.state.clone()),
        Json(json!({ "ids": [2, 1], "orderBy": "id" })),
    )
    .await
    .unwrap()
    .0;
    assert_eq!(response["count"], 2);
    let ids: Vec<i64> = response["observations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2]);

    // Unknown orderBy is an input error
    let err = opencode_mem::web::api::observations_batch(
        State(harness.state.clone()),
        Json(json!({ "ids": [1], "orderBy": "relevance" })),
    )
    .await
    .err()
    .expect("unknown enum rejected");
    assert_eq!(err.0.http_status(), 400);
}

#[tokio::test]
async fn context_budget_truncates_deterministically() {
    let harness = TestHarness::new().await;
    // Three memories of 200 chars each, newest first in the read path
    for (i, ts) in [(1, 3_000i64), (2, 2_000), (3, 1_000)] {
        let content = "x".repeat(200);
        harness
            .state
            .pool
            .interact_raw(move |conn| {
                conn.execute(
                    "INSERT INTO memories (id, project, content, kind, created_at_ms)
                     VALUES (?1, 'proj', ?2, 'general', ?3)",
                    rusqlite::params![format!("m-{i}"), content, ts],
                )
                .map(|_| ())
            })
            .await
            .unwrap();
    }

    let response = opencode_mem::web::api::context_inject(
        State(harness.state.clone()),
        Query(opencode_mem::web::api::ContextQueryParams {
            project: "proj".to_string(),
            max_tokens: Some(60),
            max_memories: Some(2),
            session_id: None,
            max_age_days: None,
        }),
    )
    .await
    .unwrap()
    .0;

    // One 200-char line costs ~52 tokens, so exactly one fits in 60; the
    // second overflows and iteration stops there (the third is DB-limited
    // out anyway).
    assert_eq!(response["count"], 1);
    assert!(response["tokenEstimate"].as_u64().unwrap() <= 60);
    let block = response["context"].as_str().unwrap();
    assert!(block.contains("[#m-1]"), "newest memory wins: {block}");
}

#[tokio::test]
async fn session_complete_compiles_summary_and_is_terminal() {
    let harness = TestHarness::new().await;
    opencode_mem::web::api::session_init(
        State(harness.state.clone()),
        Json(json!({ "sessionId": "s-1", "project": "proj" })),
    )
    .await
    .unwrap();

    harness
        .ingest_and_process(json!({
            "eventType": "observation",
            "sessionId": "s-1",
            "project": "proj",
            "data": { "type": "bugfix", "title": "fixed the watcher race", "text": "details" },
        }))
        .await;

    let response = opencode_mem::web::api::session_complete(
        State(harness.state.clone()),
        Json(json!({ "sessionId": "s-1", "project": "proj" })),
    )
    .await
    .unwrap()
    .0;
    assert_eq!(response["completed"], true);

    let summary: Option<String> = harness
        .state
        .pool
        .interact_raw(|conn| {
            conn.query_row(
                "SELECT completed FROM summaries WHERE session_id = 's-1'",
                [],
                |r| r.get(0),
            )
        })
        .await
        .ok();
    assert_eq!(summary.as_deref(), Some("fixed the watcher race"));

    // Completion is exactly-once
    let again = opencode_mem::web::api::session_complete(
        State(harness.state.clone()),
        Json(json!({ "sessionId": "s-1", "project": "proj", "status": "failed" })),
    )
    .await
    .unwrap()
    .0;
    assert_eq!(again["completed"], false);
}

#[tokio::test]
async fn privacy_gate_blocks_memory_writes() {
    let harness = TestHarness::new().await;
    let err = opencode_mem::web::api::memory_save(
        State(harness.state.clone()),
        Json(json!({
            "project": "proj",
            "content": "<private>all of it is private</private>",
        })),
    )
    .await
    .err()
    .expect("blocked");
    assert_eq!(err.0.code(), Some("BLOCKED_PRIVATE"));

    let count: i64 = harness
        .state
        .pool
        .interact_raw(|conn| conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0)))
        .await
        .unwrap();
    assert_eq!(count, 0, "no partial persist on privacy rejection");
}

#[tokio::test]
async fn memory_save_redacts_and_broadcasts() {
    let harness = TestHarness::new().await;
    let (_, mut rx) = harness.state.broadcaster.subscribe(None, None);
    let _ = rx.try_recv(); // connected

    let response = opencode_mem::web::api::memory_save(
        State(harness.state.clone()),
        Json(json!({
            "project": "proj",
            "content": "deploy key is sk-abcdefghijklmnopqrstuvwxyz123456",
            "sessionId": "s-1",
        })),
    )
    .await
    .unwrap()
    .0;
    let id = response["id"].as_str().unwrap().to_string();

    let stored: String = harness
        .state
        .pool
        .interact_raw(move |conn| {
            conn.query_row("SELECT content FROM memories WHERE id = ?1", [id], |r| {
                r.get(0)
            })
        })
        .await
        .unwrap();
    assert_eq!(stored, "deploy key is [REDACTED_API_KEY]");

    let event = rx.try_recv().expect("memory_saved event");
    assert_eq!(
        serde_json::to_value(&event).unwrap()["type"],
        "memory_saved"
    );
}

#[tokio::test]
async fn purge_requires_confirmation() {
    let harness = TestHarness::new().await;
    let err = opencode_mem::web::api::cleanup_purge(
        State(harness.state.clone()),
        Json(json!({ "project": "proj" })),
    )
    .await
    .err()
    .expect("rejected without confirm");
    assert_eq!(err.0.http_status(), 400);

    harness.seed_observation("s-1", "t", "b").await;
    let response = opencode_mem::web::api::cleanup_purge(
        State(harness.state.clone()),
        Json(json!({ "project": "proj", "confirm": true })),
    )
    .await
    .unwrap()
    .0;
    assert_eq!(response["purged"]["observations"], 1);
}

#[tokio::test]
async fn rate_limited_ingest_returns_429() {
    let harness = TestHarness::new().await;
    let state = AppState {
        ingest_limiter: Arc::new(RateLimiter::new(1)),
        ..harness.state.clone()
    };
    let body = json!({
        "eventType": "session_start",
        "sessionId": "s-1",
        "project": "proj",
    });

    opencode_mem::web::api::events_ingest(State(state.clone()), Json(body.clone()))
        .await
        .expect("first call within budget");
    let err = opencode_mem::web::api::events_ingest(State(state), Json(body))
        .await
        .err()
        .expect("second call limited");
    assert_eq!(err.0.http_status(), 429);
}

#[tokio::test]
async fn search_latency_stays_bounded_over_many_rows() {
    let harness = TestHarness::new().await;
    harness
        .state
        .pool
        .interact_raw(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, project, status, started_at_ms)
                 VALUES ('bulk', 'proj', 'active', 0)",
                [],
            )?;
            for i in 0..3_000 {
                conn.execute(
                    "INSERT INTO observations
                        (session_id, project, kind, title, body, prompt_number, created_at_ms)
                     VALUES ('bulk', 'proj', 'general', ?1, ?2, 1, ?3)",
                    rusqlite::params![
                        format!("note {i} about queue retry diagnostics"),
                        format!("body {i} mentions retries, queues and diagnostics"),
                        1_000 + i,
                    ],
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();

    let mut timings = Vec::new();
    for _ in 0..25 {
        let outcome = harness
            .state
            .search
            .search(
                "queue retry diagnostics",
                SearchOptions {
                    project: Some("proj".to_string()),
                    use_semantic: false,
                    limit: 20,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.total > 0);
        timings.push(outcome.timing_ms);
    }
    timings.sort_unstable();
    let p95 = timings[(timings.len() as f64 * 0.95) as usize - 1];
    assert!(p95 < 600, "p95 search latency {p95}ms exceeds budget");
}
