// src/server.rs
// Service wiring and lifecycle
//
// Construction is sequenced store → queue workers → HTTP server. Shutdown
// reverses it: the watch channel stops the poll loops first, then the
// listener closes and the pool drops.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::config::{Config, RuntimeSettings};
use crate::db::DatabasePool;
use crate::embeddings::{EmbeddingClient, EmbeddingSettings};
use crate::embeddings::worker::EmbeddingWorker;
use crate::events::EventBroadcaster;
use crate::ingest::IngestProcessor;
use crate::ranker::RankWeights;
use crate::replicator::{Replicator, VectorStoreClient};
use crate::search::SearchOrchestrator;
use crate::session_service::SessionService;
use crate::web::state::{AppState, RateLimiter, RouteMetrics};

/// Run the memory service until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);

    // Store first: migration failure aborts startup.
    let db_path = config.db_path();
    let pool = Arc::new(
        DatabasePool::open(&db_path)
            .await
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "database ready");

    let broadcaster = EventBroadcaster::new();
    let settings = Arc::new(RwLock::new(RuntimeSettings::from_config(&config)));

    let embedding_client = EmbeddingClient::from_settings(&EmbeddingSettings {
        endpoint: config.embeddings.endpoint.clone(),
        api_key: config.embeddings.api_key.clone(),
        model: config.embeddings.model.clone(),
    })
    .map(Arc::new);

    let embeddings = EmbeddingWorker::new(
        pool.clone(),
        embedding_client.clone(),
        Duration::from_millis(config.embeddings.retry_delay_ms),
    );

    let sessions = Arc::new(SessionService::new(pool.clone(), broadcaster.clone()));

    let ingest = IngestProcessor::new(
        pool.clone(),
        sessions.clone(),
        embeddings.clone(),
        broadcaster.clone(),
        settings.clone(),
        config.ingest.batch_size,
        config.ingest.retry_delay_ms,
        Duration::from_millis(config.ingest.poll_interval_ms),
    );

    let search = Arc::new(SearchOrchestrator::new(
        pool.clone(),
        embeddings.clone(),
        RankWeights::default(),
    ));

    let store_client = config
        .chroma
        .url
        .clone()
        .map(|url| VectorStoreClient::http(url, config.chroma.collection.clone()));
    let replicator = Replicator::new(
        pool.clone(),
        store_client,
        embedding_client,
        config.chroma.batch_size,
        Duration::from_secs(config.chroma.sync_interval_secs),
    );

    // Background loops share one shutdown signal.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(embeddings.clone().run(shutdown_rx.clone()));
    tokio::spawn(ingest.clone().run(shutdown_rx.clone()));
    tokio::spawn(replicator.clone().run(shutdown_rx.clone()));
    tokio::spawn(broadcaster.clone().heartbeat_loop(shutdown_rx));

    let loops_running = Arc::new(AtomicBool::new(true));
    let state = AppState {
        pool,
        sessions,
        ingest,
        embeddings,
        search,
        replicator,
        broadcaster,
        settings,
        metrics: Arc::new(RouteMetrics::default()),
        ingest_limiter: Arc::new(RateLimiter::new(config.ingest.rate_limit_per_minute)),
        loops_running: loops_running.clone(),
        config: config.clone(),
    };

    let router = crate::web::create_router(state);
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    // Poll loops stop before the store goes away.
    let _ = shutdown_tx.send(true);
    loops_running.store(false, Ordering::Relaxed);
    tracing::info!("stopped");
    Ok(())
}
