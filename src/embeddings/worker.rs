// src/embeddings/worker.rs
// Asynchronous embedding worker with an in-memory retry queue
//
// Single consumer over an in-process FIFO. Ingestion only ever enqueues an
// observation id, so a provider outage degrades search to lexical-only
// instead of blocking writes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, watch};

use super::{EmbeddingClient, cosine_similarity};
use crate::db::DatabasePool;
use crate::db::observations::observations_missing_vectors_sync;
use crate::db::queue::insert_dead_letter_sync;
use crate::db::vectors::{has_vector_sync, store_vector_sync, vectors_for_project_sync};

/// Attempts per observation before dead-lettering.
const MAX_ATTEMPTS: u32 = 3;

/// Queue name and reason recorded on exhaustion.
const QUEUE_NAME: &str = "embedding_queue";
const EXHAUSTED_REASON: &str = "embedding_failed_after_retries";

/// How many vector-less observations to enqueue at startup.
const STARTUP_BACKFILL: usize = 100;

#[derive(Debug, Clone, Copy)]
struct QueueItem {
    observation_id: i64,
    attempt: u32,
}

/// Counter snapshot exposed via diagnostics.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct EmbeddingWorkerStats {
    pub enqueued: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub pending: u64,
    pub max_depth: u64,
}

pub struct EmbeddingWorker {
    pool: Arc<DatabasePool>,
    client: Option<Arc<EmbeddingClient>>,
    queue: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
    retry_delay: Duration,
    enqueued: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    max_depth: AtomicU64,
}

impl EmbeddingWorker {
    pub fn new(
        pool: Arc<DatabasePool>,
        client: Option<Arc<EmbeddingClient>>,
        retry_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            client,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            retry_delay,
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            max_depth: AtomicU64::new(0),
        })
    }

    /// Whether an embedding provider is configured.
    pub fn enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Queue an observation for embedding. Already-queued ids are a no-op.
    pub fn enqueue(&self, observation_id: i64) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.iter().any(|i| i.observation_id == observation_id) {
            return;
        }
        queue.push_back(QueueItem {
            observation_id,
            attempt: 1,
        });
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.max_depth
            .fetch_max(queue.len() as u64, Ordering::Relaxed);
        drop(queue);
        self.notify.notify_one();
    }

    fn requeue(&self, item: QueueItem) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back(item);
        self.max_depth
            .fetch_max(queue.len() as u64, Ordering::Relaxed);
        drop(queue);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueueItem> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn stats(&self) -> EmbeddingWorkerStats {
        EmbeddingWorkerStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            pending: self.queue.lock().unwrap_or_else(|e| e.into_inner()).len() as u64,
            max_depth: self.max_depth.load(Ordering::Relaxed),
        }
    }

    /// Enqueue the newest observations that have no vector yet.
    pub async fn backfill(&self, limit: usize) -> Result<usize> {
        let ids = self
            .pool
            .interact_raw(move |conn| observations_missing_vectors_sync(conn, limit))
            .await?;
        let count = ids.len();
        for id in ids {
            self.enqueue(id);
        }
        Ok(count)
    }

    /// Worker loop: drain the queue, park on the notifier when idle.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.client.is_none() {
            tracing::info!("embedding worker idle: no provider configured");
            return;
        }
        tracing::info!("embedding worker started");

        match self.backfill(STARTUP_BACKFILL).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("embedding backfill queued {} observations", n),
            Err(e) => tracing::warn!("embedding backfill failed: {}", e),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.process_next().await {
                continue;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("embedding worker shutting down");
    }

    /// Pop and process one queue item. Returns false when the queue was empty.
    pub async fn process_next(&self) -> bool {
        let Some(item) = self.pop() else {
            return false;
        };
        let Some(client) = self.client.as_ref() else {
            return false;
        };

        let observation_id = item.observation_id;
        let already_embedded = self
            .pool
            .interact_raw(move |conn| has_vector_sync(conn, observation_id))
            .await
            .unwrap_or(false);
        if already_embedded {
            return true;
        }

        let text = self
            .pool
            .interact_raw(move |conn| {
                conn.query_row(
                    "SELECT title || ' ' || body FROM observations WHERE id = ?1",
                    [observation_id],
                    |row| row.get::<_, String>(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
            })
            .await
            .ok()
            .flatten();
        let Some(text) = text else {
            // Observation purged between enqueue and processing
            return true;
        };

        match client.embed(&text).await {
            Ok(embedding) => {
                let model = client.model_name().to_string();
                let stored = self
                    .pool
                    .interact_raw(move |conn| {
                        store_vector_sync(conn, observation_id, &embedding, &model)
                    })
                    .await;
                match stored {
                    Ok(()) => {
                        self.processed.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(observation_id, "stored embedding");
                    }
                    Err(e) => {
                        tracing::warn!(observation_id, "failed to store embedding: {}", e);
                        self.fail_or_retry(item, &e.to_string()).await;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(
                    observation_id,
                    attempt = item.attempt,
                    "embedding attempt failed: {}",
                    e
                );
                self.fail_or_retry(item, &e.to_string()).await;
            }
        }
        true
    }

    async fn fail_or_retry(&self, item: QueueItem, error: &str) {
        if item.attempt >= MAX_ATTEMPTS {
            self.failed.fetch_add(1, Ordering::Relaxed);
            let observation_id = item.observation_id;
            let payload = serde_json::json!({
                "observation_id": observation_id,
                "attempts": item.attempt,
                "error": error,
            })
            .to_string();
            let result = self
                .pool
                .interact_raw(move |conn| {
                    insert_dead_letter_sync(
                        conn,
                        QUEUE_NAME,
                        &observation_id.to_string(),
                        &payload,
                        EXHAUSTED_REASON,
                    )
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(observation_id, "failed to write dead letter: {}", e);
            }
            return;
        }

        self.retried.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(self.retry_delay * item.attempt).await;
        self.requeue(QueueItem {
            observation_id: item.observation_id,
            attempt: item.attempt + 1,
        });
    }

    /// Embed the query and score it against every vector of the project.
    ///
    /// Returns the top-K observation ids with raw cosine similarity in [-1, 1].
    pub async fn semantic_search(
        &self,
        query: &str,
        project: &str,
        top_k: usize,
    ) -> Result<HashMap<i64, f64>> {
        let Some(client) = self.client.as_ref() else {
            return Ok(HashMap::new());
        };
        let query_embedding = client.embed(query).await?;

        let project = project.to_string();
        let vectors = self
            .pool
            .interact_raw(move |conn| vectors_for_project_sync(conn, &project))
            .await?;

        let mut scored: Vec<(i64, f64)> = vectors
            .into_iter()
            .map(|(id, v)| (id, cosine_similarity(&query_embedding, &v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support;
    use crate::embeddings::mock::MockEmbeddings;

    async fn pool_with_observation(title: &str, body: &str) -> (Arc<DatabasePool>, i64) {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let title = title.to_string();
        let body = body.to_string();
        let id = pool
            .interact(move |conn| {
                Ok(test_support::insert_observation(
                    conn, "s-1", "proj", &title, &body, 1_000,
                ))
            })
            .await
            .unwrap();
        (pool, id)
    }

    fn worker_with(
        pool: Arc<DatabasePool>,
        mock: MockEmbeddings,
    ) -> Arc<EmbeddingWorker> {
        EmbeddingWorker::new(
            pool,
            Some(Arc::new(EmbeddingClient::mock(mock))),
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn enqueue_deduplicates_pending_ids() {
        let (pool, id) = pool_with_observation("t", "b").await;
        let worker = worker_with(pool, MockEmbeddings::new());

        worker.enqueue(id);
        worker.enqueue(id);
        let stats = worker.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn successful_processing_stores_vector() {
        let (pool, id) = pool_with_observation("cache design", "we picked an LRU").await;
        let worker = worker_with(pool.clone(), MockEmbeddings::new());

        worker.enqueue(id);
        assert!(worker.process_next().await);
        assert!(!worker.process_next().await, "queue drained");

        let has = pool
            .interact_raw(move |conn| has_vector_sync(conn, id))
            .await
            .unwrap();
        assert!(has);
        assert_eq!(worker.stats().processed, 1);
    }

    #[tokio::test]
    async fn already_embedded_ids_are_skipped() {
        let (pool, id) = pool_with_observation("t", "b").await;
        pool.interact_raw(move |conn| store_vector_sync(conn, id, &[1.0], "m"))
            .await
            .unwrap();
        let worker = worker_with(pool, MockEmbeddings::new());

        worker.enqueue(id);
        assert!(worker.process_next().await);
        let stats = worker.stats();
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_write_dead_letter() {
        let (pool, id) = pool_with_observation("t", "b").await;
        // Fails more times than the attempt budget
        let worker = worker_with(pool.clone(), MockEmbeddings::failing_first(10));

        worker.enqueue(id);
        // Attempts 1 and 2 requeue, attempt 3 dead-letters
        for _ in 0..MAX_ATTEMPTS {
            assert!(worker.process_next().await);
        }
        assert!(!worker.process_next().await, "nothing left after exhaustion");

        let stats = worker.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, (MAX_ATTEMPTS - 1) as u64);

        let (queue, reason): (String, String) = pool
            .interact_raw(|conn| {
                conn.query_row(
                    "SELECT queue_name, reason FROM dead_letters",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!(queue, QUEUE_NAME);
        assert_eq!(reason, EXHAUSTED_REASON);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let (pool, id) = pool_with_observation("t", "b").await;
        let worker = worker_with(pool.clone(), MockEmbeddings::failing_first(1));

        worker.enqueue(id);
        assert!(worker.process_next().await); // fails, requeued
        assert!(worker.process_next().await); // succeeds

        let has = pool
            .interact_raw(move |conn| has_vector_sync(conn, id))
            .await
            .unwrap();
        assert!(has);
        let stats = worker.stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn backfill_enqueues_only_missing() {
        let (pool, with_vector) = pool_with_observation("a", "a").await;
        pool.interact(|conn| {
            Ok(test_support::insert_observation(
                conn, "s-1", "proj", "b", "b", 2_000,
            ))
        })
        .await
        .unwrap();
        pool.interact_raw(move |conn| store_vector_sync(conn, with_vector, &[1.0], "m"))
            .await
            .unwrap();

        let worker = worker_with(pool, MockEmbeddings::new());
        let queued = worker.backfill(50).await.unwrap();
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn semantic_search_ranks_identical_text_first() {
        let (pool, close) = pool_with_observation("retry queue budget", "bounded retries").await;
        let far = pool
            .interact(|conn| {
                Ok(test_support::insert_observation(
                    conn,
                    "s-1",
                    "proj",
                    "zzzz",
                    "1234567890",
                    2_000,
                ))
            })
            .await
            .unwrap();

        let worker = worker_with(pool.clone(), MockEmbeddings::new());
        worker.enqueue(close);
        worker.enqueue(far);
        while worker.process_next().await {}

        let scores = worker
            .semantic_search("retry queue budget bounded retries", "proj", 10)
            .await
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[&close] > scores[&far]);
        assert!((scores[&close] - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn disabled_worker_reports_not_enabled() {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let worker = EmbeddingWorker::new(pool, None, Duration::from_millis(1));
        assert!(!worker.enabled());
        assert!(worker.semantic_search("q", "p", 5).await.unwrap().is_empty());
    }
}
