// src/replicator.rs
// Cursor-driven replication of observations into an external vector store
//
// Each run scans observations past the per-project cursor, upserts them into
// a Chroma-style HTTP collection, and records per-observation content hashes
// so silent divergence shows up as a conflict count. Upserts that exhaust
// their retry budget land in the `chroma_sync` dead-letter queue for manual
// replay; the cursor still advances so one poison record cannot wedge the
// loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::db::DatabasePool;
use crate::db::observations::observations_after_id_sync;
use crate::db::queue::{delete_dead_letter_sync, get_dead_letters_sync, insert_dead_letter_sync};
use crate::db::sync::{
    SyncCounters, cursor_key, finish_sync_run_sync, get_sync_state_sync, observation_hash_key,
    set_sync_state_sync, start_sync_run_sync,
};
use crate::db::types::{Observation, SyncRunStatus};
use crate::embeddings::EmbeddingClient;

/// Provider identifier used for state keys and run rows.
pub const PROVIDER: &str = "chroma";

/// Dead-letter queue for exhausted upserts.
pub const SYNC_QUEUE: &str = "chroma_sync";

/// Upsert retry budget: 3 attempts, 200 ms × attempt backoff.
const UPSERT_ATTEMPTS: u32 = 3;
const UPSERT_BACKOFF: Duration = Duration::from_millis(200);

/// Outbound HTTP timeout for vector-store calls.
const TIMEOUT: Duration = Duration::from_secs(3);

/// One record shipped to the external collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertRecord {
    pub id: String,
    pub document: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub metadata: serde_json::Value,
}

impl UpsertRecord {
    fn from_observation(obs: &Observation, embedding: Vec<f32>) -> Self {
        Self {
            id: format!("observation-{}", obs.id),
            document: format!("{} {}", obs.title, obs.text),
            embedding,
            metadata: serde_json::json!({
                "project": obs.project,
                "sessionId": obs.session_id,
                "type": obs.kind,
                "createdAtMs": obs.created_at_ms,
            }),
        }
    }
}

/// Chroma-style HTTP collection endpoint.
pub struct HttpVectorStore {
    base_url: String,
    collection: String,
    http_client: reqwest::Client,
}

impl HttpVectorStore {
    pub fn new(base_url: String, collection: String) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url,
            collection,
            http_client,
        }
    }

    fn collection_url(&self, action: &str) -> String {
        format!(
            "{}/api/v1/collections/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.collection,
            action
        )
    }

    async fn upsert(&self, record: &UpsertRecord) -> Result<()> {
        let body = serde_json::json!({
            "ids": [record.id],
            "documents": [record.document],
            "embeddings": [record.embedding],
            "metadatas": [record.metadata],
        });
        let response = self
            .http_client
            .post(self.collection_url("upsert"))
            .json(&body)
            .send()
            .await
            .context("vector store upsert failed")?;
        if !response.status().is_success() {
            bail!("vector store upsert returned {}", response.status());
        }
        Ok(())
    }

    async fn delete_by_project(&self, project: &str) -> Result<()> {
        let body = serde_json::json!({ "where": { "project": project } });
        let response = self
            .http_client
            .post(self.collection_url("delete"))
            .json(&body)
            .send()
            .await
            .context("vector store delete failed")?;
        if !response.status().is_success() {
            bail!("vector store delete returned {}", response.status());
        }
        Ok(())
    }
}

enum StoreBackend {
    Http(HttpVectorStore),
    #[cfg(test)]
    Mock(mock::MockVectorStore),
}

/// External vector collection handle.
pub struct VectorStoreClient {
    backend: StoreBackend,
}

impl VectorStoreClient {
    pub fn http(base_url: String, collection: String) -> Self {
        Self {
            backend: StoreBackend::Http(HttpVectorStore::new(base_url, collection)),
        }
    }

    #[cfg(test)]
    pub fn mock(mock: mock::MockVectorStore) -> Self {
        Self {
            backend: StoreBackend::Mock(mock),
        }
    }

    async fn upsert(&self, record: &UpsertRecord) -> Result<()> {
        match &self.backend {
            StoreBackend::Http(c) => c.upsert(record).await,
            #[cfg(test)]
            StoreBackend::Mock(m) => m.upsert(record),
        }
    }

    async fn delete_by_project(&self, project: &str) -> Result<()> {
        match &self.backend {
            StoreBackend::Http(c) => c.delete_by_project(project).await,
            #[cfg(test)]
            StoreBackend::Mock(m) => m.delete_by_project(project),
        }
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncReport {
    pub synced: i64,
    pub failed: i64,
    pub conflicts: i64,
    pub retries: i64,
    pub duration_ms: u64,
    /// True when the pass was skipped (sync in flight or store unconfigured).
    pub skipped: bool,
}

/// Outcome of a dead-letter replay.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReplayReport {
    pub replayed: i64,
    pub failed: i64,
}

pub struct Replicator {
    pool: Arc<DatabasePool>,
    store: Option<VectorStoreClient>,
    embeddings: Option<Arc<EmbeddingClient>>,
    batch_size: usize,
    sync_interval: Duration,
    is_syncing: AtomicBool,
}

impl Replicator {
    pub fn new(
        pool: Arc<DatabasePool>,
        store: Option<VectorStoreClient>,
        embeddings: Option<Arc<EmbeddingClient>>,
        batch_size: usize,
        sync_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            store,
            embeddings,
            batch_size,
            sync_interval,
            is_syncing: AtomicBool::new(false),
        })
    }

    pub fn configured(&self) -> bool {
        self.store.is_some()
    }

    /// Periodic sync loop; a no-op without a configured store URL.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.store.is_none() {
            tracing::info!("replicator idle: no vector store configured");
            return;
        }
        tracing::info!("replicator started");
        let mut ticker = tokio::time::interval(self.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync(None).await {
                        Ok(report) if !report.skipped && report.synced > 0 => {
                            tracing::info!(
                                synced = report.synced,
                                failed = report.failed,
                                conflicts = report.conflicts,
                                "replication pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("replication pass failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("replicator shutting down");
    }

    /// One sync pass. Non-reentrant: a call during an in-flight pass returns
    /// immediately with `skipped = true`.
    pub async fn sync(&self, project: Option<&str>) -> Result<SyncReport> {
        let Some(store) = self.store.as_ref() else {
            return Ok(SyncReport {
                skipped: true,
                ..Default::default()
            });
        };
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(SyncReport {
                skipped: true,
                ..Default::default()
            });
        }
        let result = self.sync_inner(store, project).await;
        self.is_syncing.store(false, Ordering::Release);
        result
    }

    async fn sync_inner(
        &self,
        store: &VectorStoreClient,
        project: Option<&str>,
    ) -> Result<SyncReport> {
        let started = std::time::Instant::now();
        let project_owned = project.map(|s| s.to_string());

        let run_project = project_owned.clone();
        let run_id = self
            .pool
            .interact_raw(move |conn| start_sync_run_sync(conn, PROVIDER, run_project.as_deref()))
            .await?;

        let key = cursor_key(PROVIDER, project);
        let key_for_read = key.clone();
        let cursor: i64 = self
            .pool
            .interact_raw(move |conn| get_sync_state_sync(conn, &key_for_read))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let batch_size = self.batch_size;
        let scan_project = project_owned.clone();
        let observations = self
            .pool
            .interact_raw(move |conn| {
                observations_after_id_sync(conn, cursor, scan_project.as_deref(), batch_size)
            })
            .await?;

        let mut counters = SyncCounters::default();
        let mut max_seen_id = cursor;

        for obs in &observations {
            let current_hash = content_hash(obs);
            let hash_key = observation_hash_key(PROVIDER, obs.id);

            let hash_key_read = hash_key.clone();
            let stored_hash = self
                .pool
                .interact_raw(move |conn| get_sync_state_sync(conn, &hash_key_read))
                .await?;
            if let Some(stored) = stored_hash {
                if stored != current_hash {
                    counters.conflicts += 1;
                    tracing::warn!(
                        observation_id = obs.id,
                        "content hash conflict, re-upserting"
                    );
                }
            }

            let embedding = match self.embeddings.as_ref() {
                Some(client) => client
                    .embed(&format!("{} {}", obs.title, obs.text))
                    .await
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            let record = UpsertRecord::from_observation(obs, embedding);

            match upsert_with_retry(store, &record, &mut counters.retries).await {
                Ok(()) => {
                    counters.synced += 1;
                    let hash = current_hash.clone();
                    self.pool
                        .interact_raw(move |conn| set_sync_state_sync(conn, &hash_key, &hash))
                        .await?;
                }
                Err(e) => {
                    counters.failed += 1;
                    tracing::warn!(observation_id = obs.id, "upsert exhausted retries: {}", e);
                    let payload = serde_json::to_string(&record)?;
                    let entity = obs.id.to_string();
                    let reason = e.to_string();
                    self.pool
                        .interact_raw(move |conn| {
                            insert_dead_letter_sync(conn, SYNC_QUEUE, &entity, &payload, &reason)
                        })
                        .await?;
                }
            }
            max_seen_id = max_seen_id.max(obs.id);
        }

        if max_seen_id > cursor {
            let value = max_seen_id.to_string();
            self.pool
                .interact_raw(move |conn| set_sync_state_sync(conn, &key, &value))
                .await?;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let status = if counters.failed > 0 {
            SyncRunStatus::Failed
        } else {
            SyncRunStatus::Success
        };
        let details = serde_json::json!({ "durationMs": duration_ms }).to_string();
        self.pool
            .interact_raw(move |conn| {
                finish_sync_run_sync(conn, run_id, status, counters, Some(&details))
            })
            .await?;

        Ok(SyncReport {
            synced: counters.synced,
            failed: counters.failed,
            conflicts: counters.conflicts,
            retries: counters.retries,
            duration_ms,
            skipped: false,
        })
    }

    /// Re-attempt the oldest dead-lettered upserts, deleting letters that succeed.
    pub async fn replay_failed(&self, limit: usize) -> Result<ReplayReport> {
        let Some(store) = self.store.as_ref() else {
            return Ok(ReplayReport::default());
        };

        let letters = self
            .pool
            .interact_raw(move |conn| get_dead_letters_sync(conn, Some(SYNC_QUEUE), limit))
            .await?;

        let mut report = ReplayReport::default();
        for letter in letters {
            let record: UpsertRecord = match serde_json::from_str(&letter.payload) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(letter_id = letter.id, "unreadable dead letter: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            match store.upsert(&record).await {
                Ok(()) => {
                    let id = letter.id;
                    self.pool
                        .interact_raw(move |conn| delete_dead_letter_sync(conn, id))
                        .await?;
                    report.replayed += 1;
                }
                Err(e) => {
                    tracing::debug!(letter_id = letter.id, "replay failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Best-effort remote delete of a project's records plus cursor reset.
    pub async fn delete_by_project(&self, project: &str) -> Result<()> {
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.delete_by_project(project).await {
                tracing::warn!(project, "remote delete failed (continuing): {}", e);
            }
        }
        let key = cursor_key(PROVIDER, Some(project));
        self.pool
            .interact_raw(move |conn| crate::db::sync::delete_sync_state_sync(conn, &key))
            .await?;
        Ok(())
    }
}

/// SHA-256 over the replicated fields, for conflict detection.
fn content_hash(obs: &Observation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(obs.kind.as_bytes());
    hasher.update(b"\n");
    hasher.update(obs.title.as_bytes());
    hasher.update(b"\n");
    hasher.update(obs.text.as_bytes());
    format!("{:x}", hasher.finalize())
}

async fn upsert_with_retry(
    store: &VectorStoreClient,
    record: &UpsertRecord,
    retries: &mut i64,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 1..=UPSERT_ATTEMPTS {
        match store.upsert(record).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt < UPSERT_ATTEMPTS {
                    *retries += 1;
                    tokio::time::sleep(UPSERT_BACKOFF * attempt).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("upsert failed")))
}

#[cfg(test)]
pub mod mock {
    //! In-memory vector store double for replication tests.

    use super::UpsertRecord;
    use anyhow::Result;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockVectorStore {
        fail_first: usize,
        attempts: AtomicUsize,
        records: Mutex<Vec<UpsertRecord>>,
        deleted_projects: Mutex<Vec<String>>,
    }

    impl MockVectorStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_first(fail_first: usize) -> Self {
            Self {
                fail_first,
                ..Default::default()
            }
        }

        pub fn upsert(&self, record: &UpsertRecord) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                anyhow::bail!("mock upsert failure {}", attempt + 1);
            }
            self.records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(record.clone());
            Ok(())
        }

        pub fn delete_by_project(&self, project: &str) -> Result<()> {
            self.deleted_projects
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(project.to_string());
            Ok(())
        }

        pub fn records(&self) -> Vec<UpsertRecord> {
            self.records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }

        pub fn deleted_projects(&self) -> Vec<String> {
            self.deleted_projects
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }
    }
}
