// src/ingest.rs
// Durable ingest pipeline: queue consumer and typed event dispatch
//
// Events arrive over HTTP, are validated into `IngestEvent`, and sit in the
// pending queue until this processor picks them up. Processing is idempotent
// by dedup key and safe under duplicate delivery; a handler error retries the
// message until its budget runs out, after which it is dead-lettered.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::RuntimeSettings;
use crate::db::DatabasePool;
use crate::db::observations::{
    NewObservation, insert_observation_sync, insert_user_prompt_sync,
};
use crate::db::queue::{
    get_ready_sync, increment_retry_sync, insert_dead_letter_sync, is_event_processed_sync,
    mark_event_processed_sync, mark_processed_sync,
};
use crate::db::sessions::ensure_session_sync;
use crate::db::types::{PendingMessage, SessionStatus};
use crate::embeddings::worker::EmbeddingWorker;
use crate::error::{MemError, Result};
use crate::events::{EventBroadcaster, EventKind};
use crate::session_service::SessionService;
use crate::utils::now_ms;

/// Queue consumed by this processor.
pub const INGEST_QUEUE: &str = "session_ingest";

/// Dead-letter reasons.
const REASON_EXHAUSTED: &str = "max_retries_exceeded";
const REASON_INVALID: &str = "invalid_payload";

/// Closed set of ingestible events. Unknown types fail validation at the API
/// boundary instead of being silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum IngestEvent {
    SessionStart {
        session_id: String,
        project: String,
    },
    SessionEnd {
        session_id: String,
        project: String,
        status: Option<String>,
    },
    Observation {
        session_id: String,
        project: String,
        data: ObservationPayload,
    },
    UserPrompt {
        session_id: String,
        project: String,
        data: PromptPayload,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObservationPayload {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub title: String,
    pub subtitle: Option<String>,
    pub text: String,
    pub facts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptPayload {
    pub text: String,
}

impl IngestEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStart { session_id, .. }
            | Self::SessionEnd { session_id, .. }
            | Self::Observation { session_id, .. }
            | Self::UserPrompt { session_id, .. } => session_id,
        }
    }

    pub fn project(&self) -> &str {
        match self {
            Self::SessionStart { project, .. }
            | Self::SessionEnd { project, .. }
            | Self::Observation { project, .. }
            | Self::UserPrompt { project, .. } => project,
        }
    }
}

/// Processor counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IngestStats {
    pub processed: u64,
    pub failed: u64,
}

pub struct IngestProcessor {
    pool: Arc<DatabasePool>,
    sessions: Arc<SessionService>,
    embeddings: Arc<EmbeddingWorker>,
    broadcaster: Arc<EventBroadcaster>,
    settings: Arc<RwLock<RuntimeSettings>>,
    batch_size: usize,
    retry_delay_ms: i64,
    poll_interval: Duration,
    processed: AtomicU64,
    failed: AtomicU64,
    ticking: AtomicBool,
}

impl IngestProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<DatabasePool>,
        sessions: Arc<SessionService>,
        embeddings: Arc<EmbeddingWorker>,
        broadcaster: Arc<EventBroadcaster>,
        settings: Arc<RwLock<RuntimeSettings>>,
        batch_size: usize,
        retry_delay_ms: i64,
        poll_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sessions,
            embeddings,
            broadcaster,
            settings,
            batch_size,
            retry_delay_ms,
            poll_interval,
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            ticking: AtomicBool::new(false),
        })
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Poll loop. A tick is skipped when the previous one is still running.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("ingest processor started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self
                        .ticking
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }
                    if let Err(e) = self.process_batch().await {
                        tracing::warn!("ingest batch failed: {}", e);
                    }
                    self.ticking.store(false, Ordering::Release);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("ingest processor shutting down");
    }

    /// Drain one batch from the queue. Returns how many messages succeeded.
    pub async fn process_batch(&self) -> Result<usize> {
        let batch_size = self.batch_size;
        let messages = self
            .pool
            .interact_raw(move |conn| get_ready_sync(conn, Some(INGEST_QUEUE), batch_size))
            .await?;

        let mut succeeded = 0;
        for message in messages {
            if self.process_message(&message).await {
                succeeded += 1;
            }
        }
        Ok(succeeded)
    }

    async fn process_message(&self, message: &PendingMessage) -> bool {
        let event: IngestEvent = match serde_json::from_str(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                // Parse failures are permanent; retrying cannot fix them.
                tracing::warn!(message_id = message.id, "unparseable ingest payload: {}", e);
                let id = message.id;
                let entity = message.entity_id.clone();
                let payload = message.payload.clone();
                let _ = self
                    .pool
                    .interact_raw(move |conn| {
                        insert_dead_letter_sync(conn, INGEST_QUEUE, &entity, &payload, REASON_INVALID)?;
                        mark_processed_sync(conn, id)
                    })
                    .await;
                self.failed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        // Idempotency: a processed dedup key means the work already happened.
        if let Some(ref dedup_key) = message.dedup_key {
            let key = dedup_key.clone();
            let already = self
                .pool
                .interact_raw(move |conn| is_event_processed_sync(conn, &key))
                .await
                .unwrap_or(false);
            if already {
                let id = message.id;
                let _ = self
                    .pool
                    .interact_raw(move |conn| mark_processed_sync(conn, id))
                    .await;
                return true;
            }
        }

        match self.handle(event).await {
            Ok(()) => {
                let id = message.id;
                let dedup = message.dedup_key.clone();
                let result = self
                    .pool
                    .interact_raw(move |conn| {
                        if let Some(ref key) = dedup {
                            mark_event_processed_sync(conn, key, INGEST_QUEUE, None, now_ms())?;
                        }
                        mark_processed_sync(conn, id)
                    })
                    .await;
                if let Err(e) = result {
                    tracing::warn!(message_id = message.id, "failed to finalize message: {}", e);
                    return false;
                }
                self.processed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(
                    message_id = message.id,
                    retry = message.retry_count,
                    "ingest handler failed: {}",
                    e
                );
                let id = message.id;
                let retry_delay = self.retry_delay_ms;
                let entity = message.entity_id.clone();
                let payload = message.payload.clone();
                let result = self
                    .pool
                    .interact_raw(move |conn| {
                        let will_retry = increment_retry_sync(conn, id, Some(retry_delay))?;
                        if !will_retry {
                            insert_dead_letter_sync(
                                conn,
                                INGEST_QUEUE,
                                &entity,
                                &payload,
                                REASON_EXHAUSTED,
                            )?;
                            mark_processed_sync(conn, id)?;
                        }
                        Ok(will_retry)
                    })
                    .await;
                if matches!(result, Ok(false)) {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                }
                false
            }
        }
    }

    async fn handle(&self, event: IngestEvent) -> Result<()> {
        match event {
            IngestEvent::SessionStart {
                session_id,
                project,
            } => {
                self.sessions.init_session(&session_id, &project).await?;
                self.broadcaster.broadcast(
                    EventKind::SessionStart,
                    serde_json::json!({ "sessionId": session_id, "project": project }),
                    Some(&project),
                    Some(&session_id),
                );
                Ok(())
            }
            IngestEvent::SessionEnd {
                session_id,
                project,
                status,
            } => {
                let status = match status.as_deref() {
                    None => SessionStatus::Completed,
                    Some(raw) => SessionStatus::parse(raw)
                        .filter(|s| *s != SessionStatus::Active)
                        .ok_or_else(|| {
                            MemError::InvalidInput(format!("invalid terminal status {raw:?}"))
                        })?,
                };
                self.sessions
                    .complete_session(&session_id, &project, status)
                    .await?;
                self.broadcaster.broadcast(
                    EventKind::SessionEnd,
                    serde_json::json!({
                        "sessionId": session_id,
                        "project": project,
                        "status": status.as_str(),
                    }),
                    Some(&project),
                    Some(&session_id),
                );
                Ok(())
            }
            IngestEvent::Observation {
                session_id,
                project,
                data,
            } => self.handle_observation(session_id, project, data).await,
            IngestEvent::UserPrompt {
                session_id,
                project,
                data,
            } => {
                let filter = self.privacy_filter();
                let text = filter.sanitize(&data.text)?.text;
                let sid = session_id.clone();
                let proj = project.clone();
                let (_, prompt_number) = self
                    .pool
                    .interact_raw(move |conn| {
                        ensure_session_sync(conn, &sid, &proj)?;
                        insert_user_prompt_sync(conn, &sid, &text)
                    })
                    .await?;
                self.broadcaster.broadcast(
                    EventKind::UserPrompt,
                    serde_json::json!({
                        "sessionId": session_id,
                        "project": project,
                        "promptNumber": prompt_number,
                    }),
                    Some(&project),
                    Some(&session_id),
                );
                Ok(())
            }
        }
    }

    async fn handle_observation(
        &self,
        session_id: String,
        project: String,
        data: ObservationPayload,
    ) -> Result<()> {
        let filter = self.privacy_filter();
        let title = filter.sanitize(&data.title)?.text;
        let text = filter.sanitize(&data.text)?.text;
        // Optional fields: a privacy rejection drops the field, not the event.
        let subtitle = data
            .subtitle
            .as_deref()
            .and_then(|s| filter.sanitize(s).ok())
            .map(|s| s.text);
        let facts: Vec<String> = data
            .facts
            .iter()
            .filter_map(|f| filter.sanitize(f).ok())
            .map(|s| s.text)
            .collect();

        let kind = data.kind.unwrap_or_else(|| "general".to_string());
        let sid = session_id.clone();
        let proj = project.clone();
        let explicit_prompt = data.prompt_number;
        let files_read = data.files_read.clone();
        let files_modified = data.files_modified.clone();
        let kind_for_event = kind.clone();
        let title_for_event = title.clone();

        let observation_id = self
            .pool
            .interact_raw(move |conn| {
                ensure_session_sync(conn, &sid, &proj)?;
                let prompt_number = match explicit_prompt {
                    Some(n) => n,
                    None => conn.query_row(
                        "SELECT COALESCE(MAX(prompt_number), 0) FROM user_prompts
                         WHERE session_id = ?1",
                        [&sid],
                        |row| row.get(0),
                    )?,
                };
                insert_observation_sync(
                    conn,
                    &NewObservation {
                        session_id: sid.clone(),
                        project: proj.clone(),
                        kind,
                        title,
                        subtitle,
                        text,
                        facts,
                        files_read,
                        files_modified,
                        prompt_number,
                    },
                )
            })
            .await?;

        self.embeddings.enqueue(observation_id);
        self.broadcaster.broadcast(
            EventKind::ObservationAdded,
            serde_json::json!({
                "id": observation_id,
                "sessionId": session_id,
                "project": project,
                "type": kind_for_event,
                "title": title_for_event,
            }),
            Some(&project),
            Some(&session_id),
        );
        Ok(())
    }

    fn privacy_filter(&self) -> crate::privacy::PrivacyFilter {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .privacy_filter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queue::{EnqueueParams, enqueue_sync};
    use crate::db::sessions::get_session_sync;

    async fn setup() -> (Arc<DatabasePool>, Arc<IngestProcessor>) {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let broadcaster = EventBroadcaster::new();
        let sessions = Arc::new(SessionService::new(pool.clone(), broadcaster.clone()));
        let embeddings = EmbeddingWorker::new(pool.clone(), None, Duration::from_millis(1));
        let processor = IngestProcessor::new(
            pool.clone(),
            sessions,
            embeddings,
            broadcaster,
            Arc::new(RwLock::new(RuntimeSettings::default())),
            20,
            0,
            Duration::from_millis(1_000),
        );
        (pool, processor)
    }

    async fn enqueue_event(
        pool: &Arc<DatabasePool>,
        event: &IngestEvent,
        dedup_key: Option<&str>,
        max_retries: Option<i64>,
    ) -> i64 {
        let payload = serde_json::to_string(event).unwrap();
        let entity = event.session_id().to_string();
        let dedup = dedup_key.map(|s| s.to_string());
        pool.interact_raw(move |conn| {
            enqueue_sync(
                conn,
                EnqueueParams {
                    queue_name: INGEST_QUEUE,
                    entity_id: &entity,
                    payload: &payload,
                    max_retries,
                    delay_ms: None,
                    dedup_key: dedup.as_deref(),
                },
            )
        })
        .await
        .unwrap()
    }

    fn observation_event(title: &str, text: &str) -> IngestEvent {
        IngestEvent::Observation {
            session_id: "s-1".to_string(),
            project: "proj".to_string(),
            data: ObservationPayload {
                kind: Some("decision".to_string()),
                title: title.to_string(),
                text: text.to_string(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn observation_event_lands_in_store() {
        let (pool, processor) = setup().await;
        enqueue_event(
            &pool,
            &observation_event("we chose sqlite", "embedded store wins"),
            Some("evt-1"),
            None,
        )
        .await;

        let succeeded = processor.process_batch().await.unwrap();
        assert_eq!(succeeded, 1);
        assert_eq!(processor.stats().processed, 1);

        let (count, title): (i64, String) = pool
            .interact_raw(|conn| {
                conn.query_row(
                    "SELECT COUNT(*), MAX(title) FROM observations",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(title, "we chose sqlite");

        // Message consumed, dedup key recorded, session auto-created
        let pending: i64 = pool
            .interact_raw(|conn| {
                conn.query_row("SELECT COUNT(*) FROM pending_messages", [], |r| r.get(0))
            })
            .await
            .unwrap();
        assert_eq!(pending, 0);
        let processed = pool
            .interact_raw(|conn| is_event_processed_sync(conn, "evt-1"))
            .await
            .unwrap();
        assert!(processed);
        let session = pool
            .interact_raw(|conn| get_session_sync(conn, "s-1"))
            .await
            .unwrap();
        assert!(session.is_some());
    }

    #[tokio::test]
    async fn processed_dedup_key_short_circuits_handler() {
        let (pool, processor) = setup().await;
        // Insert a pending row directly so the enqueue-side dedup can't reject it
        pool.interact_raw(|conn| {
            mark_event_processed_sync(conn, "seen-before", INGEST_QUEUE, None, 1)?;
            conn.execute(
                "INSERT INTO pending_messages
                    (queue_name, entity_id, payload, dedup_key, max_retries, created_at_ms)
                 VALUES (?1, 's-1', ?2, 'seen-before', 3, 1)",
                rusqlite::params![
                    INGEST_QUEUE,
                    serde_json::to_string(&IngestEvent::SessionStart {
                        session_id: "s-1".to_string(),
                        project: "proj".to_string(),
                    })
                    .unwrap()
                ],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        processor.process_batch().await.unwrap();

        // Handler never ran: no session row, but the message is gone
        let session = pool
            .interact_raw(|conn| get_session_sync(conn, "s-1"))
            .await
            .unwrap();
        assert!(session.is_none());
        let pending: i64 = pool
            .interact_raw(|conn| {
                conn.query_row("SELECT COUNT(*) FROM pending_messages", [], |r| r.get(0))
            })
            .await
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn failing_handler_exhausts_into_dead_letter() {
        let (pool, processor) = setup().await;
        // Fully-private text fails sanitation every attempt
        let event = observation_event("title", "<private>secret</private>");
        enqueue_event(&pool, &event, None, Some(2)).await;

        // Attempt 1: retry scheduled (delay 0 keeps it visible)
        processor.process_batch().await.unwrap();
        // Attempt 2: budget exhausted, dead letter written
        processor.process_batch().await.unwrap();

        let pending: i64 = pool
            .interact_raw(|conn| {
                conn.query_row("SELECT COUNT(*) FROM pending_messages", [], |r| r.get(0))
            })
            .await
            .unwrap();
        assert_eq!(pending, 0, "exhausted message removed from the queue");

        let (queue, reason): (String, String) = pool
            .interact_raw(|conn| {
                conn.query_row("SELECT queue_name, reason FROM dead_letters", [], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
            })
            .await
            .unwrap();
        assert_eq!(queue, INGEST_QUEUE);
        assert_eq!(reason, REASON_EXHAUSTED);
        assert!(processor.stats().failed > 0);
    }

    #[tokio::test]
    async fn unparseable_payload_dead_letters_immediately() {
        let (pool, processor) = setup().await;
        pool.interact_raw(|conn| {
            enqueue_sync(
                conn,
                EnqueueParams {
                    queue_name: INGEST_QUEUE,
                    entity_id: "s-1",
                    payload: r#"{"eventType":"mystery"}"#,
                    max_retries: None,
                    delay_ms: None,
                    dedup_key: None,
                },
            )
        })
        .await
        .unwrap();

        processor.process_batch().await.unwrap();

        let reason: String = pool
            .interact_raw(|conn| {
                conn.query_row("SELECT reason FROM dead_letters", [], |r| r.get(0))
            })
            .await
            .unwrap();
        assert_eq!(reason, REASON_INVALID);
        let pending: i64 = pool
            .interact_raw(|conn| {
                conn.query_row("SELECT COUNT(*) FROM pending_messages", [], |r| r.get(0))
            })
            .await
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn session_lifecycle_events_flow_through() {
        let (pool, processor) = setup().await;
        enqueue_event(
            &pool,
            &IngestEvent::SessionStart {
                session_id: "s-1".to_string(),
                project: "proj".to_string(),
            },
            None,
            None,
        )
        .await;
        processor.process_batch().await.unwrap();

        enqueue_event(
            &pool,
            &IngestEvent::SessionEnd {
                session_id: "s-1".to_string(),
                project: "proj".to_string(),
                status: Some("failed".to_string()),
            },
            None,
            None,
        )
        .await;
        processor.process_batch().await.unwrap();

        let session = pool
            .interact_raw(|conn| get_session_sync(conn, "s-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session.completed_at_ms.is_some());
    }

    #[tokio::test]
    async fn prompt_event_assigns_numbers_and_observation_inherits() {
        let (pool, processor) = setup().await;
        enqueue_event(
            &pool,
            &IngestEvent::UserPrompt {
                session_id: "s-1".to_string(),
                project: "proj".to_string(),
                data: PromptPayload {
                    text: "please fix the flaky test".to_string(),
                },
            },
            None,
            None,
        )
        .await;
        processor.process_batch().await.unwrap();

        enqueue_event(&pool, &observation_event("fixed it", "details"), None, None).await;
        processor.process_batch().await.unwrap();

        let prompt_number: i64 = pool
            .interact_raw(|conn| {
                conn.query_row(
                    "SELECT prompt_number FROM observations WHERE title = 'fixed it'",
                    [],
                    |r| r.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(prompt_number, 1, "observation inherits the latest prompt number");
    }

    #[test]
    fn unknown_event_type_fails_validation() {
        let raw = r#"{"eventType":"telemetry","sessionId":"s","project":"p"}"#;
        assert!(serde_json::from_str::<IngestEvent>(raw).is_err());
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = observation_event("t", "x");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"eventType\":\"observation\""));
        assert!(json.contains("\"sessionId\""));
        let back: IngestEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id(), "s-1");
    }
}
