// src/session_service.rs
// Session lifecycle: init/complete plus summary compilation on close

use std::sync::Arc;

use crate::db::DatabasePool;
use crate::db::sessions::{
    SummaryFields, complete_session_sync, upsert_session_sync, upsert_summary_sync,
};
use crate::db::types::{OBSERVATION_COLUMNS, Observation, SessionStatus, parse_observation_row};
use crate::error::Result;
use crate::events::{EventBroadcaster, EventKind};
use crate::utils::truncate_chars;

/// Field caps applied when compiling rubric text.
const REQUEST_CAP: usize = 500;
const FIELD_CAP: usize = 1_000;

pub struct SessionService {
    pool: Arc<DatabasePool>,
    broadcaster: Arc<EventBroadcaster>,
}

impl SessionService {
    pub fn new(pool: Arc<DatabasePool>, broadcaster: Arc<EventBroadcaster>) -> Self {
        Self { pool, broadcaster }
    }

    /// Open (or re-open) a session in the active state.
    pub async fn init_session(&self, session_id: &str, project: &str) -> Result<()> {
        let sid = session_id.to_string();
        let proj = project.to_string();
        self.pool
            .run(move |conn| upsert_session_sync(conn, &sid, &proj))
            .await?;

        self.broadcaster.broadcast(
            EventKind::SessionInit,
            serde_json::json!({ "sessionId": session_id, "project": project }),
            Some(project),
            Some(session_id),
        );
        Ok(())
    }

    /// Close a session and compile its summary.
    ///
    /// Returns whether the status transition happened (false when the session
    /// was already terminal or unknown). Summary compilation is best-effort:
    /// its failure never fails the close.
    pub async fn complete_session(
        &self,
        session_id: &str,
        project: &str,
        status: SessionStatus,
    ) -> Result<bool> {
        let sid = session_id.to_string();
        let completed = self
            .pool
            .run(move |conn| complete_session_sync(conn, &sid, status))
            .await?;

        if completed {
            if let Err(e) = self.generate_summary(session_id).await {
                tracing::warn!(session_id, "summary generation failed (non-fatal): {}", e);
            }
            self.broadcaster.broadcast(
                EventKind::SessionComplete,
                serde_json::json!({
                    "sessionId": session_id,
                    "project": project,
                    "status": status.as_str(),
                }),
                Some(project),
                Some(session_id),
            );
        }
        Ok(completed)
    }

    /// Compile the five-rubric summary from the session's observations.
    pub async fn generate_summary(&self, session_id: &str) -> Result<()> {
        let sid = session_id.to_string();
        let observations = self
            .pool
            .run(move |conn| -> rusqlite::Result<Vec<Observation>> {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {OBSERVATION_COLUMNS} FROM observations
                     WHERE session_id = ?1
                     ORDER BY created_at_ms ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map([&sid], parse_observation_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        if observations.is_empty() {
            return Ok(());
        }

        let fields = compile_summary(&observations);
        let sid = session_id.to_string();
        self.pool
            .run(move |conn| upsert_summary_sync(conn, &sid, &fields))
            .await?;
        Ok(())
    }
}

/// Map observations into the five rubric fields by kind.
///
/// task/workflow → request, research/fact → investigated, learning/decision
/// → learned, bugfix/completed → completed. Everything else is ignored.
pub fn compile_summary(observations: &[Observation]) -> SummaryFields {
    let mut request = Vec::new();
    let mut investigated = Vec::new();
    let mut learned = Vec::new();
    let mut completed = Vec::new();

    for obs in observations {
        match obs.kind.as_str() {
            "task" | "workflow" => request.push(obs.title.as_str()),
            "research" | "fact" => investigated.push(obs.title.as_str()),
            "learning" | "decision" => learned.push(obs.title.as_str()),
            "bugfix" | "completed" => completed.push(obs.title.as_str()),
            _ => {}
        }
    }

    let join = |titles: Vec<&str>, cap: usize| {
        if titles.is_empty() {
            None
        } else {
            Some(truncate_chars(&titles.join("; "), cap))
        }
    };

    SummaryFields {
        request: join(request, REQUEST_CAP),
        investigated: join(investigated, FIELD_CAP),
        learned: join(learned, FIELD_CAP),
        completed: join(completed, FIELD_CAP),
        next_steps: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sessions::get_summary_sync;
    use crate::db::test_support;

    fn observation(kind: &str, title: &str) -> Observation {
        Observation {
            id: 0,
            session_id: "s-1".to_string(),
            project: "proj".to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            subtitle: None,
            text: String::new(),
            facts: vec![],
            files_read: vec![],
            files_modified: vec![],
            prompt_number: 1,
            created_at_ms: 0,
        }
    }

    #[test]
    fn kinds_map_to_rubrics() {
        let fields = compile_summary(&[
            observation("task", "ship the feature"),
            observation("fact", "the cache is global"),
            observation("decision", "we keep sqlite"),
            observation("bugfix", "fixed the race"),
            observation("general", "noise"),
        ]);
        assert_eq!(fields.request.as_deref(), Some("ship the feature"));
        assert_eq!(fields.investigated.as_deref(), Some("the cache is global"));
        assert_eq!(fields.learned.as_deref(), Some("we keep sqlite"));
        assert_eq!(fields.completed.as_deref(), Some("fixed the race"));
        assert!(fields.next_steps.is_none());
    }

    #[test]
    fn request_field_caps_at_500_chars() {
        let long_title = "t".repeat(600);
        let fields = compile_summary(&[observation("workflow", &long_title)]);
        assert_eq!(fields.request.unwrap().chars().count(), 500);
    }

    #[test]
    fn other_fields_cap_at_1000_chars() {
        let long_title = "t".repeat(1_200);
        let fields = compile_summary(&[observation("learning", &long_title)]);
        assert_eq!(fields.learned.unwrap().chars().count(), 1_000);
    }

    #[tokio::test]
    async fn complete_compiles_summary_once() {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let service = SessionService::new(pool.clone(), EventBroadcaster::new());

        service.init_session("s-1", "proj").await.unwrap();
        pool.interact(|conn| {
            conn.execute(
                "INSERT INTO observations
                    (session_id, project, kind, title, body, prompt_number, created_at_ms)
                 VALUES ('s-1', 'proj', 'bugfix', 'fixed the leak', 'details', 1, 1000)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        assert!(
            service
                .complete_session("s-1", "proj", SessionStatus::Completed)
                .await
                .unwrap()
        );
        // Second completion is a no-op
        assert!(
            !service
                .complete_session("s-1", "proj", SessionStatus::Failed)
                .await
                .unwrap()
        );

        let summary = pool
            .interact_raw(|conn| get_summary_sync(conn, "s-1"))
            .await
            .unwrap()
            .expect("summary written");
        assert_eq!(summary.completed.as_deref(), Some("fixed the leak"));
    }

    #[tokio::test]
    async fn sessions_without_observations_get_no_summary() {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let service = SessionService::new(pool.clone(), EventBroadcaster::new());

        service.init_session("s-1", "proj").await.unwrap();
        service
            .complete_session("s-1", "proj", SessionStatus::Completed)
            .await
            .unwrap();

        let summary = pool
            .interact_raw(|conn| get_summary_sync(conn, "s-1"))
            .await
            .unwrap();
        assert!(summary.is_none());
    }

    #[tokio::test]
    async fn summary_requires_session_row() {
        // Summary FK references sessions; compile path only runs post-complete
        let conn = test_support::setup_test_connection();
        test_support::insert_session(&conn, "s-1", "proj");
        complete_session_sync(&conn, "s-1", SessionStatus::Completed).unwrap();
        upsert_summary_sync(&conn, "s-1", &SummaryFields::default()).unwrap();
        assert!(get_summary_sync(&conn, "s-1").unwrap().is_some());
    }
}
