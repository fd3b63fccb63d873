// db/cleanup.rs
// Retention cleanup and full purge
//
// Purge deletes in dependency order: messages → prompts → vectors → memories
// → observations → summaries → sessions, then sync bookkeeping.

use rusqlite::{Connection, params};
use serde::Serialize;

use crate::utils::now_ms;

/// What a cleanup pass removed (or would remove, when dry-run).
#[derive(Debug, Default, Clone, Serialize)]
pub struct CleanupReport {
    pub expired_memories: i64,
    pub excess_memories: i64,
    pub dry_run: bool,
}

/// Trim a project's memories to a count budget and an age window.
pub fn cleanup_project_sync(
    conn: &Connection,
    project: &str,
    max_memories: Option<usize>,
    max_age_days: Option<u32>,
    dry_run: bool,
) -> rusqlite::Result<CleanupReport> {
    let mut report = CleanupReport {
        dry_run,
        ..Default::default()
    };

    if let Some(days) = max_age_days {
        let cutoff = now_ms() - (days as i64) * 86_400_000;
        if dry_run {
            report.expired_memories = conn.query_row(
                "SELECT COUNT(*) FROM memories WHERE project = ?1 AND created_at_ms < ?2",
                params![project, cutoff],
                |row| row.get(0),
            )?;
        } else {
            report.expired_memories = conn.execute(
                "DELETE FROM memories WHERE project = ?1 AND created_at_ms < ?2",
                params![project, cutoff],
            )? as i64;
        }
    }

    if let Some(max) = max_memories {
        let excess_sql = "SELECT COUNT(*) FROM memories
             WHERE project = ?1 AND id NOT IN (
                SELECT id FROM memories WHERE project = ?1
                ORDER BY created_at_ms DESC LIMIT ?2
             )";
        if dry_run {
            report.excess_memories = conn.query_row(
                excess_sql,
                params![project, max as i64],
                |row| row.get(0),
            )?;
        } else {
            report.excess_memories = conn.execute(
                "DELETE FROM memories
                 WHERE project = ?1 AND id NOT IN (
                    SELECT id FROM memories WHERE project = ?1
                    ORDER BY created_at_ms DESC LIMIT ?2
                 )",
                params![project, max as i64],
            )? as i64;
        }
    }

    Ok(report)
}

/// Rows removed by a purge, per table.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PurgeReport {
    pub messages: i64,
    pub prompts: i64,
    pub vectors: i64,
    pub memories: i64,
    pub observations: i64,
    pub summaries: i64,
    pub sessions: i64,
    pub sync_rows: i64,
}

/// Purge one project's rows, or every table when `project` is None.
pub fn purge_sync(conn: &Connection, project: Option<&str>) -> rusqlite::Result<PurgeReport> {
    let tx = conn.unchecked_transaction()?;
    let mut report = PurgeReport::default();

    match project {
        Some(project) => {
            report.messages = tx.execute(
                "DELETE FROM pending_messages WHERE entity_id IN
                    (SELECT id FROM sessions WHERE project = ?1)",
                [project],
            )? as i64;
            report.prompts = tx.execute(
                "DELETE FROM user_prompts WHERE session_id IN
                    (SELECT id FROM sessions WHERE project = ?1)",
                [project],
            )? as i64;
            report.vectors = tx.execute(
                "DELETE FROM observation_vectors WHERE observation_id IN
                    (SELECT id FROM observations WHERE project = ?1)",
                [project],
            )? as i64;
            report.memories =
                tx.execute("DELETE FROM memories WHERE project = ?1", [project])? as i64;
            report.sync_rows += tx.execute(
                "DELETE FROM sync_state WHERE state_key IN
                    (SELECT 'chroma.hash.observation.' || id FROM observations WHERE project = ?1)",
                [project],
            )? as i64;
            report.observations =
                tx.execute("DELETE FROM observations WHERE project = ?1", [project])? as i64;
            report.summaries = tx.execute(
                "DELETE FROM summaries WHERE session_id IN
                    (SELECT id FROM sessions WHERE project = ?1)",
                [project],
            )? as i64;
            report.sessions =
                tx.execute("DELETE FROM sessions WHERE project = ?1", [project])? as i64;
            report.sync_rows += tx.execute(
                "DELETE FROM sync_state WHERE state_key = 'chroma.cursor.' || ?1",
                [project],
            )? as i64;
        }
        None => {
            report.messages = tx.execute("DELETE FROM pending_messages", [])? as i64;
            report.prompts = tx.execute("DELETE FROM user_prompts", [])? as i64;
            report.vectors = tx.execute("DELETE FROM observation_vectors", [])? as i64;
            report.memories = tx.execute("DELETE FROM memories", [])? as i64;
            report.observations = tx.execute("DELETE FROM observations", [])? as i64;
            report.summaries = tx.execute("DELETE FROM summaries", [])? as i64;
            report.sessions = tx.execute("DELETE FROM sessions", [])? as i64;
            report.sync_rows = tx.execute("DELETE FROM sync_state", [])? as i64;
            tx.execute("DELETE FROM sync_runs", [])?;
            tx.execute("DELETE FROM processed_events", [])?;
            tx.execute("DELETE FROM dead_letters", [])?;
        }
    }

    tx.commit()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{insert_observation, setup_test_connection};

    fn seed_memory(conn: &Connection, id: &str, project: &str, created_at_ms: i64) {
        conn.execute(
            "INSERT INTO memories (id, project, content, kind, created_at_ms)
             VALUES (?1, ?2, 'c', 'general', ?3)",
            params![id, project, created_at_ms],
        )
        .unwrap();
    }

    #[test]
    fn cleanup_trims_by_age_and_count() {
        let conn = setup_test_connection();
        let now = now_ms();
        seed_memory(&conn, "ancient", "proj", 1000);
        seed_memory(&conn, "mid", "proj", now - 1000);
        seed_memory(&conn, "new", "proj", now);

        let report = cleanup_project_sync(&conn, "proj", Some(1), Some(30), false).unwrap();
        assert_eq!(report.expired_memories, 1);
        assert_eq!(report.excess_memories, 1);

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
        let kept: String = conn
            .query_row("SELECT id FROM memories", [], |r| r.get(0))
            .unwrap();
        assert_eq!(kept, "new");
    }

    #[test]
    fn cleanup_dry_run_deletes_nothing() {
        let conn = setup_test_connection();
        seed_memory(&conn, "old", "proj", 1000);

        let report = cleanup_project_sync(&conn, "proj", None, Some(30), true).unwrap();
        assert_eq!(report.expired_memories, 1);
        assert!(report.dry_run);

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn project_purge_spares_other_projects() {
        let conn = setup_test_connection();
        let kept = insert_observation(&conn, "s-keep", "other", "kept", "kept", 1000);
        let gone = insert_observation(&conn, "s-gone", "proj", "gone", "gone", 1000);
        crate::db::observations::insert_user_prompt_sync(&conn, "s-gone", "hi").unwrap();
        crate::db::vectors::store_vector_sync(&conn, gone, &[1.0], "m").unwrap();
        seed_memory(&conn, "m-gone", "proj", 1000);
        crate::db::sync::set_sync_state_sync(
            &conn,
            &crate::db::sync::observation_hash_key("chroma", gone),
            "h",
        )
        .unwrap();
        crate::db::sync::set_sync_state_sync(&conn, "chroma.cursor.proj", "5").unwrap();

        let report = purge_sync(&conn, Some("proj")).unwrap();
        assert_eq!(report.observations, 1);
        assert_eq!(report.sessions, 1);
        assert_eq!(report.vectors, 1);
        assert_eq!(report.memories, 1);
        assert_eq!(report.sync_rows, 2);

        let other: i64 = conn
            .query_row("SELECT COUNT(*) FROM observations WHERE id = ?1", [kept], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(other, 1);
    }

    #[test]
    fn full_purge_empties_all_tables() {
        let conn = setup_test_connection();
        insert_observation(&conn, "s-1", "proj", "t", "b", 1000);
        seed_memory(&conn, "m", "proj", 1000);
        crate::db::queue::insert_dead_letter_sync(&conn, "q", "e", "{}", "r").unwrap();

        purge_sync(&conn, None).unwrap();

        for table in [
            "pending_messages",
            "user_prompts",
            "observation_vectors",
            "memories",
            "observations",
            "summaries",
            "sessions",
            "sync_state",
            "dead_letters",
        ] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should be empty");
        }
    }
}
