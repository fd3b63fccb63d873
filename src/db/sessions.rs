// db/sessions.rs
// Session lifecycle rows and per-session summaries

use rusqlite::{Connection, OptionalExtension, params};

use super::log_and_discard;
use super::types::{Session, SessionStatus, Summary};
use crate::utils::now_ms;

/// Create or reset a session in the `active` state.
///
/// Keyed on session id; re-initializing an existing id restarts its clock.
pub fn upsert_session_sync(
    conn: &Connection,
    session_id: &str,
    project: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sessions (id, project, status, started_at_ms, completed_at_ms)
         VALUES (?1, ?2, 'active', ?3, NULL)",
        params![session_id, project, now_ms()],
    )?;
    Ok(())
}

/// Create a session on first reference without disturbing an existing row.
pub fn ensure_session_sync(
    conn: &Connection,
    session_id: &str,
    project: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO sessions (id, project, status, started_at_ms)
         VALUES (?1, ?2, 'active', ?3)",
        params![session_id, project, now_ms()],
    )?;
    Ok(())
}

/// Move an active session to a terminal state. Returns false when the session
/// was already terminal (completion happens exactly once) or does not exist.
pub fn complete_session_sync(
    conn: &Connection,
    session_id: &str,
    status: SessionStatus,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE sessions SET status = ?1, completed_at_ms = ?2
         WHERE id = ?3 AND status = 'active'",
        params![status.as_str(), now_ms(), session_id],
    )?;
    Ok(changed > 0)
}

pub fn get_session_sync(conn: &Connection, session_id: &str) -> rusqlite::Result<Option<Session>> {
    conn.query_row(
        "SELECT id, project, status, started_at_ms, completed_at_ms
         FROM sessions WHERE id = ?1",
        [session_id],
        parse_session_row,
    )
    .optional()
}

fn parse_session_row(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let status: String = row.get(2)?;
    Ok(Session {
        id: row.get(0)?,
        project: row.get(1)?,
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Active),
        started_at_ms: row.get(3)?,
        completed_at_ms: row.get(4)?,
    })
}

pub fn count_sessions_sync(conn: &Connection, project: Option<&str>) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE (?1 IS NULL OR project = ?1)",
        [project],
        |row| row.get(0),
    )
}

/// Rubric fields for a compiled session summary.
#[derive(Debug, Default, Clone)]
pub struct SummaryFields {
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
}

/// Write the session summary, replacing any previous one (at most one per session).
pub fn upsert_summary_sync(
    conn: &Connection,
    session_id: &str,
    fields: &SummaryFields,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO summaries
            (session_id, request, investigated, learned, completed, next_steps, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(session_id) DO UPDATE SET
            request = excluded.request,
            investigated = excluded.investigated,
            learned = excluded.learned,
            completed = excluded.completed,
            next_steps = excluded.next_steps,
            created_at_ms = excluded.created_at_ms",
        params![
            session_id,
            fields.request,
            fields.investigated,
            fields.learned,
            fields.completed,
            fields.next_steps,
            now_ms(),
        ],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM summaries WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub fn get_summary_sync(conn: &Connection, session_id: &str) -> rusqlite::Result<Option<Summary>> {
    conn.query_row(
        "SELECT id, session_id, request, investigated, learned, completed, next_steps, created_at_ms
         FROM summaries WHERE session_id = ?1",
        [session_id],
        |row| {
            Ok(Summary {
                id: row.get(0)?,
                session_id: row.get(1)?,
                request: row.get(2)?,
                investigated: row.get(3)?,
                learned: row.get(4)?,
                completed: row.get(5)?,
                next_steps: row.get(6)?,
                created_at_ms: row.get(7)?,
            })
        },
    )
    .optional()
}

/// Recent sessions for a project (diagnostics surface).
pub fn recent_sessions_sync(
    conn: &Connection,
    project: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Session>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, project, status, started_at_ms, completed_at_ms
         FROM sessions
         WHERE project = ?1
         ORDER BY started_at_ms DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![project, limit as i64], parse_session_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}
