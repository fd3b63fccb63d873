// db/observations.rs
// Append-only observation and user-prompt storage
//
// FTS mirroring is handled by the triggers installed in schema.rs; inserting
// here is enough to make a row searchable. Embedding enqueue and live-event
// broadcast happen in the repository wrapper (ingest layer), after commit.

use rusqlite::{Connection, OptionalExtension, params};

use super::log_and_discard;
use super::types::{
    OBSERVATION_COLUMNS, Observation, UserPrompt, json_string_list_column, parse_observation_row,
};
use crate::utils::now_ms;

/// Fields for a new observation. Text fields must already be sanitized.
pub struct NewObservation {
    pub session_id: String,
    pub project: String,
    pub kind: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub text: String,
    pub facts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: i64,
}

/// Insert one observation row. The FTS triggers mirror it synchronously.
pub fn insert_observation_sync(conn: &Connection, obs: &NewObservation) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO observations
            (session_id, project, kind, title, subtitle, body, facts,
             files_read, files_modified, prompt_number, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            obs.session_id,
            obs.project,
            obs.kind,
            obs.title,
            obs.subtitle,
            obs.text,
            json_string_list_column(&obs.facts),
            json_string_list_column(&obs.files_read),
            json_string_list_column(&obs.files_modified),
            obs.prompt_number,
            now_ms(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Insert a user prompt, assigning `prompt_number = max + 1` within the session.
pub fn insert_user_prompt_sync(
    conn: &Connection,
    session_id: &str,
    text: &str,
) -> rusqlite::Result<(i64, i64)> {
    let next_number: i64 = conn.query_row(
        "SELECT COALESCE(MAX(prompt_number), 0) + 1 FROM user_prompts WHERE session_id = ?1",
        [session_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO user_prompts (session_id, prompt_number, body, created_at_ms)
         VALUES (?1, ?2, ?3, ?4)",
        params![session_id, next_number, text, now_ms()],
    )?;
    Ok((conn.last_insert_rowid(), next_number))
}

/// All prompts of a session, ordered by prompt number.
pub fn prompts_for_session_sync(
    conn: &Connection,
    session_id: &str,
) -> rusqlite::Result<Vec<UserPrompt>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, session_id, prompt_number, body, created_at_ms
         FROM user_prompts
         WHERE session_id = ?1
         ORDER BY prompt_number ASC",
    )?;
    let rows = stmt
        .query_map([session_id], |row| {
            Ok(UserPrompt {
                id: row.get(0)?,
                session_id: row.get(1)?,
                prompt_number: row.get(2)?,
                text: row.get(3)?,
                created_at_ms: row.get(4)?,
            })
        })?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

pub fn get_observation_sync(conn: &Connection, id: i64) -> rusqlite::Result<Option<Observation>> {
    conn.query_row(
        &format!("SELECT {OBSERVATION_COLUMNS} FROM observations WHERE id = ?1"),
        [id],
        parse_observation_row,
    )
    .optional()
}

/// Batch fetch by explicit id list, optionally project-restricted.
///
/// `order_by_date` sorts by `created_at_ms` (then id); otherwise by id.
pub fn get_observations_by_ids_sync(
    conn: &Connection,
    ids: &[i64],
    project: Option<&str>,
    order_by_date: bool,
) -> rusqlite::Result<Vec<Observation>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    // Cap to SQLite's default parameter budget; callers validate list size upstream.
    let ids = if ids.len() > 500 { &ids[..500] } else { ids };

    let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 2)).collect();
    let order = if order_by_date {
        "created_at_ms ASC, id ASC"
    } else {
        "id ASC"
    };
    let sql = format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations
         WHERE (?1 IS NULL OR project = ?1) AND id IN ({})
         ORDER BY {order}",
        placeholders.join(", ")
    );

    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    param_values.push(Box::new(project.map(|s| s.to_string())));
    for id in ids {
        param_values.push(Box::new(*id));
    }
    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| p.as_ref()).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(param_refs.as_slice(), parse_observation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Resolve a free-text timeline anchor: the most recent observation whose
/// title or body contains the query, case-insensitively. Higher id wins ties.
pub fn resolve_anchor_by_query_sync(
    conn: &Connection,
    query: &str,
    project: Option<&str>,
) -> rusqlite::Result<Option<i64>> {
    let pattern = format!("%{}%", query.to_lowercase());
    conn.query_row(
        "SELECT id FROM observations
         WHERE (?1 IS NULL OR project = ?1)
           AND (LOWER(title) LIKE ?2 OR LOWER(body) LIKE ?2)
         ORDER BY created_at_ms DESC, id DESC
         LIMIT 1",
        params![project, pattern],
        |row| row.get(0),
    )
    .optional()
}

/// Chronological window around an anchor observation.
pub struct TimelineWindow {
    pub anchor: Observation,
    pub before: Vec<Observation>,
    pub after: Vec<Observation>,
    pub prompts: Vec<UserPrompt>,
}

/// Fetch `depth_before` observations older than the anchor (descending) and
/// `depth_after` newer ones (ascending), plus the anchor session's prompts.
pub fn timeline_window_sync(
    conn: &Connection,
    anchor_id: i64,
    depth_before: usize,
    depth_after: usize,
    project: Option<&str>,
) -> rusqlite::Result<Option<TimelineWindow>> {
    let Some(anchor) = get_observation_sync(conn, anchor_id)? else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations
         WHERE (?1 IS NULL OR project = ?1) AND created_at_ms < ?2
         ORDER BY created_at_ms DESC, id DESC
         LIMIT ?3"
    ))?;
    let before: Vec<Observation> = stmt
        .query_map(
            params![project, anchor.created_at_ms, depth_before as i64],
            parse_observation_row,
        )?
        .filter_map(log_and_discard)
        .collect();

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations
         WHERE (?1 IS NULL OR project = ?1) AND created_at_ms > ?2
         ORDER BY created_at_ms ASC, id ASC
         LIMIT ?3"
    ))?;
    let after: Vec<Observation> = stmt
        .query_map(
            params![project, anchor.created_at_ms, depth_after as i64],
            parse_observation_row,
        )?
        .filter_map(log_and_discard)
        .collect();

    let prompts = prompts_for_session_sync(conn, &anchor.session_id)?;

    Ok(Some(TimelineWindow {
        anchor,
        before,
        after,
        prompts,
    }))
}

/// Substring fallback search over title/body/subtitle, newest first, cap 100.
pub fn fallback_search_sync(
    conn: &Connection,
    query: &str,
    project: Option<&str>,
) -> rusqlite::Result<Vec<Observation>> {
    let pattern = format!("%{}%", query.to_lowercase());
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations
         WHERE (?1 IS NULL OR project = ?1)
           AND (LOWER(title) LIKE ?2 OR LOWER(body) LIKE ?2
                OR LOWER(COALESCE(subtitle, '')) LIKE ?2)
         ORDER BY created_at_ms DESC
         LIMIT 100"
    ))?;
    let rows = stmt
        .query_map(params![project, pattern], parse_observation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Newest observations lacking a vector, for worker startup backfill.
pub fn observations_missing_vectors_sync(
    conn: &Connection,
    limit: usize,
) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT o.id FROM observations o
         LEFT JOIN observation_vectors v ON v.observation_id = o.id
         WHERE v.observation_id IS NULL
         ORDER BY o.created_at_ms DESC, o.id DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| row.get(0))?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Replication scan: observations past the cursor with non-empty bodies.
pub fn observations_after_id_sync(
    conn: &Connection,
    cursor: i64,
    project: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<Observation>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OBSERVATION_COLUMNS} FROM observations
         WHERE id > ?1 AND (?2 IS NULL OR project = ?2) AND TRIM(body) != ''
         ORDER BY id ASC
         LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(params![cursor, project, limit as i64], parse_observation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

pub fn count_observations_sync(
    conn: &Connection,
    project: Option<&str>,
) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM observations WHERE (?1 IS NULL OR project = ?1)",
        [project],
        |row| row.get(0),
    )
}
