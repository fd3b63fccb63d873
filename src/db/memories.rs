// db/memories.rs
// Free-form memory storage and the context-injection read path

use rusqlite::{Connection, OptionalExtension, params};

use super::log_and_discard;
use super::types::{MEMORY_COLUMNS, Memory, json_string_list_column, parse_memory_row};
use crate::utils::now_ms;

/// Parameters for storing a memory. Content must already be sanitized.
pub struct StoreMemoryParams<'a> {
    /// Explicit id; a fresh UUID is assigned when absent.
    pub id: Option<&'a str>,
    pub project: &'a str,
    pub content: &'a str,
    pub summary: Option<&'a str>,
    pub kind: &'a str,
    pub tags: &'a [String],
    pub metadata: Option<&'a serde_json::Value>,
    pub session_id: Option<&'a str>,
}

/// Store a memory, returning its id.
pub fn store_memory_sync(conn: &Connection, p: StoreMemoryParams) -> rusqlite::Result<String> {
    let id = p
        .id
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    conn.execute(
        "INSERT OR REPLACE INTO memories
            (id, project, content, summary, kind, tags, metadata, session_id, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            p.project,
            p.content,
            p.summary,
            p.kind,
            json_string_list_column(p.tags),
            p.metadata.map(|m| m.to_string()),
            p.session_id,
            now_ms(),
        ],
    )?;
    Ok(id)
}

pub fn get_memory_sync(conn: &Connection, id: &str) -> rusqlite::Result<Option<Memory>> {
    conn.query_row(
        &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
        [id],
        parse_memory_row,
    )
    .optional()
}

pub fn delete_memory_sync(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let deleted = conn.execute("DELETE FROM memories WHERE id = ?1", [id])?;
    Ok(deleted > 0)
}

/// Paged listing, newest first, optionally filtered by project and kind.
pub fn list_memories_sync(
    conn: &Connection,
    project: Option<&str>,
    kind: Option<&str>,
    limit: usize,
    offset: usize,
) -> rusqlite::Result<Vec<Memory>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MEMORY_COLUMNS} FROM memories
         WHERE (?1 IS NULL OR project = ?1) AND (?2 IS NULL OR kind = ?2)
         ORDER BY created_at_ms DESC
         LIMIT ?3 OFFSET ?4"
    ))?;
    let rows = stmt
        .query_map(
            params![project, kind, limit as i64, offset as i64],
            parse_memory_row,
        )?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Memories captured during one session for a project, newest first.
pub fn memories_by_session_sync(
    conn: &Connection,
    session_id: &str,
    project: &str,
    limit: usize,
) -> rusqlite::Result<Vec<Memory>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MEMORY_COLUMNS} FROM memories
         WHERE session_id = ?1 AND project = ?2
         ORDER BY created_at_ms DESC
         LIMIT ?3"
    ))?;
    let rows = stmt
        .query_map(params![session_id, project, limit as i64], parse_memory_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// The context-injection read: newest memories for a project, excluding the
/// current session's rows, bounded by age and count.
pub fn memories_for_injection_sync(
    conn: &Connection,
    project: &str,
    exclude_session: Option<&str>,
    max_age_days: Option<u32>,
    limit: usize,
) -> rusqlite::Result<Vec<Memory>> {
    let min_created_at = max_age_days.map(|d| now_ms() - (d as i64) * 86_400_000);
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MEMORY_COLUMNS} FROM memories
         WHERE project = ?1
           AND (?2 IS NULL OR session_id IS NULL OR session_id != ?2)
           AND (?3 IS NULL OR created_at_ms >= ?3)
         ORDER BY created_at_ms DESC
         LIMIT ?4"
    ))?;
    let rows = stmt
        .query_map(
            params![project, exclude_session, min_created_at, limit as i64],
            parse_memory_row,
        )?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

pub fn count_memories_sync(conn: &Connection, project: Option<&str>) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE (?1 IS NULL OR project = ?1)",
        [project],
        |row| row.get(0),
    )
}
