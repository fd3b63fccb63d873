// db/sync.rs
// Replicator bookkeeping: cursors, content hashes, run history

use rusqlite::{Connection, OptionalExtension, params};

use super::types::{SyncRun, SyncRunStatus};
use crate::utils::now_ms;

/// State key for a project's replication cursor.
pub fn cursor_key(provider: &str, project: Option<&str>) -> String {
    format!("{}.cursor.{}", provider, project.unwrap_or("__all__"))
}

/// State key for an observation's replicated content hash.
pub fn observation_hash_key(provider: &str, observation_id: i64) -> String {
    format!("{}.hash.observation.{}", provider, observation_id)
}

pub fn get_sync_state_sync(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT state_value FROM sync_state WHERE state_key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_sync_state_sync(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO sync_state (state_key, state_value, updated_at_ms)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(state_key) DO UPDATE SET
            state_value = excluded.state_value,
            updated_at_ms = excluded.updated_at_ms",
        params![key, value, now_ms()],
    )?;
    Ok(())
}

pub fn delete_sync_state_sync(conn: &Connection, key: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM sync_state WHERE state_key = ?1", [key])?;
    Ok(())
}

/// Delete all state rows with the given prefix (project purge).
pub fn delete_sync_state_prefix_sync(conn: &Connection, prefix: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM sync_state WHERE state_key LIKE ?1 || '%'",
        [prefix],
    )
}

/// Open a run record in the `running` state, returning its id.
pub fn start_sync_run_sync(
    conn: &Connection,
    provider: &str,
    project: Option<&str>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO sync_runs (provider, project, status, started_at_ms)
         VALUES (?1, ?2, 'running', ?3)",
        params![provider, project, now_ms()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Counter snapshot written when a run closes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncCounters {
    pub synced: i64,
    pub failed: i64,
    pub conflicts: i64,
    pub retries: i64,
}

pub fn finish_sync_run_sync(
    conn: &Connection,
    run_id: i64,
    status: SyncRunStatus,
    counters: SyncCounters,
    details: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE sync_runs SET
            status = ?1, synced_count = ?2, failed_count = ?3,
            conflict_count = ?4, retry_count = ?5, ended_at_ms = ?6, details = ?7
         WHERE id = ?8",
        params![
            status.as_str(),
            counters.synced,
            counters.failed,
            counters.conflicts,
            counters.retries,
            now_ms(),
            details,
            run_id,
        ],
    )?;
    Ok(())
}

fn parse_sync_run_row(row: &rusqlite::Row) -> rusqlite::Result<SyncRun> {
    Ok(SyncRun {
        id: row.get(0)?,
        provider: row.get(1)?,
        project: row.get(2)?,
        status: row.get(3)?,
        synced_count: row.get(4)?,
        failed_count: row.get(5)?,
        conflict_count: row.get(6)?,
        retry_count: row.get(7)?,
        started_at_ms: row.get(8)?,
        ended_at_ms: row.get(9)?,
        details: row.get(10)?,
    })
}

/// The most recent run, for diagnostics and /api/stats.
pub fn last_sync_run_sync(conn: &Connection) -> rusqlite::Result<Option<SyncRun>> {
    conn.query_row(
        "SELECT id, provider, project, status, synced_count, failed_count,
                conflict_count, retry_count, started_at_ms, ended_at_ms, details
         FROM sync_runs
         ORDER BY started_at_ms DESC, id DESC
         LIMIT 1",
        [],
        parse_sync_run_row,
    )
    .optional()
}
