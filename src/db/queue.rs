// db/queue.rs
// Durable pending-message queue: dedup, retry scheduling, dead letters
//
// Delivery is at-least-once. The dedup key is advisory on enqueue; true
// idempotence requires the consumer to mark the event processed after success.

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use super::log_and_discard;
use super::types::{DeadLetter, PendingMessage};
use crate::utils::now_ms;

/// Sentinel returned by `enqueue_sync` when the event was already processed.
pub const DUPLICATE: i64 = -1;

/// Default retry budget for enqueued messages.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Parameters for enqueueing a message.
pub struct EnqueueParams<'a> {
    pub queue_name: &'a str,
    pub entity_id: &'a str,
    pub payload: &'a str,
    pub max_retries: Option<i64>,
    pub delay_ms: Option<i64>,
    pub dedup_key: Option<&'a str>,
}

/// Enqueue a message.
///
/// Returns `DUPLICATE` (-1) when the dedup key is already in processed_events.
/// When a pending row with the same `(queue_name, dedup_key)` exists, returns
/// that row's id so concurrent producers coalesce onto one message.
pub fn enqueue_sync(conn: &Connection, p: EnqueueParams) -> rusqlite::Result<i64> {
    if let Some(key) = p.dedup_key {
        if is_event_processed_sync(conn, key)? {
            return Ok(DUPLICATE);
        }
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM pending_messages WHERE queue_name = ?1 AND dedup_key = ?2",
                params![p.queue_name, key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
    }

    let now = now_ms();
    let next_retry_at_ms = p.delay_ms.map(|d| now + d);
    conn.execute(
        "INSERT INTO pending_messages
            (queue_name, entity_id, payload, dedup_key, retry_count, max_retries,
             created_at_ms, next_retry_at_ms)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7)",
        params![
            p.queue_name,
            p.entity_id,
            p.payload,
            p.dedup_key,
            p.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            now,
            next_retry_at_ms,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Fetch messages ready for delivery, oldest first.
///
/// A row is ready when its retry timer has elapsed (or was never set) and its
/// retry budget is not exhausted.
pub fn get_ready_sync(
    conn: &Connection,
    queue_name: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<PendingMessage>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, queue_name, entity_id, payload, dedup_key, retry_count, max_retries,
                created_at_ms, next_retry_at_ms
         FROM pending_messages
         WHERE (?1 IS NULL OR queue_name = ?1)
           AND (next_retry_at_ms IS NULL OR next_retry_at_ms <= ?2)
           AND retry_count < max_retries
         ORDER BY created_at_ms ASC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![queue_name, now_ms(), limit as i64], |row| {
            Ok(PendingMessage {
                id: row.get(0)?,
                queue_name: row.get(1)?,
                entity_id: row.get(2)?,
                payload: row.get(3)?,
                dedup_key: row.get(4)?,
                retry_count: row.get(5)?,
                max_retries: row.get(6)?,
                created_at_ms: row.get(7)?,
                next_retry_at_ms: row.get(8)?,
            })
        })?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Bump a message's retry count, scheduling the next attempt.
///
/// Returns false when the budget is exhausted; the caller is then responsible
/// for dead-lettering and removing the row.
pub fn increment_retry_sync(
    conn: &Connection,
    id: i64,
    next_delay_ms: Option<i64>,
) -> rusqlite::Result<bool> {
    let (retry_count, max_retries): (i64, i64) = conn.query_row(
        "SELECT retry_count, max_retries FROM pending_messages WHERE id = ?1",
        [id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let new_count = retry_count + 1;
    if new_count >= max_retries {
        conn.execute(
            "UPDATE pending_messages SET retry_count = ?1, next_retry_at_ms = NULL WHERE id = ?2",
            params![new_count, id],
        )?;
        return Ok(false);
    }

    let next_retry_at_ms = next_delay_ms.map(|d| now_ms() + d);
    conn.execute(
        "UPDATE pending_messages SET retry_count = ?1, next_retry_at_ms = ?2 WHERE id = ?3",
        params![new_count, next_retry_at_ms, id],
    )?;
    Ok(true)
}

/// Remove a delivered (or dead-lettered) message.
pub fn mark_processed_sync(conn: &Connection, id: i64) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM pending_messages WHERE id = ?1", [id])?;
    Ok(())
}

/// Record an event key in the idempotency log (ignore on conflict).
pub fn mark_event_processed_sync(
    conn: &Connection,
    event_key: &str,
    queue_name: &str,
    entity_id: Option<&str>,
    processed_at_ms: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO processed_events (event_key, queue_name, entity_id, processed_at_ms)
         VALUES (?1, ?2, ?3, ?4)",
        params![event_key, queue_name, entity_id, processed_at_ms],
    )?;
    Ok(())
}

pub fn is_event_processed_sync(conn: &Connection, event_key: &str) -> rusqlite::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM processed_events WHERE event_key = ?1",
            [event_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// Write a dead letter row.
pub fn insert_dead_letter_sync(
    conn: &Connection,
    queue_name: &str,
    entity_id: &str,
    payload: &str,
    reason: &str,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO dead_letters (queue_name, entity_id, payload, reason, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![queue_name, entity_id, payload, reason, now_ms()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Oldest dead letters for a queue, for diagnostics and replay.
pub fn get_dead_letters_sync(
    conn: &Connection,
    queue_name: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<DeadLetter>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, queue_name, entity_id, payload, reason, created_at_ms
         FROM dead_letters
         WHERE (?1 IS NULL OR queue_name = ?1)
         ORDER BY created_at_ms ASC, id ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![queue_name, limit as i64], |row| {
            Ok(DeadLetter {
                id: row.get(0)?,
                queue_name: row.get(1)?,
                entity_id: row.get(2)?,
                payload: row.get(3)?,
                reason: row.get(4)?,
                created_at_ms: row.get(5)?,
            })
        })?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

pub fn delete_dead_letter_sync(conn: &Connection, id: i64) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM dead_letters WHERE id = ?1", [id])?;
    Ok(())
}

/// Aggregate queue counters for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub ready: i64,
    pub dead_letters: i64,
    pub processed_events: i64,
    pub oldest_pending_age_ms: Option<i64>,
}

pub fn queue_stats_sync(conn: &Connection) -> rusqlite::Result<QueueStats> {
    let now = now_ms();
    let pending: i64 =
        conn.query_row("SELECT COUNT(*) FROM pending_messages", [], |r| r.get(0))?;
    let ready: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_messages
         WHERE (next_retry_at_ms IS NULL OR next_retry_at_ms <= ?1)
           AND retry_count < max_retries",
        [now],
        |r| r.get(0),
    )?;
    let dead_letters: i64 =
        conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |r| r.get(0))?;
    let processed_events: i64 =
        conn.query_row("SELECT COUNT(*) FROM processed_events", [], |r| r.get(0))?;
    let oldest: Option<i64> = conn
        .query_row(
            "SELECT MIN(created_at_ms) FROM pending_messages",
            [],
            |r| r.get(0),
        )
        .optional()?
        .flatten();

    Ok(QueueStats {
        pending,
        ready,
        dead_letters,
        processed_events,
        oldest_pending_age_ms: oldest.map(|t| now - t),
    })
}
