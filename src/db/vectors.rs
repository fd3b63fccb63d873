// db/vectors.rs
// Observation embedding storage as packed little-endian f32 blobs

use rusqlite::{Connection, OptionalExtension, params};

use super::log_and_discard;
use crate::utils::now_ms;

/// Pack an embedding into a little-endian f32 blob.
pub fn pack_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Unpack a little-endian f32 blob. Trailing partial floats are ignored.
pub fn unpack_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Store (or replace) the vector for an observation.
pub fn store_vector_sync(
    conn: &Connection,
    observation_id: i64,
    embedding: &[f32],
    model: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO observation_vectors
            (observation_id, embedding, model, created_at_ms)
         VALUES (?1, ?2, ?3, ?4)",
        params![observation_id, pack_embedding(embedding), model, now_ms()],
    )?;
    Ok(())
}

pub fn has_vector_sync(conn: &Connection, observation_id: i64) -> rusqlite::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM observation_vectors WHERE observation_id = ?1",
            [observation_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// All vectors for a project, for in-process cosine scoring.
pub fn vectors_for_project_sync(
    conn: &Connection,
    project: &str,
) -> rusqlite::Result<Vec<(i64, Vec<f32>)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT v.observation_id, v.embedding
         FROM observation_vectors v
         JOIN observations o ON o.id = v.observation_id
         WHERE o.project = ?1",
    )?;
    let rows = stmt
        .query_map([project], |row| {
            let blob: Vec<u8> = row.get(1)?;
            Ok((row.get(0)?, unpack_embedding(&blob)))
        })?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

pub fn count_vectors_sync(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM observation_vectors", [], |row| {
        row.get(0)
    })
}
