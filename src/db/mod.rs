// db/mod.rs
// SQLite storage layer: pooled access, named migrations, typed repositories

pub mod cleanup;
pub mod fts;
pub mod memories;
pub mod observations;
pub mod pool;
pub mod queue;
mod schema;
pub mod sessions;
pub mod sync;
#[cfg(test)]
pub mod test_support;
pub mod types;
pub mod vectors;

pub use pool::{DatabasePool, PoolStatus};
pub use types::*;

/// Drop rows that fail to map, logging instead of aborting the whole query.
pub(crate) fn log_and_discard<T>(result: rusqlite::Result<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("discarding unreadable row: {}", e);
            None
        }
    }
}

/// Entity counts reported by /api/stats.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreCounts {
    pub sessions: i64,
    pub observations: i64,
    pub memories: i64,
    pub vectors: i64,
    pub dead_letters: i64,
}

pub fn store_counts_sync(conn: &rusqlite::Connection) -> rusqlite::Result<StoreCounts> {
    Ok(StoreCounts {
        sessions: sessions::count_sessions_sync(conn, None)?,
        observations: observations::count_observations_sync(conn, None)?,
        memories: memories::count_memories_sync(conn, None)?,
        vectors: vectors::count_vectors_sync(conn)?,
        dead_letters: conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |r| r.get(0))?,
    })
}
