// db/fts.rs
// Full-text queries against the observations_fts mirror

use rusqlite::{Connection, params};

use super::log_and_discard;
use super::types::{Observation, parse_observation_row};

/// Compile user input into a prefix-AND FTS5 query.
///
/// Splits on whitespace, keeps words of length ≥ 2, quotes each (doubling any
/// embedded quotes) and appends `*`, joined by space; FTS5 treats adjacent
/// terms as AND. Returns None when nothing queryable remains.
pub fn build_match_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split_whitespace()
        .filter(|w| w.chars().count() >= 2)
        .map(|w| format!("\"{}\"*", w.replace('"', "\"\"")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

/// A ranked FTS hit. Lower bm25 means a better match (SQLite convention).
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub observation: Observation,
    pub bm25: f64,
}

/// Constraints applied alongside the MATCH.
#[derive(Debug, Default, Clone)]
pub struct FtsConstraints<'a> {
    pub project: Option<&'a str>,
    pub kind: Option<&'a str>,
    pub date_start_ms: Option<i64>,
    pub date_end_ms: Option<i64>,
}

/// Execute a compiled MATCH query joined to observations, BM25-ordered, cap 100.
pub fn fts_search_sync(
    conn: &Connection,
    match_query: &str,
    constraints: &FtsConstraints,
) -> rusqlite::Result<Vec<FtsHit>> {
    let mut stmt = conn.prepare_cached(
        "SELECT o.id, o.session_id, o.project, o.kind, o.title, o.subtitle, o.body,
                o.facts, o.files_read, o.files_modified, o.prompt_number, o.created_at_ms,
                bm25(observations_fts) AS score
         FROM observations_fts f
         JOIN observations o ON o.id = f.observation_id
         WHERE observations_fts MATCH ?1
           AND (?2 IS NULL OR o.project = ?2)
           AND (?3 IS NULL OR o.kind = ?3)
           AND (?4 IS NULL OR o.created_at_ms >= ?4)
           AND (?5 IS NULL OR o.created_at_ms <= ?5)
         ORDER BY bm25(observations_fts) ASC
         LIMIT 100",
    )?;
    let rows = stmt
        .query_map(
            params![
                match_query,
                constraints.project,
                constraints.kind,
                constraints.date_start_ms,
                constraints.date_end_ms,
            ],
            |row| {
                Ok(FtsHit {
                    observation: parse_observation_row(row)?,
                    bm25: row.get(12)?,
                })
            },
        )?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}
