// db/test_support.rs
// Shared helpers for database unit tests

#![cfg(test)]

use rusqlite::Connection;

/// Open an in-memory connection with the full schema applied.
pub fn setup_test_connection() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .expect("enable foreign keys");
    super::schema::run_migrations(&conn).expect("run migrations");
    conn
}

/// Insert a minimal active session and return its id.
pub fn insert_session(conn: &Connection, session_id: &str, project: &str) {
    conn.execute(
        "INSERT OR IGNORE INTO sessions (id, project, status, started_at_ms)
         VALUES (?1, ?2, 'active', ?3)",
        rusqlite::params![session_id, project, crate::utils::now_ms()],
    )
    .expect("insert session");
}

/// Insert a bare observation row and return its id.
pub fn insert_observation(
    conn: &Connection,
    session_id: &str,
    project: &str,
    title: &str,
    body: &str,
    created_at_ms: i64,
) -> i64 {
    insert_session(conn, session_id, project);
    conn.execute(
        "INSERT INTO observations
            (session_id, project, kind, title, body, prompt_number, created_at_ms)
         VALUES (?1, ?2, 'general', ?3, ?4, 1, ?5)",
        rusqlite::params![session_id, project, title, body, created_at_ms],
    )
    .expect("insert observation");
    conn.last_insert_rowid()
}
