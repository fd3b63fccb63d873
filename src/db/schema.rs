// db/schema.rs
// Database schema as an ordered list of named migrations
//
// Rules: migrations are never re-ordered or mutated after release; the only
// allowed change is appending a new name that sorts after all applied ones.
// Startup refuses to proceed when the schema_migrations table contains a name
// this binary does not know about (downgrade / divergent history).

use anyhow::{Result, bail};
use rusqlite::Connection;

/// A named migration applied exactly once, inside its own transaction.
struct Migration {
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_core_tables",
        sql: r#"
            CREATE TABLE sessions (
                id              TEXT PRIMARY KEY,
                project         TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'active'
                                CHECK (status IN ('active', 'completed', 'failed')),
                started_at_ms   INTEGER NOT NULL,
                completed_at_ms INTEGER
            );

            CREATE TABLE user_prompts (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id    TEXT NOT NULL REFERENCES sessions(id),
                prompt_number INTEGER NOT NULL,
                body          TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                UNIQUE (session_id, prompt_number)
            );
            CREATE INDEX idx_user_prompts_session
                ON user_prompts(session_id, prompt_number);

            CREATE TABLE observations (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id     TEXT NOT NULL REFERENCES sessions(id),
                project        TEXT NOT NULL,
                kind           TEXT NOT NULL,
                title          TEXT NOT NULL,
                subtitle       TEXT,
                body           TEXT NOT NULL,
                facts          TEXT,
                files_read     TEXT,
                files_modified TEXT,
                prompt_number  INTEGER NOT NULL DEFAULT 0,
                created_at_ms  INTEGER NOT NULL
            );
            CREATE INDEX idx_observations_project_time
                ON observations(project, created_at_ms);
            CREATE INDEX idx_observations_session
                ON observations(session_id);

            CREATE TABLE memories (
                id            TEXT PRIMARY KEY,
                project       TEXT NOT NULL,
                content       TEXT NOT NULL,
                summary       TEXT,
                kind          TEXT NOT NULL DEFAULT 'general',
                tags          TEXT,
                metadata      TEXT,
                session_id    TEXT,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX idx_memories_project_time
                ON memories(project, created_at_ms);

            CREATE TABLE summaries (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id    TEXT NOT NULL UNIQUE REFERENCES sessions(id),
                request       TEXT,
                investigated  TEXT,
                learned       TEXT,
                completed     TEXT,
                next_steps    TEXT,
                created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE observation_vectors (
                observation_id INTEGER PRIMARY KEY
                               REFERENCES observations(id) ON DELETE CASCADE,
                embedding      BLOB NOT NULL,
                model          TEXT NOT NULL,
                created_at_ms  INTEGER NOT NULL
            );
        "#,
    },
    Migration {
        name: "0002_observations_fts",
        sql: r#"
            CREATE VIRTUAL TABLE observations_fts USING fts5(
                observation_id UNINDEXED,
                title,
                body,
                tags,
                files,
                tokenize='porter unicode61 remove_diacritics 1'
            );

            CREATE TRIGGER observations_fts_ai AFTER INSERT ON observations BEGIN
                INSERT INTO observations_fts(observation_id, title, body, tags, files)
                VALUES (
                    new.id,
                    new.title,
                    new.body,
                    new.kind || ' ' || COALESCE(new.facts, ''),
                    COALESCE(new.files_read, '') || ' ' || COALESCE(new.files_modified, '')
                );
            END;

            CREATE TRIGGER observations_fts_ad AFTER DELETE ON observations BEGIN
                DELETE FROM observations_fts WHERE observation_id = old.id;
            END;

            CREATE TRIGGER observations_fts_au AFTER UPDATE ON observations BEGIN
                DELETE FROM observations_fts WHERE observation_id = old.id;
                INSERT INTO observations_fts(observation_id, title, body, tags, files)
                VALUES (
                    new.id,
                    new.title,
                    new.body,
                    new.kind || ' ' || COALESCE(new.facts, ''),
                    COALESCE(new.files_read, '') || ' ' || COALESCE(new.files_modified, '')
                );
            END;
        "#,
    },
    Migration {
        name: "0003_queue_tables",
        sql: r#"
            CREATE TABLE pending_messages (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name       TEXT NOT NULL,
                entity_id        TEXT NOT NULL,
                payload          TEXT NOT NULL,
                dedup_key        TEXT,
                retry_count      INTEGER NOT NULL DEFAULT 0,
                max_retries      INTEGER NOT NULL DEFAULT 3,
                created_at_ms    INTEGER NOT NULL,
                next_retry_at_ms INTEGER
            );
            CREATE INDEX idx_pending_ready
                ON pending_messages(queue_name, next_retry_at_ms, created_at_ms);
            CREATE INDEX idx_pending_dedup
                ON pending_messages(queue_name, dedup_key);

            CREATE TABLE processed_events (
                event_key       TEXT PRIMARY KEY,
                queue_name      TEXT NOT NULL,
                entity_id       TEXT,
                processed_at_ms INTEGER NOT NULL
            );

            CREATE TABLE dead_letters (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name    TEXT NOT NULL,
                entity_id     TEXT NOT NULL,
                payload       TEXT NOT NULL,
                reason        TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX idx_dead_letters_queue
                ON dead_letters(queue_name, created_at_ms);
        "#,
    },
    Migration {
        name: "0004_sync_tables",
        sql: r#"
            CREATE TABLE sync_state (
                state_key     TEXT PRIMARY KEY,
                state_value   TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );

            CREATE TABLE sync_runs (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                provider       TEXT NOT NULL,
                project        TEXT,
                status         TEXT NOT NULL
                               CHECK (status IN ('running', 'success', 'failed')),
                synced_count   INTEGER NOT NULL DEFAULT 0,
                failed_count   INTEGER NOT NULL DEFAULT 0,
                conflict_count INTEGER NOT NULL DEFAULT 0,
                retry_count    INTEGER NOT NULL DEFAULT 0,
                started_at_ms  INTEGER NOT NULL,
                ended_at_ms    INTEGER,
                details        TEXT
            );
            CREATE INDEX idx_sync_runs_time ON sync_runs(started_at_ms);
        "#,
    },
];

/// Apply all pending migrations, in order, one transaction each.
///
/// Called during pool creation. Fails (and the process refuses to start) when
/// the database records a migration name absent from the compiled-in list.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name          TEXT PRIMARY KEY,
            applied_at_ms INTEGER NOT NULL
        )",
        [],
    )?;

    let applied: Vec<String> = {
        let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let known: Vec<&str> = MIGRATIONS.iter().map(|m| m.name).collect();
    for name in &applied {
        if !known.contains(&name.as_str()) {
            bail!(
                "database has applied migration '{}' that this binary does not know; \
                 refusing to start",
                name
            );
        }
    }

    for migration in MIGRATIONS {
        if applied.iter().any(|a| a == migration.name) {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (name, applied_at_ms) VALUES (?1, ?2)",
            rusqlite::params![migration.name, crate::utils::now_ms()],
        )?;
        tx.commit()?;
        tracing::info!("applied migration {}", migration.name);
    }

    Ok(())
}
