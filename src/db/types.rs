// db/types.rs
// Row types shared across the database layer and the API

use serde::{Deserialize, Serialize};

/// Session lifecycle states. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub project: String,
    pub status: SessionStatus,
    pub started_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserPrompt {
    pub id: i64,
    pub session_id: String,
    pub prompt_number: i64,
    pub text: String,
    pub created_at_ms: i64,
}

/// Append-only record of something noteworthy that happened during a session.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub id: i64,
    pub session_id: String,
    pub project: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub text: String,
    pub facts: Vec<String>,
    pub files_read: Vec<String>,
    pub files_modified: Vec<String>,
    pub prompt_number: i64,
    pub created_at_ms: i64,
}

/// Free-form knowledge item, possibly handwritten; the injection path reads these.
#[derive(Debug, Clone, Serialize)]
pub struct Memory {
    pub id: String,
    pub project: String,
    pub content: String,
    pub summary: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    pub session_id: Option<String>,
    pub created_at_ms: i64,
}

/// Per-session rollup across the five fixed rubrics.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub id: i64,
    pub session_id: String,
    pub request: Option<String>,
    pub investigated: Option<String>,
    pub learned: Option<String>,
    pub completed: Option<String>,
    pub next_steps: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingMessage {
    pub id: i64,
    pub queue_name: String,
    pub entity_id: String,
    pub payload: String,
    pub dedup_key: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at_ms: i64,
    pub next_retry_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: i64,
    pub queue_name: String,
    pub entity_id: String,
    pub payload: String,
    pub reason: String,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRunStatus {
    Running,
    Success,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub id: i64,
    pub provider: String,
    pub project: Option<String>,
    pub status: String,
    pub synced_count: i64,
    pub failed_count: i64,
    pub conflict_count: i64,
    pub retry_count: i64,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    pub details: Option<String>,
}

/// Decode a JSON array column into a Vec<String>; NULL and garbage become empty.
pub(crate) fn json_string_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Encode a string list as a JSON column value; empty lists store NULL.
pub(crate) fn json_string_list_column(items: &[String]) -> Option<String> {
    if items.is_empty() {
        None
    } else {
        serde_json::to_string(items).ok()
    }
}

/// Row mapper for SELECTs over the full observations column list.
pub(crate) fn parse_observation_row(row: &rusqlite::Row) -> rusqlite::Result<Observation> {
    Ok(Observation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        project: row.get(2)?,
        kind: row.get(3)?,
        title: row.get(4)?,
        subtitle: row.get(5)?,
        text: row.get(6)?,
        facts: json_string_list(row.get(7)?),
        files_read: json_string_list(row.get(8)?),
        files_modified: json_string_list(row.get(9)?),
        prompt_number: row.get(10)?,
        created_at_ms: row.get(11)?,
    })
}

/// Column list matching `parse_observation_row`.
pub(crate) const OBSERVATION_COLUMNS: &str = "id, session_id, project, kind, title, subtitle, \
     body, facts, files_read, files_modified, prompt_number, created_at_ms";

/// Row mapper for SELECTs over the full memories column list.
pub(crate) fn parse_memory_row(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let metadata: Option<String> = row.get(6)?;
    Ok(Memory {
        id: row.get(0)?,
        project: row.get(1)?,
        content: row.get(2)?,
        summary: row.get(3)?,
        kind: row.get(4)?,
        tags: json_string_list(row.get(5)?),
        metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
        session_id: row.get(7)?,
        created_at_ms: row.get(8)?,
    })
}

/// Column list matching `parse_memory_row`.
pub(crate) const MEMORY_COLUMNS: &str =
    "id, project, content, summary, kind, tags, metadata, session_id, created_at_ms";
