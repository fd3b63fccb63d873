// src/context.rs
// Token-budgeted context injection block for new sessions

use std::sync::Arc;

use crate::db::memories::memories_for_injection_sync;
use crate::db::types::Memory;
use crate::db::DatabasePool;
use crate::error::Result;

/// Defaults when the caller leaves budgets unspecified.
pub const DEFAULT_MAX_TOKENS: usize = 2_000;
pub const DEFAULT_MAX_MEMORIES: usize = 10;

/// Character budget taken from content when a memory has no summary.
const CONTENT_EXCERPT_CHARS: usize = 200;

/// Request parameters for context assembly.
#[derive(Debug, Clone)]
pub struct ContextParams {
    pub project: String,
    pub max_tokens: usize,
    pub max_memories: usize,
    /// Current session, excluded so a session never re-reads its own notes.
    pub session_id: Option<String>,
    pub max_age_days: Option<u32>,
}

/// Assembled injection block.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContextInjection {
    /// Markdown block, or None when no memory fit the budgets.
    pub context: Option<String>,
    pub count: usize,
    pub token_estimate: usize,
}

/// Rough token estimate: ceil(UTF-16 length / 4).
pub fn estimate_tokens(text: &str) -> usize {
    text.encode_utf16().count().div_ceil(4)
}

/// Line text for one memory: its summary, or a content excerpt.
fn memory_line_text(memory: &Memory) -> String {
    match memory.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(summary) => summary.to_string(),
        None => memory.content.chars().take(CONTENT_EXCERPT_CHARS).collect(),
    }
}

/// Accumulate memory lines under the token budget.
///
/// Iteration is in the given (newest-first) order and stops at the FIRST line
/// that would overflow; later, smaller memories are not considered, keeping
/// truncation deterministic.
pub fn select_lines(memories: &[Memory], max_tokens: usize) -> (Vec<String>, usize) {
    let mut lines = Vec::new();
    let mut consumed = 0usize;
    for memory in memories {
        let line = format!("[#{}] {}", memory.id, memory_line_text(memory));
        let tokens = estimate_tokens(&line);
        if consumed + tokens > max_tokens {
            break;
        }
        consumed += tokens;
        lines.push(line);
    }
    (lines, consumed)
}

/// Wrap selected lines as the final Markdown block.
fn render_block(lines: &[String]) -> String {
    format!(
        "## Relevant Project Context\n\n{}\n\n_Recalled from project memory by opencode-mem._",
        lines.join("\n")
    )
}

/// Build the injection block for a project.
pub async fn build_context(
    pool: &Arc<DatabasePool>,
    params: ContextParams,
) -> Result<ContextInjection> {
    let ContextParams {
        project,
        max_tokens,
        max_memories,
        session_id,
        max_age_days,
    } = params;

    let memories = pool
        .run(move |conn| {
            memories_for_injection_sync(
                conn,
                &project,
                session_id.as_deref(),
                max_age_days,
                max_memories,
            )
        })
        .await?;

    let (lines, consumed) = select_lines(&memories, max_tokens);
    if lines.is_empty() {
        return Ok(ContextInjection {
            context: None,
            count: 0,
            token_estimate: 0,
        });
    }
    Ok(ContextInjection {
        context: Some(render_block(&lines)),
        count: lines.len(),
        token_estimate: consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(id: &str, content: &str, summary: Option<&str>) -> Memory {
        Memory {
            id: id.to_string(),
            project: "proj".to_string(),
            content: content.to_string(),
            summary: summary.map(|s| s.to_string()),
            kind: "general".to_string(),
            tags: vec![],
            metadata: None,
            session_id: None,
            created_at_ms: 0,
        }
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn summary_preferred_over_content_excerpt() {
        let m = memory("m1", &"c".repeat(500), Some("short summary"));
        let (lines, _) = select_lines(&[m], 100);
        assert_eq!(lines, vec!["[#m1] short summary"]);
    }

    #[test]
    fn content_excerpt_caps_at_200_chars() {
        let m = memory("m1", &"c".repeat(500), None);
        let (lines, _) = select_lines(&[m], 1_000);
        // "[#m1] " prefix plus 200 excerpt chars
        assert_eq!(lines[0].chars().count(), 6 + 200);
    }

    #[test]
    fn budget_stops_at_first_overflow() {
        // Each 200-char content line estimates to ceil(206/4) = 52 tokens.
        // With max_tokens=40 even the first line would overflow a 40-token
        // budget... so use sizes that admit exactly one line.
        let memories = vec![
            memory("m1", &"a".repeat(100), None), // ~27 tokens
            memory("m2", &"b".repeat(200), None), // ~52 tokens, overflows
            memory("m3", "tiny", None),           // would fit, but must be skipped
        ];
        let (lines, consumed) = select_lines(&memories, 40);
        assert_eq!(lines.len(), 1, "stop at first overflow, no skip-ahead");
        assert!(lines[0].starts_with("[#m1]"));
        assert!(consumed <= 40);
    }

    #[test]
    fn emitted_lines_never_exceed_budget() {
        let memories: Vec<Memory> = (0..10)
            .map(|i| memory(&format!("m{i}"), &"x".repeat(80), None))
            .collect();
        let (lines, consumed) = select_lines(&memories, 60);
        let total: usize = lines.iter().map(|l| estimate_tokens(l)).sum();
        assert_eq!(total, consumed);
        assert!(consumed <= 60);
    }

    #[test]
    fn empty_selection_renders_null_context() {
        let (lines, _) = select_lines(&[], 100);
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn build_excludes_current_session() {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        pool.interact(|conn| {
            conn.execute(
                "INSERT INTO memories (id, project, content, kind, session_id, created_at_ms)
                 VALUES ('a', 'proj', 'memory from a', 'general', 'session-a', 1000),
                        ('b', 'proj', 'memory from b', 'general', 'session-b', 2000)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let injection = build_context(
            &pool,
            ContextParams {
                project: "proj".to_string(),
                max_tokens: DEFAULT_MAX_TOKENS,
                max_memories: DEFAULT_MAX_MEMORIES,
                session_id: Some("session-a".to_string()),
                max_age_days: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(injection.count, 1);
        let block = injection.context.unwrap();
        assert!(block.contains("[#b] memory from b"));
        assert!(!block.contains("memory from a"));
        assert!(block.starts_with("## Relevant Project Context"));
    }
}
