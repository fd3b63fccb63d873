// src/config.rs
// Configuration: defaults, user config file, environment overrides
//
// Resolution order: built-in defaults ← deep-merged user file at
// ~/.config/opencode/opencode-mem.jsonc (comments tolerated; a sibling .json
// is accepted too) ← environment (PORT). String values starting with `~`
// expand to the user home. Invalid configuration is fatal at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::utils::expand_tilde;

/// Database file name under the storage path.
pub const DB_FILE_NAME: &str = "opencodemem.db";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// Directory holding the database file.
    pub storage_path: String,
    pub ingest: IngestConfig,
    pub embeddings: EmbeddingsConfig,
    pub chroma: ChromaConfig,
    pub search: SearchConfig,
    pub privacy: PrivacyConfig,
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IngestConfig {
    /// Queue poll cadence.
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    /// Delay before a failed message becomes visible again.
    pub retry_delay_ms: i64,
    /// Ingest endpoint budget; 0 disables limiting.
    pub rate_limit_per_minute: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 20,
            retry_delay_ms: 5_000,
            rate_limit_per_minute: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingsConfig {
    /// Provider URL; embeddings are disabled when unset.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub retry_delay_ms: u64,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChromaConfig {
    /// Vector store base URL; replication is a no-op when unset.
    pub url: Option<String>,
    pub collection: String,
    pub sync_interval_secs: u64,
    pub batch_size: usize,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            url: None,
            collection: "opencode-mem".to_string(),
            sync_interval_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchConfig {
    pub use_fts: bool,
    pub use_semantic: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            use_fts: true,
            use_semantic: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivacyConfig {
    pub strip_private_tags: bool,
    pub redact_secrets: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            strip_private_tags: true,
            redact_secrets: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub max_memories: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: crate::context::DEFAULT_MAX_TOKENS,
            max_memories: crate::context::DEFAULT_MAX_MEMORIES,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4747,
            storage_path: "~/.local/share/opencode".to_string(),
            ingest: IngestConfig::default(),
            embeddings: EmbeddingsConfig::default(),
            chroma: ChromaConfig::default(),
            search: SearchConfig::default(),
            privacy: PrivacyConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

impl Config {
    /// Candidate user config files, preferred first.
    fn config_paths() -> Vec<PathBuf> {
        let Some(home) = dirs::home_dir() else {
            return Vec::new();
        };
        let base = home.join(".config/opencode");
        vec![
            base.join("opencode-mem.jsonc"),
            base.join("opencode-mem.json"),
        ]
    }

    /// Load configuration, merging the user file over defaults.
    pub fn load() -> Result<Self> {
        let mut merged = serde_json::to_value(Config::default())?;

        for path in Self::config_paths() {
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            let stripped = strip_jsonc_comments(&contents);
            let user: serde_json::Value = serde_json::from_str(&stripped)
                .with_context(|| format!("invalid config file {}", path.display()))?;
            deep_merge(&mut merged, user);
            tracing::debug!(path = %path.display(), "loaded user config");
            break;
        }

        expand_tildes(&mut merged);

        let mut config: Config =
            serde_json::from_value(merged).context("configuration did not match schema")?;

        // Env override when running as a managed subprocess
        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .with_context(|| format!("invalid PORT value {port:?}"))?;
        }

        Ok(config)
    }

    /// Full path of the database file.
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.storage_path).join(DB_FILE_NAME)
    }
}

/// Recursively overlay `overlay` onto `base`; objects merge, scalars replace.
fn deep_merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Expand `~`-prefixed string values anywhere in the tree.
fn expand_tildes(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) if s.starts_with('~') => {
            *s = expand_tilde(s);
        }
        serde_json::Value::Object(map) => {
            for v in map.values_mut() {
                expand_tildes(v);
            }
        }
        serde_json::Value::Array(items) => {
            for v in items.iter_mut() {
                expand_tildes(v);
            }
        }
        _ => {}
    }
}

/// Drop `//` and `/* */` comments outside string literals.
///
/// Full JSONC parsing is out of scope; this tolerance is just enough to accept
/// the host's commented config files.
fn strip_jsonc_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Flags adjustable at runtime via GET/POST /api/settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    pub use_fts: bool,
    pub use_semantic: bool,
    pub sse_enabled: bool,
    pub strip_private_tags: bool,
    pub redact_secrets: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            use_fts: true,
            use_semantic: true,
            sse_enabled: true,
            strip_private_tags: true,
            redact_secrets: true,
        }
    }
}

impl RuntimeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            use_fts: config.search.use_fts,
            use_semantic: config.search.use_semantic,
            sse_enabled: true,
            strip_private_tags: config.privacy.strip_private_tags,
            redact_secrets: config.privacy.redact_secrets,
        }
    }

    pub fn privacy_filter(&self) -> crate::privacy::PrivacyFilter {
        crate::privacy::PrivacyFilter {
            strip_private_tags: self.strip_private_tags,
            redact_secrets: self.redact_secrets,
        }
    }
}
