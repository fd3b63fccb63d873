// src/utils.rs
// Small shared helpers

use std::path::Path;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert a path to a String, lossily.
pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Truncate a string to at most `max` characters on a char boundary,
/// appending an ellipsis when anything was cut.
pub fn truncate_with_ellipsis(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}…", cut)
}

/// Truncate to at most `max` characters with no marker (summary field caps).
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(value: &str) -> String {
    if let Some(rest) = value.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{}", home.to_string_lossy(), rest);
        }
    }
    value.to_string()
}
