//! Small helpers shared by the engine, the REST adapter and the CLI.

/// Trimmed text, or `None` when it is missing or blank
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Whether `value` is an absolute http(s) URL with something after the scheme
pub fn is_http_url(value: &str) -> bool {
    let value = value.trim();
    ["http://", "https://"]
        .iter()
        .any(|scheme| value.len() > scheme.len() && value.starts_with(scheme))
}

/// At most `max_chars` characters of trimmed text, ending in `...` when cut
pub fn excerpt(value: &str, max_chars: usize) -> String {
    let value = value.trim();
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut cut = value
        .chars()
        .take(max_chars.saturating_sub(3))
        .collect::<String>();
    cut.push_str("...");
    cut
}

/// Wall-clock time in Unix milliseconds, the unit operations are stamped in
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
