use chrono::Utc;

/// RFC3339 timestamp in UTC (for persisted records and health responses).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

/// Keep at most `max_chars` characters, appending `...` when something was cut.
pub fn truncate_text(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars();
    let head = chars.by_ref().take(max_chars).collect::<String>();
    if chars.next().is_none() {
        return head;
    }
    format!("{head}...")
}
