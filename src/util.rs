use chrono::Local;

/// Timestamp format used in ledger columns and report headers.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_timestamp() -> String {
    Local::now().naive_local().format(TIMESTAMP_FORMAT).to_string()
}

pub fn truncate_string(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut truncated = String::new();
    for ch in text.chars() {
        if truncated.len() + ch.len_utf8() > max_bytes {
            break;
        }
        truncated.push(ch);
    }
    truncated
}

/// Quote a value for SQL text that is only printed, never executed.
pub fn sql_literal(value: &str) -> String {
    let mut literal = String::with_capacity(value.len() + 2);
    literal.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => literal.push_str("''"),
            '\n' => literal.push_str("' || char(10) || '"),
            '\r' => literal.push_str("' || char(13) || '"),
            _ => literal.push(ch),
        }
    }
    literal.push('\'');
    literal
}

/// Keep a free-text value from breaking the comma-delimited streams.
pub fn stream_safe(value: &str) -> String {
    value.replace([',', '\n', '\r'], " ")
}
