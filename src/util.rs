use sha2::Digest;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Longest prefix of `text` that fits in `max_bytes` on a char boundary.
fn prefix_within(text: &str, max_bytes: usize) -> &str {
    let end = text
        .char_indices()
        .map(|(idx, ch)| idx + ch.len_utf8())
        .take_while(|end| *end <= max_bytes)
        .last()
        .unwrap_or(0);
    &text[..end]
}

/// Short preview of model output for log fields and error messages.
pub fn preview(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    format!("{}...", prefix_within(text, max_bytes))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
