use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Number of hex characters kept from the idempotency digest.
pub const IDEMPOTENCY_KEY_LEN: usize = 32;

/// Fresh correlation id for a new causal chain.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Stable short hash over `source || canonical(payload)` used to detect and
/// skip replays of outbound events and command enqueues.
pub fn idempotency_key(source: &str, payload: &serde_json::Value) -> String {
    let canonical = canonical_json(payload);
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(IDEMPOTENCY_KEY_LEN);
    for byte in digest.iter() {
        if hex.len() >= IDEMPOTENCY_KEY_LEN {
            break;
        }
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(IDEMPOTENCY_KEY_LEN);
    hex
}

/// Short fingerprint of a presented credential, safe to write into audit rows.
pub fn principal_fingerprint(principal: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(principal.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(6)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Renders JSON with object keys sorted so equal values hash equally.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String((*key).clone()),
                        canonical_json(&map[*key])
                    )
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        serde_json::Value::Array(items) => {
            let body = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

/// Truncates `text` to at most `max_bytes`, cutting on a char boundary.
pub fn truncate_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
