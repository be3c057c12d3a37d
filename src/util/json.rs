//! Convenience helpers for the JSON payload codec.
//!
//! API request bodies, response decoding and stash diagnostics all go through
//! these functions so the wire format is defined in one place.

use serde_json::Value;

/// Encode a value as compact JSON bytes.
pub fn encode_json(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Decode JSON bytes into a value.
pub fn decode_json(bytes: &[u8]) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Render a value as compact JSON text, truncated to `limit` characters.
///
/// Used when logging stashes and step results.
pub fn summarize(value: &Value, limit: usize) -> String {
    let text = value.to_string();
    if text.chars().count() <= limit {
        return text;
    }
    let mut truncated: String = text.chars().take(limit).collect();
    truncated.push_str("...");
    truncated
}
