//! Payload encoding between JSON values and the store's string layout.
//!
//! Store hashes only carry string values, so a published payload is flattened
//! field by field: strings are stored raw, other primitives as their display
//! form, and nested objects or arrays as JSON text. Null fields are dropped.
//! On read the mapping is reversed heuristically: a value that looks like
//! JSON structure (`{` or `[` first byte) is decoded, everything else stays a
//! string. Primitive numbers and booleans therefore round-trip as strings;
//! consumers that need typed fields coerce on their side.

use serde_json::{Map, Value};
use tracing::warn;

/// A published update or a merged snapshot: JSON object fields to values.
pub type Payload = Map<String, Value>;

/// Flatten a payload into hash fields.
///
/// Null fields are dropped. Returns an empty vec when nothing remains, in
/// which case the snapshot write is skipped entirely.
pub fn to_hash_fields(payload: &Payload) -> Vec<(String, String)> {
    let mut fields = Vec::with_capacity(payload.len());
    for (name, value) in payload {
        match value {
            Value::Null => {}
            Value::String(s) => fields.push((name.clone(), s.clone())),
            Value::Bool(_) | Value::Number(_) => fields.push((name.clone(), value.to_string())),
            Value::Object(_) | Value::Array(_) => match serde_json::to_string(value) {
                Ok(encoded) => fields.push((name.clone(), encoded)),
                Err(e) => {
                    warn!(field = %name, error = %e, "Skipping unencodable payload field");
                }
            },
        }
    }
    fields
}

/// Reverse of [`to_hash_fields`] for a single stored value.
///
/// Values that look like encoded structure are decoded back to objects or
/// arrays; on decode failure the raw string is kept.
pub fn decode_hash_value(raw: String) -> Value {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        match serde_json::from_str(&raw) {
            Ok(value) => return value,
            Err(_) => return Value::String(raw),
        }
    }
    Value::String(raw)
}

/// Decode a full snapshot hash read from the store.
pub fn decode_snapshot(fields: Vec<(String, String)>) -> Payload {
    let mut snapshot = Payload::new();
    for (name, raw) in fields {
        snapshot.insert(name, decode_hash_value(raw));
    }
    snapshot
}

/// Decode one history list entry (a JSON-encoded payload object).
///
/// Non-object entries are dropped with a warning; only objects are ever
/// written, so anything else means the list was fed by foreign code.
pub fn decode_history_entry(raw: &str) -> Option<Payload> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        Ok(other) => {
            warn!(kind = other_kind(&other), "Dropping non-object history entry");
            None
        }
        Err(e) => {
            warn!(error = %e, "Dropping undecodable history entry");
            None
        }
    }
}

/// Shallow last-writer-wins merge of `update` into `snapshot`.
///
/// Null fields in the update are skipped rather than deleting the target
/// field, mirroring how producers drop nulls before writing.
pub fn merge_update(snapshot: &mut Payload, update: &Payload) {
    for (name, value) in update {
        if !value.is_null() {
            snapshot.insert(name.clone(), value.clone());
        }
    }
}

/// Sort history entries newest-first by their `timestamp` field.
///
/// The sort only fires when the first entry carries a `timestamp`; mixed
/// payload shapes are not re-examined. Entries without the field sort last.
pub fn sort_history_by_timestamp(history: &mut [Payload]) {
    let keyed = history
        .first()
        .map(|entry| entry.contains_key("timestamp"))
        .unwrap_or(false);
    if !keyed {
        return;
    }
    history.sort_by(|a, b| {
        let ta = timestamp_of(a);
        let tb = timestamp_of(b);
        tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
    });
}

fn timestamp_of(entry: &Payload) -> f64 {
    entry
        .get("timestamp")
        .and_then(Value::as_f64)
        .unwrap_or(f64::MIN)
}

fn other_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
