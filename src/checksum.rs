//! Integrity checksums for persisted snapshot payloads.
//!
//! The checksum is taken over a canonical rendering of the JSON (object keys
//! sorted at every level), so a payload read back from a JSONB column hashes
//! to the same value as the payload that was written, whatever key order the
//! database returns.
//!
//! Upserts compare checksums to skip rewriting unchanged snapshots, and the
//! consistency checker flags rows whose payload no longer matches the stored
//! checksum (hand edits, partial backfills).

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 (hex) of the canonical JSON rendering of `payload`.
pub fn payload_checksum(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// True when `checksum` matches the payload.
pub fn verify_payload(payload: &Value, checksum: &str) -> bool {
    let computed = payload_checksum(payload);
    if computed == checksum {
        true
    } else {
        tracing::warn!(
            "Snapshot checksum mismatch. Expected: {}, computed: {}",
            checksum,
            computed
        );
        false
    }
}

/// JSON text with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
