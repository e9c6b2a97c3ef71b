//! Request fingerprinting for the idempotency layer.
//!
//! The fingerprint is a SHA-256 over the canonical serialization of the
//! request payload: compact JSON with object keys in lexicographic order.
//! `serde_json::Value` keeps object members in a `BTreeMap`, so serializing
//! a parsed payload already yields sorted keys; two requests with the same
//! members in any textual order hash identically, on any runtime. Payloads
//! covered by the fingerprint carry no floating-point values.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Computes the hex-encoded fingerprint of a request payload.
pub fn fingerprint(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
