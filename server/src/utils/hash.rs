//! Content hashing

use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA256 of a string as lowercase hex
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA256 of the JSON encoding of `value`.
///
/// Stable as long as the value's field order is fixed, so hash maps must not appear inside.
pub fn json_sha256_hex<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&serde_json::to_string(value)?))
}
