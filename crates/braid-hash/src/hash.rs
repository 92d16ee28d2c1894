use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::{dedup_messages, serialize_messages, serialize_system};

/// Lowercase hex SHA-256 of the input.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Hash a message sequence. Deduplication is applied internally, so the
/// hash of a sequence equals the hash of its deduplicated form.
pub fn hash_messages(messages: &[Value]) -> String {
    let deduped = dedup_messages(messages);
    sha256_hex(&serialize_messages(&deduped))
}

/// Hash a system prompt. Never mixed into message hashes.
pub fn hash_system(system: &Value) -> String {
    sha256_hex(&serialize_system(system))
}

/// The derived hashes for one request's message sequence.
#[derive(Debug, Clone)]
pub struct MessageHashes {
    pub current: String,
    /// Hash the previous request would have produced — the sequence minus
    /// the trailing assistant + user pair. Defined for dedup length >= 3.
    pub parent: Option<String>,
    /// One generation further back. Defined for dedup length >= 5.
    pub grandparent: Option<String>,
    pub dedup_len: usize,
}

/// Compute current / parent / grandparent hashes in one pass over the
/// deduplicated sequence.
pub fn compute_hashes(messages: &[Value]) -> MessageHashes {
    let deduped = dedup_messages(messages);
    let n = deduped.len();
    MessageHashes {
        current: sha256_hex(&serialize_messages(&deduped)),
        parent: (n >= 3).then(|| sha256_hex(&serialize_messages(&deduped[..n - 2]))),
        grandparent: (n >= 5).then(|| sha256_hex(&serialize_messages(&deduped[..n - 4]))),
        dedup_len: n,
    }
}
