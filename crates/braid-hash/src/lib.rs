//! Deterministic content hashing for conversation linking.
//!
//! Two semantically identical requests — differing only in duplicated
//! tool blocks, cache-control metadata, or `\r\n` line endings — must
//! produce the same hash. Canonicalization happens on raw JSON message
//! values so unknown block kinds survive untouched.

mod canonical;
mod hash;

pub use canonical::{
    dedup_messages, serialize_message, serialize_messages, serialize_system, strip_reminders,
};
pub use hash::{compute_hashes, hash_messages, hash_system, sha256_hex, MessageHashes};
