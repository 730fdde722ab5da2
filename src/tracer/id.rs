//! Deterministic identifier derivation
//!
//! The same seed always maps to the same UUID, in this process or any other
//! implementation that hashes the seed the same way (SHA-256, first 16 bytes).

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Derive a stable identifier from an arbitrary seed string
pub fn derive_id(seed: &str) -> Uuid {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

/// Wire-level id of a local run id within a scope
pub fn scoped_id(local_id: &str, scope: &str) -> String {
    derive_id(&format!("{}{}", local_id, scope)).to_string()
}
