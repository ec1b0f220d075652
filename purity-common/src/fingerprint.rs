//! Content fingerprinting
//!
//! Image references are keyed by the SHA-256 digest of the reference string.
//! The digest doubles as the public `hash` field of cached annotations.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded fingerprint
pub const FINGERPRINT_LEN: usize = 64;

/// Lowercase hex SHA-256 of `reference`
pub fn fingerprint(reference: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(reference.as_bytes());
    format!("{:x}", hasher.finalize())
}
