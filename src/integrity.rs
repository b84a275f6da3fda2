//! SHA-256 integrity verification for fetched archives.
//!
//! Release archives must match the digest declared in their manifest before
//! anything is unpacked. A mismatch is fatal; callers that want another try
//! must fetch again rather than re-verify the same bytes.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Lowercase hex SHA-256 of a buffer
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Verify a buffer against an expected hex digest (case-insensitive)
pub fn verify(bytes: &[u8], expected_digest: &str) -> Result<(), IntegrityError> {
    let actual = sha256_hex(bytes);
    if actual.eq_ignore_ascii_case(expected_digest.trim()) {
        Ok(())
    } else {
        Err(IntegrityError::Mismatch {
            expected: expected_digest.trim().to_ascii_lowercase(),
            actual,
        })
    }
}
