//! Unlock secret hashing and verification.
//!
//! The clear-text password issued by the server never reaches storage;
//! only its hex SHA-256 digest is kept. Verification is constant-time.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hex-encoded SHA-256 of an unlock secret.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Compare a candidate password against a stored digest in constant time.
///
/// A stored value that is not valid hex never matches.
pub fn verify_secret(candidate: &str, stored_hash: &str) -> bool {
    let Ok(expected) = hex::decode(stored_hash) else {
        return false;
    };
    let computed = Sha256::digest(candidate.as_bytes());
    computed.as_slice().ct_eq(expected.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = hash_secret("abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_accepts_only_exact_secret() {
        let stored = hash_secret("482913");
        assert!(verify_secret("482913", &stored));
        assert!(!verify_secret("482914", &stored));
        assert!(!verify_secret("", &stored));
        assert!(!verify_secret(" 482913", &stored));
    }

    #[test]
    fn test_verify_rejects_malformed_digest() {
        assert!(!verify_secret("482913", "not-hex"));
        assert!(!verify_secret("482913", "abcd"));
    }
}
