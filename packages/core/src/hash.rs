//! SHA-256 content hashing for the content-addressed store.
//!
//! Content hashes are lowercase 64-character hex digests. The hash of a byte
//! sequence is the only linkage between file metadata and the blob holding
//! its bytes, so the encoding here is load-bearing and must never change.

use sha2::{Digest, Sha256};

/// SHA-256 of the empty byte sequence, the hash every zero-length file gets.
pub const EMPTY_CONTENT_HASH: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Computes the lowercase hex SHA-256 digest of `bytes`.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Checks whether `s` is a well-formed content hash (64 lowercase hex chars).
#[must_use]
pub fn is_content_hash(s: &str) -> bool {
    s.len() == 64
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bytes_hash_matches_constant() {
        assert_eq!(content_hash(b""), EMPTY_CONTENT_HASH);
    }

    #[test]
    fn hello_world_hash_is_known_vector() {
        assert_eq!(
            content_hash(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn hash_shape_validation() {
        assert!(is_content_hash(EMPTY_CONTENT_HASH));
        assert!(!is_content_hash("abc"));
        assert!(!is_content_hash(&EMPTY_CONTENT_HASH.to_uppercase()));
        assert!(!is_content_hash(&format!("{}x", &EMPTY_CONTENT_HASH[..63])));
    }

    #[test]
    fn distinct_inputs_distinct_hashes() {
        assert_ne!(content_hash(b"a"), content_hash(b"b"));
    }
}
