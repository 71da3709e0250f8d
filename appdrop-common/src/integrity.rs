//! SHA-256 content digests
//!
//! Descriptors pin archives by the hex-encoded SHA-256 of the downloaded bytes.

use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

/// Compute the lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();

    // 64KB chunks keep the hasher's working set small for multi-GB images
    for chunk in data.chunks(64 * 1024) {
        hasher.update(chunk);
    }

    hex::encode(hasher.finalize())
}

/// Whether `value` is a well-formed hex SHA-256 digest (either case)
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == SHA256_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compare an expected digest against a computed one, ignoring case
pub fn digest_matches(expected: &str, actual: &str) -> bool {
    expected.eq_ignore_ascii_case(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_spans_chunks() {
        let data = vec![7u8; 200 * 1024];
        let mut hasher = Sha256::new();
        hasher.update(&data);
        assert_eq!(sha256_hex(&data), hex::encode(hasher.finalize()));
    }

    #[test]
    fn test_is_sha256_hex() {
        assert!(is_sha256_hex(&"a".repeat(64)));
        assert!(is_sha256_hex(&"AbC123".repeat(10).chars().chain("ffff".chars()).collect::<String>()));
        assert!(!is_sha256_hex(&"a".repeat(63)));
        assert!(!is_sha256_hex(&"g".repeat(64)));
        assert!(!is_sha256_hex(""));
    }

    #[test]
    fn test_digest_matches_ignores_case() {
        assert!(digest_matches("ABCDEF", "abcdef"));
        assert!(!digest_matches("abcdef", "abcdee"));
    }
}
