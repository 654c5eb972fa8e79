//! Test fixtures for generating test data.

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::macros::datetime;

/// Bearer secret of the upload principal in `AuthConfig::for_testing`.
pub const UPLOAD_TOKEN: &str = "test-upload-token";

/// Bearer secret of the ordinary principal in `AuthConfig::for_testing`.
pub const USER_TOKEN: &str = "test-user-token";

/// Backup timestamp used throughout the scenarios.
pub fn backed_up_at() -> OffsetDateTime {
    datetime!(2016-01-01 12:33:44 UTC)
}

/// Compute SHA-256 hash of data as hex string.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn sha256_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A small anonymisation script.
#[allow(dead_code)]
pub fn anonymisation_script() -> Vec<u8> {
    b"UPDATE users SET email = 'user' || id || '@example.com';".to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hash_matches_test_config() {
        assert_eq!(
            sha256_hash(UPLOAD_TOKEN.as_bytes()),
            "38d3354f54fb6756e59f735cc2ef6f71e5b4d3f85382190722ca28b328352b3c"
        );
    }
}
