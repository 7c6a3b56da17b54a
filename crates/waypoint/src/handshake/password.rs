//! Password challenge: only `SHA-256(password + salt)` crosses the wire.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

pub const SALT_LENGTH: usize = 16;

pub fn generate_salt() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_LENGTH)
        .map(char::from)
        .collect()
}

/// Lowercase hex SHA-256 of `password` followed by `salt`.
pub fn password_digest(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compares two digests without stopping at the first difference.
pub fn digests_match(expected: &str, provided: &str) -> bool {
    bytes_match(expected.as_bytes(), provided.as_bytes())
}

/// Constant-time equality for secrets of the same length.
pub fn bytes_match(expected: &[u8], provided: &[u8]) -> bool {
    expected.len() == provided.len()
        && expected
            .iter()
            .zip(provided)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
