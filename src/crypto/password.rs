//! Salted, adaptive-cost password hashing (Argon2id) and constant-time
//! verification.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng};
use argon2::Argon2;

use crate::error::{Error, Result};

/// Hash `plaintext` with a fresh random salt, returning a PHC-format string
/// suitable for storage in [`crate::model::User::password_hash`].
///
/// # Errors
///
/// Returns an error if the underlying Argon2 hasher fails, which only
/// happens on catastrophic misuse (not on ordinary password input).
pub fn hash_password(plaintext: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plaintext.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("password hash: {e}")))
}

/// Verify `plaintext` against a stored PHC hash. Comparison is
/// constant-time with respect to the plaintext, per Argon2's verifier.
/// A malformed stored hash is treated as a non-match rather than an error:
/// the caller (the Authentication Orchestrator) must not distinguish "bad
/// stored hash" from "wrong password" in its response.
#[must_use]
pub fn verify_password(plaintext: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_succeeds() {
        let hash = hash_password("Correct123!").unwrap();
        assert!(verify_password("Correct123!", &hash));
    }

    #[test]
    fn wrong_password_fails() {
        let hash = hash_password("Correct123!").unwrap();
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn distinct_salts_for_identical_plaintext() {
        let a = hash_password("Correct123!").unwrap();
        let b = hash_password("Correct123!").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_stored_hash_is_non_match_not_panic() {
        assert!(!verify_password("anything", "not-a-valid-phc-string"));
    }
}
