//! Session password hashes: Argon2id in PHC string format.

use crate::error::{RelayError, RelayResult};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> RelayResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| RelayError::Other(format!("password hashing failed: {e}")))
}

/// Check a candidate password against a stored hash.
///
/// A malformed stored hash is an error; a wrong password is `Ok(false)`.
pub fn verify_password(candidate: &str, stored: &str) -> RelayResult<bool> {
    let parsed = PasswordHash::new(stored)
        .map_err(|e| RelayError::Other(format!("invalid password hash: {e}")))?;
    match Argon2::default().verify_password(candidate.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(RelayError::Other(format!("password verification failed: {e}"))),
    }
}
