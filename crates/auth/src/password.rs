use crate::AuthError;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;

/// Hashes a password with Argon2id and a fresh random salt, producing a PHC
/// string suitable for storage.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| AuthError::Hashing)?;
    Ok(hash.to_string())
}

/// Verifies a password against a stored PHC hash. An unparseable stored hash
/// verifies as false rather than erroring, so callers cannot distinguish a
/// corrupt record from a wrong password.
pub fn verify_password(stored_hash: &str, supplied: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied.as_bytes(), &parsed)
        .is_ok()
}
