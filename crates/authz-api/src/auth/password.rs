//! Password hashing and verification using Argon2id
//!
//! Hashes are PHC strings (algorithm, parameters and salt embedded), so a
//! stored hash stays verifiable after the cost parameters change.
//!
//! Both operations are CPU-bound by design. Async callers go through
//! [`TokenIssuer`](super::issuer::TokenIssuer), which moves them onto the
//! blocking pool.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2, Params,
};
use authz_core::AuthConfig;
use thiserror::Error;

/// Password hashing errors
#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("Password must not be empty")]
    Empty,

    #[error("Failed to hash password: {0}")]
    HashingFailed(String),

    #[error("Invalid hashing parameters: {0}")]
    InvalidParams(String),
}

/// Argon2id cost parameters
#[derive(Debug, Clone)]
pub struct PasswordConfig {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub memory_cost: u32,
    /// Passes over memory (default: 3)
    pub time_cost: u32,
    /// Lanes (default: 4)
    pub parallelism: u32,
    /// Output length in bytes (default: 32)
    pub output_len: Option<usize>,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost: 65536,
            time_cost: 3,
            parallelism: 4,
            output_len: Some(32),
        }
    }
}

impl PasswordConfig {
    pub fn from_auth_config(config: &AuthConfig) -> Self {
        Self {
            memory_cost: config.hash_memory_kib,
            time_cost: config.hash_iterations,
            parallelism: config.hash_parallelism,
            output_len: Some(32),
        }
    }

    /// Cheapest parameters argon2 accepts; for tests only
    #[cfg(any(test, feature = "test-utils"))]
    pub fn insecure_fast() -> Self {
        Self {
            memory_cost: 8,
            time_cost: 1,
            parallelism: 1,
            output_len: Some(32),
        }
    }

    fn to_params(&self) -> Result<Params, PasswordError> {
        Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            self.output_len,
        )
        .map_err(|e| PasswordError::InvalidParams(e.to_string()))
    }
}

/// Hash a plaintext password with a fresh random salt
///
/// Returns [`PasswordError::Empty`] for an empty password; strength rules
/// are enforced separately by [`validate_password_strength`].
pub fn hash_password_with_config(
    password: &str,
    config: &PasswordConfig,
) -> Result<String, PasswordError> {
    if password.is_empty() {
        return Err(PasswordError::Empty);
    }

    let salt = SaltString::generate(&mut OsRng);
    let params = config.to_params()?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::HashingFailed(e.to_string()))?;

    Ok(password_hash.to_string())
}

/// Check a plaintext password against a stored PHC hash
///
/// Never fails: a mismatch and an unparseable hash both yield `false`.
/// The comparison itself is constant-time inside argon2.
pub fn verify_password(hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Enforce the password policy used for registration and resets
///
/// At least 8 characters with an uppercase letter, a lowercase letter, a
/// digit and a special character.
pub fn validate_password_strength(password: &str) -> Result<(), String> {
    if password.len() < 8 {
        return Err("Password must be at least 8 characters long".to_string());
    }
    if !password.chars().any(|c| c.is_uppercase()) {
        return Err("Password must contain at least one uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_lowercase()) {
        return Err("Password must contain at least one lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("Password must contain at least one digit".to_string());
    }
    if !password.chars().any(|c| !c.is_alphanumeric()) {
        return Err("Password must contain at least one special character".to_string());
    }
    Ok(())
}
