pub mod static_provider;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

/// What a successful login resolves to: the identity the protocol engines
/// key everything on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub email: String,
    pub display_name: Option<String>,
}

#[async_trait]
pub trait LoginProvider {
    /// Verify a credential pair. Inactive accounts fail here.
    async fn login(&self, username: &str, password: &str) -> Result<UserProfile>;

    /// Resolve an address without a credential, for SMTP recipient
    /// validation and Autodiscover.
    async fn lookup(&self, email: &str) -> Result<UserProfile>;
}

pub type ArcLoginProvider = Arc<dyn LoginProvider + Send + Sync>;

pub fn hash_password(password: &str) -> Result<String> {
    use argon2::{
        password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
        Argon2,
    };
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    Ok(argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("Argon2 error: {}", e))?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    use argon2::{
        password_hash::{PasswordHash, PasswordVerifier},
        Argon2,
    };
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| anyhow!("Invalid hashed password: {}", e))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash).unwrap());
        assert!(!verify_password("hunter3", &hash).unwrap());
    }
}
