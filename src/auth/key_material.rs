// Key material: secret generation, Argon2id storage hash, SHA-256 lookup hash
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::config::CryptoConfig;
use crate::domain::RawSecret;
use crate::errors::{AppError, Result};

/// Bytes of entropy in a raw secret (256 bits).
pub const SECRET_BYTES: usize = 32;

/// Accepted raw secret length range, checked before any store lookup.
pub const SECRET_MIN_LEN: usize = 32;
pub const SECRET_MAX_LEN: usize = 256;

/// Freshly minted key material. Only `raw` is ever shown to the caller.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub raw: RawSecret,
    pub storage_hash: String,
    pub lookup_hash: String,
}

/// Derives and checks the two hashes carried by every API key.
#[derive(Clone)]
pub struct KeyMaterialManager {
    argon2: Argon2<'static>,
}

impl std::fmt::Debug for KeyMaterialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterialManager").finish_non_exhaustive()
    }
}

impl KeyMaterialManager {
    /// Builds an Argon2id hasher. Defaults follow OWASP 2023 (19 MiB, 2 passes, 1 lane).
    pub fn new(config: &CryptoConfig) -> Result<Self> {
        let params = Params::new(
            config.argon2_memory_kib,
            config.argon2_iterations,
            config.argon2_parallelism,
            Some(32),
        )
        .map_err(|e| AppError::Cryptographic(format!("Failed to create Argon2 params: {}", e)))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Draws a new secret from the OS random source and derives both hashes.
    ///
    /// Fails only when the secure random source is unavailable.
    pub fn generate(&self) -> Result<GeneratedKey> {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
            AppError::Cryptographic(format!("Secure random source unavailable: {}", e))
        })?;
        let raw = hex::encode(bytes);

        let storage_hash = self.storage_hash(&raw)?;
        let lookup_hash = lookup_hash(&raw);

        Ok(GeneratedKey {
            raw: RawSecret::new(raw),
            storage_hash,
            lookup_hash,
        })
    }

    /// Salted, memory-hard hash for proof of possession. Not deterministic.
    pub fn storage_hash(&self, raw: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(raw.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AppError::Cryptographic(format!("Failed to hash secret: {}", e)))
    }

    /// Checks `raw` against a stored PHC string. Cost parameters come from the string
    /// itself, so keys hashed under older settings keep verifying.
    pub fn verify(&self, raw: &str, storage_hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(storage_hash)
            .map_err(|e| AppError::Cryptographic(format!("Failed to parse storage hash: {}", e)))?;

        match self.argon2.verify_password(raw.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => {
                tracing::error!("Storage hash verification error: {}", e);
                Err(AppError::Cryptographic(format!("Verification error: {}", e)))
            }
        }
    }
}

/// Fast deterministic digest used as the index value. Lowercase hex SHA-256.
pub fn lookup_hash(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Cheap shape check that keeps garbage away from the stores.
pub fn is_well_formed(raw: &str) -> bool {
    (SECRET_MIN_LEN..=SECRET_MAX_LEN).contains(&raw.len())
        && raw.bytes().all(|b| b.is_ascii_graphic())
}

/// Compares two strings without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> KeyMaterialManager {
        KeyMaterialManager::new(&CryptoConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_generate_produces_high_entropy_hex() {
        let key = manager().generate().unwrap();
        assert_eq!(key.raw.expose().len(), SECRET_BYTES * 2);
        assert!(key.raw.expose().bytes().all(|b| b.is_ascii_hexdigit()));
        assert!(key.storage_hash.starts_with("$argon2id$"));
        assert_eq!(key.lookup_hash, lookup_hash(key.raw.expose()));

        let other = manager().generate().unwrap();
        assert_ne!(key.raw, other.raw);
    }

    #[test]
    fn test_storage_hash_is_salted() {
        let km = manager();
        let raw = "a".repeat(64);
        assert_ne!(km.storage_hash(&raw).unwrap(), km.storage_hash(&raw).unwrap());
    }

    #[test]
    fn test_verify() {
        let km = manager();
        let key = km.generate().unwrap();
        assert!(km.verify(key.raw.expose(), &key.storage_hash).unwrap());
        assert!(!km.verify(&"0".repeat(64), &key.storage_hash).unwrap());
        assert!(km.verify(key.raw.expose(), "not-a-phc-string").is_err());
    }

    #[test]
    fn test_verify_uses_params_from_hash() {
        let strong = KeyMaterialManager::new(&CryptoConfig {
            argon2_memory_kib: 2048,
            argon2_iterations: 2,
            argon2_parallelism: 1,
        })
        .unwrap();
        let key = strong.generate().unwrap();
        assert!(manager().verify(key.raw.expose(), &key.storage_hash).unwrap());
    }

    #[test]
    fn test_lookup_hash_is_deterministic() {
        assert_eq!(lookup_hash("secret"), lookup_hash("secret"));
        assert_ne!(lookup_hash("secret"), lookup_hash("secreT"));
        assert_eq!(lookup_hash("secret").len(), 64);
    }

    #[test]
    fn test_well_formed() {
        assert!(is_well_formed(&"f".repeat(64)));
        assert!(!is_well_formed("short"));
        assert!(!is_well_formed(&"f".repeat(257)));
        assert!(!is_well_formed(&format!("{} {}", "f".repeat(32), "f".repeat(32))));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("", "a"));
        assert!(constant_time_eq("", ""));
    }
}
