//! Password-based key derivation.
//!
//! Two strategies behind one trait, chosen once when the store is built:
//!
//! - [`Argon2idKdf`]: the default. Memory-hard, 64 MiB / 3 passes / 1 lane.
//! - [`Pbkdf2Kdf`]: PBKDF2-HMAC-SHA256. REDUCED SECURITY; only for targets
//!   where Argon2id cannot run. Never selected unless the config names it.
//!
//! Salts are 16 random bytes, stored next to whatever the derived key protects,
//! together with the [`KdfParams`] that produced the key. Opening always uses
//! the recorded parameters; the configured ones only apply to new seals.

use argon2::{Algorithm, Argon2, Params, Version};
use hmac::Hmac;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::warn;
use zeroize::Zeroizing;

use crate::{error::CryptoError, KEY_LEN};

pub const SALT_LEN: usize = 16;
pub const MIN_PASSWORD_LEN: usize = 8;

/// 64 MiB, the floor for production Argon2id.
pub const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
pub const ARGON2_ITERATIONS: u32 = 3;
pub const ARGON2_PARALLELISM: u32 = 1;
pub const PBKDF2_ROUNDS: u32 = 600_000;

// Ceilings for parameters read back from storage or a backup. 1 GiB of
// Argon2 memory is already far beyond anything this crate writes.
pub const MAX_ARGON2_MEMORY_KIB: u32 = 1024 * 1024;
pub const MAX_ARGON2_ITERATIONS: u32 = 64;
pub const MAX_ARGON2_PARALLELISM: u32 = 16;
pub const MAX_PBKDF2_ROUNDS: u32 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum KdfAlgorithm {
    #[default]
    #[serde(rename = "argon2id")]
    Argon2id,
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256,
}

impl KdfAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KdfAlgorithm::Argon2id => "argon2id",
            KdfAlgorithm::Pbkdf2Sha256 => "pbkdf2-sha256",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "argon2id" => Some(KdfAlgorithm::Argon2id),
            "pbkdf2-sha256" => Some(KdfAlgorithm::Pbkdf2Sha256),
            _ => None,
        }
    }
}

impl std::fmt::Display for KdfAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfConfig {
    #[serde(default)]
    pub algorithm: KdfAlgorithm,
    #[serde(default = "default_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    #[serde(default = "default_pbkdf2_rounds")]
    pub pbkdf2_rounds: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: ARGON2_MEMORY_KIB,
            iterations: ARGON2_ITERATIONS,
            parallelism: ARGON2_PARALLELISM,
            pbkdf2_rounds: PBKDF2_ROUNDS,
        }
    }
}

impl KdfConfig {
    /// Cheap parameters for tests. Never use for real data.
    pub fn insecure_fast() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
            pbkdf2_rounds: 1_000,
        }
    }

    /// The parameter set for the algorithm this config names.
    pub fn params(&self) -> KdfParams {
        match self.algorithm {
            KdfAlgorithm::Argon2id => KdfParams::Argon2id {
                memory_kib: self.memory_kib,
                iterations: self.iterations,
                parallelism: self.parallelism,
            },
            KdfAlgorithm::Pbkdf2Sha256 => KdfParams::Pbkdf2Sha256 { rounds: self.pbkdf2_rounds },
        }
    }

    /// Build the strategy this config names.
    pub fn build(&self) -> Result<Arc<dyn PasswordKdf>, CryptoError> {
        self.params().build()
    }
}

/// Everything needed to re-derive a password key, recorded next to the salt.
///
/// JSON: `{"algorithm":"argon2id","memoryKib":65536,"iterations":3,"parallelism":1}`
/// or `{"algorithm":"pbkdf2-sha256","rounds":600000}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum KdfParams {
    #[serde(rename = "argon2id", rename_all = "camelCase")]
    Argon2id { memory_kib: u32, iterations: u32, parallelism: u32 },
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256 { rounds: u32 },
}

impl KdfParams {
    pub fn algorithm(&self) -> KdfAlgorithm {
        match self {
            KdfParams::Argon2id { .. } => KdfAlgorithm::Argon2id,
            KdfParams::Pbkdf2Sha256 { .. } => KdfAlgorithm::Pbkdf2Sha256,
        }
    }

    /// Reject costs above the `MAX_*` ceilings. Parameters come from disk or
    /// from a backup file, so they are untrusted input.
    pub fn check_bounds(&self) -> Result<(), CryptoError> {
        let ok = match *self {
            KdfParams::Argon2id { memory_kib, iterations, parallelism } => {
                memory_kib <= MAX_ARGON2_MEMORY_KIB
                    && iterations <= MAX_ARGON2_ITERATIONS
                    && parallelism <= MAX_ARGON2_PARALLELISM
            }
            KdfParams::Pbkdf2Sha256 { rounds } => rounds <= MAX_PBKDF2_ROUNDS,
        };
        if ok {
            Ok(())
        } else {
            Err(CryptoError::InvalidInput(format!("kdf parameters out of range: {self:?}")))
        }
    }

    /// Build the strategy these parameters describe, after [`Self::check_bounds`].
    pub fn build(&self) -> Result<Arc<dyn PasswordKdf>, CryptoError> {
        self.check_bounds()?;
        Ok(match *self {
            KdfParams::Argon2id { memory_kib, iterations, parallelism } => {
                Arc::new(Argon2idKdf::new(memory_kib, iterations, parallelism)?)
            }
            KdfParams::Pbkdf2Sha256 { rounds } => Arc::new(Pbkdf2Kdf::reduced_security(rounds)?),
        })
    }
}

fn default_memory_kib() -> u32 {
    ARGON2_MEMORY_KIB
}

fn default_iterations() -> u32 {
    ARGON2_ITERATIONS
}

fn default_parallelism() -> u32 {
    ARGON2_PARALLELISM
}

fn default_pbkdf2_rounds() -> u32 {
    PBKDF2_ROUNDS
}

/// Strategy interface for turning a password + salt into a 32-byte key.
pub trait PasswordKdf: Send + Sync {
    fn algorithm(&self) -> KdfAlgorithm;

    /// The exact parameters this strategy derives with.
    fn params(&self) -> KdfParams;

    /// True for strategies weaker than the memory-hard default.
    fn is_reduced_security(&self) -> bool;

    fn derive(&self, password: &str, salt: &[u8; SALT_LEN])
        -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError>;
}

impl std::fmt::Debug for dyn PasswordKdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordKdf")
            .field("algorithm", &self.algorithm())
            .field("reduced_security", &self.is_reduced_security())
            .finish()
    }
}

// ── Argon2id ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Argon2idKdf {
    params: Params,
}

impl Argon2idKdf {
    pub fn new(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, CryptoError> {
        let params = Params::new(memory_kib, iterations, parallelism, Some(KEY_LEN))
            .map_err(|e| CryptoError::KeyDerivation(format!("argon2 params: {e}")))?;
        if memory_kib < ARGON2_MEMORY_KIB {
            warn!(memory_kib, "argon2id configured below the 64 MiB production floor");
        }
        Ok(Self { params })
    }

    pub fn memory_kib(&self) -> u32 {
        self.params.m_cost()
    }
}

impl Default for Argon2idKdf {
    fn default() -> Self {
        Self {
            params: Params::new(ARGON2_MEMORY_KIB, ARGON2_ITERATIONS, ARGON2_PARALLELISM, Some(KEY_LEN))
                .expect("Static Argon2 params are always valid"),
        }
    }
}

impl PasswordKdf for Argon2idKdf {
    fn algorithm(&self) -> KdfAlgorithm {
        KdfAlgorithm::Argon2id
    }

    fn params(&self) -> KdfParams {
        KdfParams::Argon2id {
            memory_kib: self.params.m_cost(),
            iterations: self.params.t_cost(),
            parallelism: self.params.p_cost(),
        }
    }

    fn is_reduced_security(&self) -> bool {
        false
    }

    fn derive(
        &self,
        password: &str,
        salt: &[u8; SALT_LEN],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let mut output = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(password.as_bytes(), salt, output.as_mut_slice())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(output)
    }
}

// ── PBKDF2 (reduced security) ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Pbkdf2Kdf {
    rounds: u32,
}

impl Pbkdf2Kdf {
    /// The only constructor. Logs a warning every time it is used.
    pub fn reduced_security(rounds: u32) -> Result<Self, CryptoError> {
        if rounds == 0 {
            return Err(CryptoError::KeyDerivation("pbkdf2 rounds must be non-zero".into()));
        }
        warn!(rounds, "using REDUCED-SECURITY PBKDF2-HMAC-SHA256 password derivation");
        Ok(Self { rounds })
    }
}

impl PasswordKdf for Pbkdf2Kdf {
    fn algorithm(&self) -> KdfAlgorithm {
        KdfAlgorithm::Pbkdf2Sha256
    }

    fn params(&self) -> KdfParams {
        KdfParams::Pbkdf2Sha256 { rounds: self.rounds }
    }

    fn is_reduced_security(&self) -> bool {
        true
    }

    fn derive(
        &self,
        password: &str,
        salt: &[u8; SALT_LEN],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
        let mut output = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, self.rounds, output.as_mut_slice())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(output)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Reject passwords shorter than `min` characters (never below [`MIN_PASSWORD_LEN`]).
pub fn validate_password(password: &str, min: usize) -> Result<(), CryptoError> {
    let min = min.max(MIN_PASSWORD_LEN);
    if password.chars().count() < min {
        return Err(CryptoError::PasswordTooShort { min });
    }
    Ok(())
}

/// Generate a fresh random 16-byte salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}
