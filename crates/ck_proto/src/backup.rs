//! Backup payload and encrypted envelope.
//!
//! `BackupPayload` (JSON) → AEAD under a password-derived key → `EncryptedBackup`.
//!
//! Envelope JSON, as handed to the backup transport:
//! ```json
//! { "version": 1, "encryptedData": "<b64 ct||tag>", "iv": "<b64>",
//!   "salt": "<b64>", "createdAt": "2026-01-01T00:00:00Z", "kdf": "argon2id",
//!   "kdfParams": { "algorithm": "argon2id", "memoryKib": 65536, "iterations": 3, "parallelism": 1 } }
//! ```

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use ck_crypto::{aead::IV_LEN, password::SALT_LEN, KdfAlgorithm, KdfParams};
use serde::{Deserialize, Serialize};

use crate::{
    error::ProtoError,
    keys::{RotationRecord, StoredConversationKey, StoredKeyPair},
};

/// The only backup format this build reads or writes.
pub const BACKUP_FORMAT_VERSION: u32 = 1;

/// Everything in the key store, as persisted (still wrapped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPayload {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub key_pairs: Vec<StoredKeyPair>,
    pub conversation_keys: Vec<StoredConversationKey>,
    #[serde(default)]
    pub rotation_history: Vec<RotationRecord>,
}

impl BackupPayload {
    pub fn is_empty(&self) -> bool {
        self.key_pairs.is_empty() && self.conversation_keys.is_empty()
    }
}

/// Password-protected backup blob. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBackup {
    pub version: u32,
    /// Base64 ciphertext with the 16-byte tag appended.
    pub encrypted_data: String,
    /// Base64 12-byte IV.
    pub iv: String,
    /// Base64 16-byte KDF salt.
    pub salt: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub kdf: KdfAlgorithm,
    /// Cost parameters the backup key was derived with. A restoring device
    /// uses these, whatever its own configuration says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf_params: Option<KdfParams>,
}

impl EncryptedBackup {
    pub fn new(
        ciphertext: &[u8],
        iv: &[u8; IV_LEN],
        salt: &[u8; SALT_LEN],
        kdf_params: KdfParams,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            version: BACKUP_FORMAT_VERSION,
            encrypted_data: STANDARD.encode(ciphertext),
            iv: STANDARD.encode(iv),
            salt: STANDARD.encode(salt),
            created_at,
            kdf: kdf_params.algorithm(),
            kdf_params: Some(kdf_params),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn ciphertext_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(STANDARD.decode(&self.encrypted_data)?)
    }

    pub fn iv_bytes(&self) -> Result<[u8; IV_LEN], ProtoError> {
        decode_fixed(&self.iv, "iv")
    }

    pub fn salt_bytes(&self) -> Result<[u8; SALT_LEN], ProtoError> {
        decode_fixed(&self.salt, "salt")
    }
}

fn decode_fixed<const N: usize>(b64: &str, field: &'static str) -> Result<[u8; N], ProtoError> {
    let bytes = STANDARD.decode(b64)?;
    bytes.as_slice().try_into().map_err(|_| ProtoError::InvalidField {
        field,
        reason: format!("expected {N} bytes, got {}", bytes.len()),
    })
}
