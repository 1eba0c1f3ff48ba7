//! Stored key records.
//!
//! These mirror the local key tables one-to-one and are what a backup
//! carries. Every secret field is already wrapped: private keys under a
//! password-derived key, conversation keys under the session master key.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use ck_crypto::{aead::IV_LEN, password::SALT_LEN, KdfAlgorithm, KdfParams};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeyPair {
    /// Caller-chosen identifier.
    pub id: String,
    /// Base64 X25519 public key (not secret).
    pub public_key: String,
    /// Base64 of `salt || nonce || ciphertext+tag`, see [`PrivateKeyBlob`].
    pub encrypted_private_key: String,
    /// Password KDF the private key was sealed with.
    #[serde(default)]
    pub kdf: KdfAlgorithm,
    /// Full cost parameters of that KDF. Absent only on records written
    /// before parameters were recorded; those open with the configured ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf_params: Option<KdfParams>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredConversationKey {
    pub conversation_id: String,
    /// Base64 wrapped key bytes (ciphertext without tag).
    pub encrypted_key: String,
    /// Base64 12-byte IV.
    pub iv: String,
    /// Base64 16-byte tag.
    pub tag: String,
    /// Starts at 1, +1 per rotation.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

impl StoredConversationKey {
    pub fn info(&self) -> ConversationKeyInfo {
        ConversationKeyInfo {
            version: self.version,
            created_at: self.created_at,
            rotated_at: self.rotated_at,
        }
    }
}

/// Metadata readable without the master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKeyInfo {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

/// One append-only audit entry. `reason` is stored verbatim and never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationRecord {
    pub conversation_id: String,
    pub old_version: u32,
    pub new_version: u32,
    pub rotated_at: DateTime<Utc>,
    pub reason: String,
}

// ── Private-key blob ──────────────────────────────────────────────────────────

/// Binary layout of a wrapped private key:
///   [ salt (16 bytes) | nonce (12 bytes) | ciphertext + tag ]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKeyBlob {
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; IV_LEN],
    /// Ciphertext with the 16-byte tag appended.
    pub ciphertext: Vec<u8>,
}

impl PrivateKeyBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SALT_LEN + IV_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() <= SALT_LEN + IV_LEN {
            return Err(ProtoError::InvalidField {
                field: "encryptedPrivateKey",
                reason: format!("blob too short ({} bytes)", data.len()),
            });
        }
        let (salt, rest) = data.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(IV_LEN);
        let mut salt_arr = [0u8; SALT_LEN];
        salt_arr.copy_from_slice(salt);
        let mut nonce_arr = [0u8; IV_LEN];
        nonce_arr.copy_from_slice(nonce);
        Ok(Self { salt: salt_arr, nonce: nonce_arr, ciphertext: ciphertext.to_vec() })
    }

    pub fn to_b64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_b64(s: &str) -> Result<Self, ProtoError> {
        Self::from_bytes(&STANDARD.decode(s)?)
    }
}
