//! Conversation-key derivation (HKDF-SHA256).
//!
//! `derive_conversation_key(shared_secret, conversation_id, version)`:
//!   ikm  = shared secret (32 bytes)
//!   salt = fixed, so every member converges without exchanging anything else
//!   info = "ck-conversation-key-v1" || 0x00 || u32_be(len(id)) || id || u32_be(version)
//!
//! The id is length-prefixed so no two (id, version) pairs share an info string.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::{error::CryptoError, KEY_LEN};

const CONVERSATION_SALT: &[u8] = b"cipherkeep-conversation-salt-v1";
const CONVERSATION_INFO: &[u8] = b"ck-conversation-key-v1";

/// 256-bit symmetric key scoped to one (conversation, version). Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct ConversationKey([u8; KEY_LEN]);

impl ConversationKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "Conversation key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for ConversationKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl PartialEq for ConversationKey {
    fn eq(&self, other: &Self) -> bool {
        let mut diff = 0u8;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl Eq for ConversationKey {}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(<redacted>)")
    }
}

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

fn conversation_info(conversation_id: &str, version: u32) -> Vec<u8> {
    let id = conversation_id.as_bytes();
    let mut info = Vec::with_capacity(CONVERSATION_INFO.len() + 9 + id.len());
    info.extend_from_slice(CONVERSATION_INFO);
    info.push(0);
    info.extend_from_slice(&(id.len() as u32).to_be_bytes());
    info.extend_from_slice(id);
    info.extend_from_slice(&version.to_be_bytes());
    info
}

/// Deterministically derive the key for `(conversation_id, version)`.
pub fn derive_conversation_key(
    shared_secret: &[u8],
    conversation_id: &str,
    version: u32,
) -> Result<ConversationKey, CryptoError> {
    if shared_secret.len() != KEY_LEN {
        return Err(CryptoError::InvalidInput(format!(
            "shared secret must be {KEY_LEN} bytes, got {}",
            shared_secret.len()
        )));
    }
    if conversation_id.is_empty() {
        return Err(CryptoError::InvalidInput("conversation id must not be empty".into()));
    }
    let mut key = [0u8; KEY_LEN];
    hkdf_expand(
        shared_secret,
        Some(CONVERSATION_SALT),
        &conversation_info(conversation_id, version),
        &mut key,
    )?;
    Ok(ConversationKey(key))
}
