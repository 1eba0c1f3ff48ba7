//! Authenticated Encryption with Associated Data
//!
//! Uses AES-256-GCM.
//! Key size: 32 bytes.  IV: 12 bytes (random, fresh per call).  Tag: 16 bytes.
//!
//! The three parts are kept apart in [`Sealed`] because the conversation-key
//! table stores them in separate columns. Where a single blob is needed the
//! byte layout is:
//!   [ iv (12 bytes) | ciphertext | tag (16 bytes) ]

use aes_gcm::{
    aead::{AeadCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use zeroize::Zeroizing;

use crate::{error::CryptoError, KEY_LEN};

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Output of one encryption: iv, ciphertext (same length as plaintext) and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl Sealed {
    /// Serialise as `iv || ciphertext || tag`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IV_LEN + self.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parse `iv || ciphertext || tag`. Too-short input is reported as a
    /// decryption failure, the same as a bad tag.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < IV_LEN + TAG_LEN {
            return Err(CryptoError::AeadDecrypt);
        }
        let (iv, rest) = data.split_at(IV_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        Ok(Self {
            iv: to_array(iv)?,
            ciphertext: ciphertext.to_vec(),
            tag: to_array(tag)?,
        })
    }
}

fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], CryptoError> {
    bytes.try_into().map_err(|_| CryptoError::AeadDecrypt)
}

/// Encrypt `plaintext` under a 32-byte key with a fresh random IV.
pub fn encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    encrypt_with_aad(key, plaintext, &[])
}

/// Encrypt with additional associated data (authenticated but not encrypted).
pub fn encrypt_with_aad(
    key: &[u8; KEY_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(&nonce, aad, &mut buffer)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(nonce.as_slice());
    let mut tag_out = [0u8; TAG_LEN];
    tag_out.copy_from_slice(tag.as_slice());

    Ok(Sealed { iv, ciphertext: buffer, tag: tag_out })
}

/// Decrypt and authenticate. Any mismatch (key, iv, ciphertext, tag, lengths)
/// yields the same [`CryptoError::AeadDecrypt`].
pub fn decrypt(
    key: &[u8; KEY_LEN],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    decrypt_with_aad(key, iv, ciphertext, tag, &[])
}

pub fn decrypt_with_aad(
    key: &[u8; KEY_LEN],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;

    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(iv),
            aad,
            buffer.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(buffer)
}

/// Decrypt a [`Sealed`] value.
pub fn open(key: &[u8; KEY_LEN], sealed: &Sealed, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    decrypt_with_aad(key, &sealed.iv, &sealed.ciphertext, &sealed.tag, aad)
}

/// Encrypt a 32-byte key with another 32-byte wrapping key.
pub fn wrap_key(
    wrapping_key: &[u8; KEY_LEN],
    key_to_wrap: &[u8; KEY_LEN],
    aad: &[u8],
) -> Result<Sealed, CryptoError> {
    encrypt_with_aad(wrapping_key, key_to_wrap, aad)
}

/// Decrypt a wrapped key.
pub fn unwrap_key(
    wrapping_key: &[u8; KEY_LEN],
    wrapped: &Sealed,
    aad: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let plaintext = open(wrapping_key, wrapped, aad)?;
    if plaintext.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey("Unwrapped key wrong length".into()));
    }
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    out.copy_from_slice(&plaintext);
    Ok(out)
}
