//! X25519 key agreement.
//!
//! Each identity/device owns one [`KeyPair`]. Two parties combine their own
//! private scalar with the peer's public point and arrive at the same
//! 32-byte [`SharedSecret`] without transmitting it.
//!
//! Key generation draws from the OS RNG; [`KeyExchange::ready`] probes that
//! source once before the first key pair is produced.

use std::sync::atomic::{AtomicBool, Ordering};

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{error::CryptoError, KEY_LEN};

// ── Readiness ────────────────────────────────────────────────────────────────

/// Handle to the key-exchange backend. Starts uninitialised.
#[derive(Debug, Default)]
pub struct KeyExchange {
    ready: AtomicBool,
}

impl KeyExchange {
    pub const fn new() -> Self {
        Self { ready: AtomicBool::new(false) }
    }

    /// One-time initialisation. Idempotent.
    pub fn ready(&self) -> Result<(), CryptoError> {
        if self.is_ready() {
            return Ok(());
        }
        let mut probe = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut probe)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        if probe.iter().all(|b| *b == 0) {
            return Err(CryptoError::KeyGeneration("RNG returned an all-zero block".into()));
        }
        probe.zeroize();
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Generate a fresh X25519 key pair.
    pub fn generate_key_pair(&self) -> Result<KeyPair, CryptoError> {
        if !self.is_ready() {
            return Err(CryptoError::NotInitialised);
        }
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Ok(KeyPair { public: public.to_bytes(), private: secret.to_bytes() })
    }
}

// ── Key pair ─────────────────────────────────────────────────────────────────

/// X25519 key pair. The private half is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct KeyPair {
    #[zeroize(skip)]
    public: [u8; KEY_LEN],
    private: [u8; KEY_LEN],
}

impl KeyPair {
    /// Rebuild a key pair from a stored private scalar.
    pub fn from_private_bytes(private: &[u8]) -> Result<Self, CryptoError> {
        let mut arr = to_32(private, "private key")?;
        let secret = StaticSecret::from(arr);
        let public = X25519Public::from(&secret).to_bytes();
        let pair = Self { public, private: arr };
        arr.zeroize();
        Ok(pair)
    }

    /// Build from both halves, checking that they belong together.
    pub fn from_parts(public: &[u8], private: &[u8]) -> Result<Self, CryptoError> {
        let pair = Self::from_private_bytes(private)?;
        if pair.public.as_slice() != public {
            return Err(CryptoError::InvalidKey("public key does not match private key".into()));
        }
        Ok(pair)
    }

    pub fn public_key(&self) -> &[u8; KEY_LEN] {
        &self.public
    }

    pub fn private_key(&self) -> &[u8; KEY_LEN] {
        &self.private
    }

    /// Export the public key in base64 format.
    pub fn public_b64(&self) -> String {
        STANDARD.encode(self.public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_b64())
            .field("private", &"<redacted>")
            .finish()
    }
}

// ── Shared secret ────────────────────────────────────────────────────────────

/// 32-byte ECDH output. Zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for SharedSecret {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time comparison
        let mut diff = 0u8;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl Eq for SharedSecret {}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// X25519(private_key, peer_public_key).
///
/// Both inputs must be exactly 32 bytes. A result of all zeroes (peer sent a
/// low-order point) is rejected.
pub fn derive_shared_secret(
    private_key: &[u8],
    peer_public_key: &[u8],
) -> Result<SharedSecret, CryptoError> {
    let mut sk_bytes = to_32(private_key, "private key")?;
    let pk_bytes = to_32(peer_public_key, "peer public key")?;

    let secret = StaticSecret::from(sk_bytes);
    sk_bytes.zeroize();
    let shared = secret.diffie_hellman(&X25519Public::from(pk_bytes));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("peer public key is a low-order point".into()));
    }
    Ok(SharedSecret(shared.to_bytes()))
}

fn to_32(bytes: &[u8], what: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    bytes.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("{what} must be {KEY_LEN} bytes, got {}", bytes.len()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> KeyExchange {
        let kx = KeyExchange::new();
        kx.ready().unwrap();
        kx
    }

    #[test]
    fn generate_before_ready_fails() {
        let kx = KeyExchange::new();
        assert!(matches!(kx.generate_key_pair(), Err(CryptoError::NotInitialised)));
        kx.ready().unwrap();
        kx.ready().unwrap();
        assert!(kx.generate_key_pair().is_ok());
    }

    #[test]
    fn both_sides_agree() {
        let kx = ready();
        let alice = kx.generate_key_pair().unwrap();
        let bob = kx.generate_key_pair().unwrap();

        let ab = derive_shared_secret(alice.private_key(), bob.public_key()).unwrap();
        let ba = derive_shared_secret(bob.private_key(), alice.public_key()).unwrap();
        assert_eq!(ab, ba, "Alice and Bob must derive the same secret");
    }

    #[test]
    fn distinct_pairs_distinct_secrets() {
        let kx = ready();
        let a = kx.generate_key_pair().unwrap();
        let b = kx.generate_key_pair().unwrap();
        let c = kx.generate_key_pair().unwrap();
        let ab = derive_shared_secret(a.private_key(), b.public_key()).unwrap();
        let ac = derive_shared_secret(a.private_key(), c.public_key()).unwrap();
        assert_ne!(ab, ac);
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn rejects_wrong_lengths() {
        let kx = ready();
        let a = kx.generate_key_pair().unwrap();
        assert!(matches!(
            derive_shared_secret(&a.private_key()[..31], a.public_key()),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(
            derive_shared_secret(a.private_key(), &[7u8; 33]),
            Err(CryptoError::InvalidKey(_))
        ));
    }

    #[test]
    fn rejects_low_order_point() {
        let kx = ready();
        let a = kx.generate_key_pair().unwrap();
        assert!(derive_shared_secret(a.private_key(), &[0u8; 32]).is_err());
    }

    #[test]
    fn rebuild_from_private() {
        let kx = ready();
        let a = kx.generate_key_pair().unwrap();
        let rebuilt = KeyPair::from_private_bytes(a.private_key()).unwrap();
        assert_eq!(rebuilt.public_key(), a.public_key());
        assert!(KeyPair::from_parts(a.public_key(), a.private_key()).is_ok());
        assert!(KeyPair::from_parts(&[1u8; 32], a.private_key()).is_err());
    }

    #[test]
    fn debug_redacts_private() {
        let kx = ready();
        let a = kx.generate_key_pair().unwrap();
        let dbg = format!("{a:?}");
        assert!(dbg.contains("<redacted>"));
        assert!(!dbg.contains(&hex::encode(a.private_key())));
    }
}
