//! ck_crypto: Cipherkeep cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Decryption failures are opaque: a wrong key and tampered data look the same.
//!
//! # Module layout
//! - `aead`: AES-256-GCM encrypt/decrypt and key wrapping
//! - `exchange`: X25519 key pairs and shared-secret agreement
//! - `kdf`: HKDF-SHA256 conversation-key derivation
//! - `password`: password KDF strategies (Argon2id, reduced-security PBKDF2)
//! - `error`: unified error type

pub mod aead;
pub mod error;
pub mod exchange;
pub mod kdf;
pub mod password;

pub use aead::Sealed;
pub use error::CryptoError;
pub use exchange::{KeyExchange, KeyPair, SharedSecret};
pub use kdf::{derive_conversation_key, ConversationKey};
pub use password::{
    generate_salt, validate_password, Argon2idKdf, KdfAlgorithm, KdfConfig, KdfParams, PasswordKdf,
    Pbkdf2Kdf,
};

/// Length of every symmetric key, private scalar and public point handled here.
pub const KEY_LEN: usize = 32;
