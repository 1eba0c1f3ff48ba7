use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Crypto backend not initialised (call KeyExchange::ready() first)")]
    NotInitialised,

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    /// Deliberately carries no detail: wrong key and tampering are indistinguishable.
    #[error("AEAD decryption failed")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Password must be at least {min} characters")]
    PasswordTooShort { min: usize },

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
