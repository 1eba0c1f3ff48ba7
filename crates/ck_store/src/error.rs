use ck_crypto::CryptoError;
use ck_proto::ProtoError;
use thiserror::Error;

/// Failure classes callers are expected to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or state: not initialised, master key unset, short password.
    Precondition,
    /// AEAD tag mismatch. Wrong key and tampering are deliberately not told apart.
    Authentication,
    /// Malformed stored or serialised data, unsupported versions.
    Format,
    /// The database or the runtime underneath it.
    Storage,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Master key not set; unlock the session first")]
    MasterKeyNotSet,

    #[error("Password must be at least {min} characters")]
    PasswordTooShort { min: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Crypto backend not initialised")]
    NotInitialised,

    #[error("Decryption failed")]
    Decryption,

    #[error("Failed to decrypt backup")]
    BackupDecryption,

    #[error("Unsupported backup version {0}")]
    UnsupportedBackupVersion(u32),

    #[error("Malformed stored data: {0}")]
    Format(String),

    #[error("No key for conversation {0}")]
    NoConversationKey(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::MasterKeyNotSet
            | StoreError::PasswordTooShort { .. }
            | StoreError::InvalidInput(_)
            | StoreError::NotInitialised
            | StoreError::NoConversationKey(_) => ErrorKind::Precondition,
            StoreError::Decryption | StoreError::BackupDecryption => ErrorKind::Authentication,
            StoreError::UnsupportedBackupVersion(_) | StoreError::Format(_) => ErrorKind::Format,
            StoreError::Database(_)
            | StoreError::Migration(_)
            | StoreError::KeyDerivation(_)
            | StoreError::Task(_) => ErrorKind::Storage,
        }
    }
}

impl From<CryptoError> for StoreError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::AeadDecrypt => StoreError::Decryption,
            CryptoError::PasswordTooShort { min } => StoreError::PasswordTooShort { min },
            CryptoError::NotInitialised => StoreError::NotInitialised,
            CryptoError::InvalidKey(msg) | CryptoError::InvalidInput(msg) => {
                StoreError::InvalidInput(msg)
            }
            CryptoError::KeyDerivation(msg) | CryptoError::KeyGeneration(msg) => {
                StoreError::KeyDerivation(msg)
            }
            CryptoError::AeadEncrypt => StoreError::KeyDerivation("AEAD encryption failed".into()),
            CryptoError::Base64Decode(e) => StoreError::Format(e.to_string()),
        }
    }
}

impl From<ProtoError> for StoreError {
    fn from(e: ProtoError) -> Self {
        StoreError::Format(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}
