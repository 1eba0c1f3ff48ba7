//! ck_proto: Serialisable key records and the backup envelope for Cipherkeep
//!
//! These are the shapes that leave the process: rows inside a backup
//! payload, and the `EncryptedBackup` the transport layer uploads as opaque
//! JSON. All binary fields are standard base64.
//!
//! # Modules
//! - `keys`: stored key-pair / conversation-key records, rotation records
//! - `backup`: backup payload and encrypted envelope
//! - `error`: decode errors

pub mod backup;
pub mod error;
pub mod keys;

pub use backup::{BackupPayload, EncryptedBackup, BACKUP_FORMAT_VERSION};
pub use ck_crypto::{KdfAlgorithm, KdfParams};
pub use error::ProtoError;
pub use keys::{
    ConversationKeyInfo, PrivateKeyBlob, RotationRecord, StoredConversationKey, StoredKeyPair,
};
