//! Database row models and their conversion to the shared record types.

use chrono::{DateTime, Utc};
use ck_crypto::{KdfAlgorithm, KdfParams};
use ck_proto::{RotationRecord, StoredConversationKey, StoredKeyPair};

use crate::error::StoreError;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KeyPairRow {
    pub id: String,
    /// Base64 X25519 public key
    pub public_key: String,
    /// Base64 salt || nonce || ciphertext+tag
    pub encrypted_private_key: String,
    pub kdf: String,
    /// JSON [`KdfParams`]; NULL on legacy rows
    pub kdf_params: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConversationKeyRow {
    pub conversation_id: String,
    pub encrypted_key: String,
    pub iv: String,
    pub tag: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RotationRow {
    pub conversation_id: String,
    pub old_version: i64,
    pub new_version: i64,
    pub rotated_at: DateTime<Utc>,
    pub reason: String,
}

impl TryFrom<KeyPairRow> for StoredKeyPair {
    type Error = StoreError;

    fn try_from(row: KeyPairRow) -> Result<Self, Self::Error> {
        let kdf = KdfAlgorithm::parse(&row.kdf)
            .ok_or_else(|| StoreError::Format(format!("unknown kdf '{}' on key pair {}", row.kdf, row.id)))?;
        let kdf_params = row
            .kdf_params
            .as_deref()
            .map(|json| parse_kdf_params(json, &format!("key pair {}", row.id)))
            .transpose()?;
        Ok(StoredKeyPair {
            id: row.id,
            public_key: row.public_key,
            encrypted_private_key: row.encrypted_private_key,
            kdf,
            kdf_params,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<ConversationKeyRow> for StoredConversationKey {
    type Error = StoreError;

    fn try_from(row: ConversationKeyRow) -> Result<Self, Self::Error> {
        Ok(StoredConversationKey {
            version: version_from_db(row.version)?,
            conversation_id: row.conversation_id,
            encrypted_key: row.encrypted_key,
            iv: row.iv,
            tag: row.tag,
            created_at: row.created_at,
            rotated_at: row.rotated_at,
        })
    }
}

impl TryFrom<RotationRow> for RotationRecord {
    type Error = StoreError;

    fn try_from(row: RotationRow) -> Result<Self, Self::Error> {
        Ok(RotationRecord {
            old_version: u32::try_from(row.old_version)
                .map_err(|_| StoreError::Format(format!("bad old_version {}", row.old_version)))?,
            new_version: version_from_db(row.new_version)?,
            conversation_id: row.conversation_id,
            rotated_at: row.rotated_at,
            reason: row.reason,
        })
    }
}

pub(crate) fn parse_kdf_params(json: &str, owner: &str) -> Result<KdfParams, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Format(format!("kdf parameters of {owner}: {e}")))
}

pub(crate) fn kdf_params_to_db(params: &KdfParams) -> Result<String, StoreError> {
    serde_json::to_string(params).map_err(|e| StoreError::Format(e.to_string()))
}

pub(crate) fn version_from_db(v: i64) -> Result<u32, StoreError> {
    match u32::try_from(v) {
        Ok(v) if v >= 1 => Ok(v),
        _ => Err(StoreError::Format(format!("bad key version {v}"))),
    }
}
