//! Conversation keys wrapped under the session master key.
//!
//! One live row per conversation. The wrapped key is bound to
//! `(conversation_id, version)` through the AEAD associated data, so a
//! blob copied onto another row or version fails authentication.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use ck_crypto::{aead, ConversationKey, Sealed};
use ck_proto::{ConversationKeyInfo, StoredConversationKey};
use sqlx::SqliteConnection;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{
    db::Store,
    error::StoreError,
    lookup::Lookup,
    models::{version_from_db, ConversationKeyRow},
    session::Session,
};

const CONVERSATION_KEY_AAD: &[u8] = b"ck-conv-key-v1";
const MESSAGE_AAD: &[u8] = b"ck-message-v1";

pub(crate) fn conversation_key_aad(conversation_id: &str, version: u32) -> Vec<u8> {
    let id = conversation_id.as_bytes();
    let mut aad = Vec::with_capacity(CONVERSATION_KEY_AAD.len() + 9 + id.len());
    aad.extend_from_slice(CONVERSATION_KEY_AAD);
    aad.push(0);
    aad.extend_from_slice(&(id.len() as u32).to_be_bytes());
    aad.extend_from_slice(id);
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

fn message_aad(conversation_id: &str) -> Vec<u8> {
    let mut aad = MESSAGE_AAD.to_vec();
    aad.push(0);
    aad.extend_from_slice(conversation_id.as_bytes());
    aad
}

/// Wrap `key` under the session master key for `(conversation_id, version)`.
pub(crate) async fn wrap_for_row(
    session: &Session,
    conversation_id: &str,
    key: &ConversationKey,
    version: u32,
) -> Result<Sealed, StoreError> {
    let aad = conversation_key_aad(conversation_id, version);
    session
        .with_key(|master| Ok(aead::wrap_key(master, key.as_bytes(), &aad)?))
        .await
}

pub(crate) async fn current_version(
    conn: &mut SqliteConnection,
    conversation_id: &str,
) -> Result<Option<u32>, StoreError> {
    let version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM conversation_keys WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_optional(&mut *conn)
            .await?;
    version.map(version_from_db).transpose()
}

/// Insert or replace the live row. A `None` rotated_at keeps whatever the row had.
pub(crate) async fn upsert_conversation_key(
    conn: &mut SqliteConnection,
    conversation_id: &str,
    sealed: &Sealed,
    version: u32,
    created_at: DateTime<Utc>,
    rotated_at: Option<DateTime<Utc>>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO conversation_keys (conversation_id, encrypted_key, iv, tag, version, created_at, rotated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(conversation_id) DO UPDATE SET
             encrypted_key = excluded.encrypted_key,
             iv = excluded.iv,
             tag = excluded.tag,
             version = excluded.version,
             created_at = excluded.created_at,
             rotated_at = COALESCE(excluded.rotated_at, conversation_keys.rotated_at)",
    )
    .bind(conversation_id)
    .bind(STANDARD.encode(&sealed.ciphertext))
    .bind(STANDARD.encode(sealed.iv))
    .bind(STANDARD.encode(sealed.tag))
    .bind(i64::from(version))
    .bind(created_at)
    .bind(rotated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn decode_field<const N: usize>(b64: &str, field: &str, id: &str) -> Result<[u8; N], StoreError> {
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| StoreError::Format(format!("{field} of conversation {id}: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        StoreError::Format(format!("{field} of conversation {id} must be {N} bytes, got {}", bytes.len()))
    })
}

fn sealed_from_stored(stored: &StoredConversationKey) -> Result<Sealed, StoreError> {
    let id = &stored.conversation_id;
    let ciphertext = STANDARD
        .decode(&stored.encrypted_key)
        .map_err(|e| StoreError::Format(format!("encrypted key of conversation {id}: {e}")))?;
    Ok(Sealed {
        iv: decode_field(&stored.iv, "iv", id)?,
        ciphertext,
        tag: decode_field(&stored.tag, "tag", id)?,
    })
}

impl Store {
    /// Deterministic HKDF derivation; see [`ck_crypto::derive_conversation_key`].
    pub fn derive_conversation_key(
        &self,
        shared_secret: &[u8],
        conversation_id: &str,
        version: u32,
    ) -> Result<ConversationKey, StoreError> {
        Ok(ck_crypto::derive_conversation_key(shared_secret, conversation_id, version)?)
    }

    /// Wrap `key` under the session master key and persist it at `version`.
    ///
    /// Re-storing the current version replaces the row; moving a
    /// conversation to an older version is rejected.
    pub async fn store_conversation_key(
        &self,
        session: &Session,
        conversation_id: &str,
        key: &ConversationKey,
        version: u32,
    ) -> Result<(), StoreError> {
        if !session.is_set().await {
            return Err(StoreError::MasterKeyNotSet);
        }
        if conversation_id.is_empty() {
            return Err(StoreError::InvalidInput("conversation id must not be empty".into()));
        }
        if version == 0 {
            return Err(StoreError::InvalidInput("key versions start at 1".into()));
        }

        let sealed = wrap_for_row(session, conversation_id, key, version).await?;

        let mut tx = self.pool().begin().await?;
        if let Some(current) = current_version(&mut tx, conversation_id).await? {
            if version < current {
                return Err(StoreError::InvalidInput(format!(
                    "conversation {conversation_id} is at version {current}, refusing to store version {version}"
                )));
            }
        }
        upsert_conversation_key(&mut tx, conversation_id, &sealed, version, Utc::now(), None).await?;
        tx.commit().await?;

        info!(conversation_id, version, "conversation key stored");
        Ok(())
    }

    /// Unwrap the live key for `conversation_id` with the session master key.
    pub async fn get_conversation_key(
        &self,
        session: &Session,
        conversation_id: &str,
    ) -> Lookup<ConversationKey> {
        self.load_conversation_key(session, conversation_id).await.into()
    }

    async fn load_conversation_key(
        &self,
        session: &Session,
        conversation_id: &str,
    ) -> Result<Option<ConversationKey>, StoreError> {
        if !session.is_set().await {
            return Err(StoreError::MasterKeyNotSet);
        }
        let Some(stored) = self.stored_conversation_key(conversation_id).await? else {
            return Ok(None);
        };
        let sealed = sealed_from_stored(&stored)?;
        let aad = conversation_key_aad(conversation_id, stored.version);

        let key = session
            .with_key(|master| {
                aead::unwrap_key(master, &sealed, &aad).map_err(|_| {
                    debug!(conversation_id, "conversation key unwrap failed");
                    StoreError::Decryption
                })
            })
            .await?;
        Ok(Some(ConversationKey::from(*key)))
    }

    /// The persisted (still wrapped) row, if any.
    pub async fn stored_conversation_key(
        &self,
        conversation_id: &str,
    ) -> Result<Option<StoredConversationKey>, StoreError> {
        let row: Option<ConversationKeyRow> = sqlx::query_as(
            "SELECT conversation_id, encrypted_key, iv, tag, version, created_at, rotated_at
             FROM conversation_keys WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(StoredConversationKey::try_from).transpose()
    }

    /// Version and timestamps, readable without the master key.
    pub async fn get_conversation_key_info(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationKeyInfo>, StoreError> {
        Ok(self.stored_conversation_key(conversation_id).await?.map(|s| s.info()))
    }

    /// Remove the live key. Rotation history is kept.
    pub async fn delete_conversation_key(&self, conversation_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conversation_keys WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(self.pool())
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            info!(conversation_id, "conversation key deleted");
        }
        Ok(removed)
    }

    pub async fn get_all_conversation_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT conversation_id FROM conversation_keys ORDER BY created_at, conversation_id",
        )
        .fetch_all(self.pool())
        .await?)
    }

    // ── Message layer ────────────────────────────────────────────────────────

    /// Encrypt user content under the live conversation key.
    pub async fn seal_for_conversation(
        &self,
        session: &Session,
        conversation_id: &str,
        plaintext: &[u8],
    ) -> Result<Sealed, StoreError> {
        let key = self.require_conversation_key(session, conversation_id).await?;
        Ok(aead::encrypt_with_aad(key.as_bytes(), plaintext, &message_aad(conversation_id))?)
    }

    /// Decrypt content sealed by [`Store::seal_for_conversation`].
    pub async fn open_for_conversation(
        &self,
        session: &Session,
        conversation_id: &str,
        sealed: &Sealed,
    ) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let key = self.require_conversation_key(session, conversation_id).await?;
        Ok(aead::open(key.as_bytes(), sealed, &message_aad(conversation_id))?)
    }

    async fn require_conversation_key(
        &self,
        session: &Session,
        conversation_id: &str,
    ) -> Result<ConversationKey, StoreError> {
        self.get_conversation_key(session, conversation_id)
            .await
            .into_result()?
            .ok_or_else(|| StoreError::NoConversationKey(conversation_id.to_owned()))
    }
}
