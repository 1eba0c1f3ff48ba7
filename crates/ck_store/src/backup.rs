//! Password-protected export and import of the whole key store.
//!
//! The backup carries rows exactly as persisted: private keys stay sealed
//! under their own passwords and conversation keys under the master key.
//! Restoring therefore never needs, and never touches, those secrets.
//!
//! The envelope records the KDF parameters of the backup key, so a device
//! tuned differently from the one that wrote it can still restore.

use chrono::Utc;
use ck_crypto::{aead, generate_salt, validate_password};
use ck_proto::{
    BackupPayload, EncryptedBackup, RotationRecord, StoredConversationKey, StoredKeyPair,
    BACKUP_FORMAT_VERSION,
};
use sqlx::SqliteConnection;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{
    db::Store,
    error::StoreError,
    models::{kdf_params_to_db, ConversationKeyRow, KeyPairRow, RotationRow},
    session::derive_blocking,
};

const BACKUP_AAD: &[u8] = b"ck-backup-v1";

/// Row counts written by a restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub key_pairs: usize,
    pub conversation_keys: usize,
    pub rotation_records: usize,
}

impl Store {
    /// Serialise every stored row and seal it under a key derived from `password`.
    pub async fn create_backup(&self, password: &str) -> Result<EncryptedBackup, StoreError> {
        validate_password(password, self.config().min_password_len())?;

        let payload = self.snapshot().await?;
        let json = Zeroizing::new(
            serde_json::to_vec(&payload).map_err(|e| StoreError::Format(e.to_string()))?,
        );

        let salt = generate_salt();
        let key = derive_blocking(self.kdf(), password, salt).await?;
        let sealed = aead::encrypt_with_aad(&key, &json, BACKUP_AAD)?;

        let mut ciphertext = sealed.ciphertext;
        ciphertext.extend_from_slice(&sealed.tag);

        info!(
            key_pairs = payload.key_pairs.len(),
            conversation_keys = payload.conversation_keys.len(),
            "backup created"
        );
        Ok(EncryptedBackup::new(
            &ciphertext,
            &sealed.iv,
            &salt,
            self.kdf().params(),
            payload.created_at,
        ))
    }

    /// Decrypt `backup` with `password` and write every row back verbatim.
    ///
    /// Wrong password, tampered fields and undecodable envelopes all fail
    /// with `BackupDecryption`. Nothing is written unless the whole backup
    /// authenticates, parses and commits.
    pub async fn restore_backup(
        &self,
        backup: &EncryptedBackup,
        password: &str,
    ) -> Result<RestoreSummary, StoreError> {
        if backup.version != BACKUP_FORMAT_VERSION {
            return Err(StoreError::UnsupportedBackupVersion(backup.version));
        }
        if backup.kdf != self.kdf().algorithm() {
            return Err(StoreError::Format(format!(
                "backup was sealed with {}, store is configured for {}",
                backup.kdf,
                self.kdf().algorithm()
            )));
        }
        let kdf = self.kdf_for(backup.kdf_params.as_ref())?;

        let salt = backup.salt_bytes().map_err(|_| StoreError::BackupDecryption)?;
        let iv = backup.iv_bytes().map_err(|_| StoreError::BackupDecryption)?;
        let data = backup.ciphertext_bytes().map_err(|_| StoreError::BackupDecryption)?;
        if data.len() < aead::TAG_LEN {
            return Err(StoreError::BackupDecryption);
        }
        let (ct, tag) = data.split_at(data.len() - aead::TAG_LEN);

        let key = derive_blocking(&kdf, password, salt).await?;
        let json = aead::decrypt_with_aad(&key, &iv, ct, tag, BACKUP_AAD).map_err(|_| {
            debug!("backup authentication failed");
            StoreError::BackupDecryption
        })?;

        let payload: BackupPayload = serde_json::from_slice(&json)
            .map_err(|e| StoreError::Format(format!("backup payload: {e}")))?;
        if payload.format_version != BACKUP_FORMAT_VERSION {
            return Err(StoreError::UnsupportedBackupVersion(payload.format_version));
        }
        validate_payload(&payload)?;

        let mut tx = self.pool().begin().await?;
        for kp in &payload.key_pairs {
            write_key_pair(&mut tx, kp).await?;
        }
        for ck in &payload.conversation_keys {
            write_conversation_key(&mut tx, ck).await?;
        }
        let mut rotation_records = 0;
        for record in &payload.rotation_history {
            rotation_records += write_rotation_record(&mut tx, record).await?;
        }
        tx.commit().await?;

        let summary = RestoreSummary {
            key_pairs: payload.key_pairs.len(),
            conversation_keys: payload.conversation_keys.len(),
            rotation_records,
        };
        info!(?summary, "backup restored");
        Ok(summary)
    }

    async fn snapshot(&self) -> Result<BackupPayload, StoreError> {
        let mut tx = self.pool().begin().await?;
        let key_pairs: Vec<KeyPairRow> = sqlx::query_as(
            "SELECT id, public_key, encrypted_private_key, kdf, kdf_params, created_at FROM key_pairs ORDER BY id",
        )
        .fetch_all(&mut *tx)
        .await?;
        let conversation_keys: Vec<ConversationKeyRow> = sqlx::query_as(
            "SELECT conversation_id, encrypted_key, iv, tag, version, created_at, rotated_at
             FROM conversation_keys ORDER BY conversation_id",
        )
        .fetch_all(&mut *tx)
        .await?;
        let rotation_history: Vec<RotationRow> = sqlx::query_as(
            "SELECT conversation_id, old_version, new_version, rotated_at, reason
             FROM rotation_history ORDER BY seq",
        )
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(BackupPayload {
            format_version: BACKUP_FORMAT_VERSION,
            created_at: Utc::now(),
            key_pairs: key_pairs.into_iter().map(StoredKeyPair::try_from).collect::<Result<_, _>>()?,
            conversation_keys: conversation_keys
                .into_iter()
                .map(StoredConversationKey::try_from)
                .collect::<Result<_, _>>()?,
            rotation_history: rotation_history
                .into_iter()
                .map(RotationRecord::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

fn validate_payload(payload: &BackupPayload) -> Result<(), StoreError> {
    for kp in &payload.key_pairs {
        if kp.id.is_empty() {
            return Err(StoreError::Format("backup contains a key pair with an empty id".into()));
        }
        if let Some(params) = &kp.kdf_params {
            if params.algorithm() != kp.kdf {
                return Err(StoreError::Format(format!(
                    "key pair {} names {} but carries {} parameters",
                    kp.id,
                    kp.kdf,
                    params.algorithm()
                )));
            }
            params
                .check_bounds()
                .map_err(|e| StoreError::Format(format!("key pair {}: {e}", kp.id)))?;
        }
    }
    for ck in &payload.conversation_keys {
        if ck.conversation_id.is_empty() || ck.version == 0 {
            return Err(StoreError::Format(format!(
                "backup contains an invalid conversation key row ({:?} v{})",
                ck.conversation_id, ck.version
            )));
        }
    }
    Ok(())
}

async fn write_key_pair(conn: &mut SqliteConnection, kp: &StoredKeyPair) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR REPLACE INTO key_pairs (id, public_key, encrypted_private_key, kdf, kdf_params, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&kp.id)
    .bind(&kp.public_key)
    .bind(&kp.encrypted_private_key)
    .bind(kp.kdf.as_str())
    .bind(kp.kdf_params.as_ref().map(kdf_params_to_db).transpose()?)
    .bind(kp.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_conversation_key(
    conn: &mut SqliteConnection,
    ck: &StoredConversationKey,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR REPLACE INTO conversation_keys
             (conversation_id, encrypted_key, iv, tag, version, created_at, rotated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&ck.conversation_id)
    .bind(&ck.encrypted_key)
    .bind(&ck.iv)
    .bind(&ck.tag)
    .bind(i64::from(ck.version))
    .bind(ck.created_at)
    .bind(ck.rotated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Returns 1 if the record was new, 0 if `(conversation_id, new_version)` already existed.
async fn write_rotation_record(
    conn: &mut SqliteConnection,
    record: &RotationRecord,
) -> Result<usize, StoreError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO rotation_history (conversation_id, old_version, new_version, rotated_at, reason)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&record.conversation_id)
    .bind(i64::from(record.old_version))
    .bind(i64::from(record.new_version))
    .bind(record.rotated_at)
    .bind(&record.reason)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::StoreConfig, ErrorKind};
    use base64::{engine::general_purpose::STANDARD, Engine};

    async fn store() -> Store {
        Store::in_memory(StoreConfig::insecure_fast()).await.unwrap()
    }

    #[tokio::test]
    async fn empty_backup_round_trips() {
        let store = store().await;
        let backup = store.create_backup("backup password").await.unwrap();
        assert_eq!(backup.version, BACKUP_FORMAT_VERSION);
        let summary = store.restore_backup(&backup, "backup password").await.unwrap();
        assert_eq!(summary, RestoreSummary::default());
    }

    #[tokio::test]
    async fn short_password_rejected() {
        let store = store().await;
        assert!(matches!(
            store.create_backup("short").await,
            Err(StoreError::PasswordTooShort { .. })
        ));
    }

    #[tokio::test]
    async fn backups_of_same_data_differ() {
        let store = store().await;
        let a = store.create_backup("backup password").await.unwrap();
        let b = store.create_backup("backup password").await.unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.encrypted_data, b.encrypted_data);
    }

    #[tokio::test]
    async fn unsupported_version_is_format_error() {
        let store = store().await;
        let mut backup = store.create_backup("backup password").await.unwrap();
        backup.version = 2;
        let err = store.restore_backup(&backup, "backup password").await.unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedBackupVersion(2)));
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[tokio::test]
    async fn tampering_is_one_generic_failure() {
        let store = store().await;
        let backup = store.create_backup("backup password").await.unwrap();

        let wrong = store.restore_backup(&backup, "wrong password").await.unwrap_err();
        assert!(matches!(wrong, StoreError::BackupDecryption));

        let mut flipped = backup.clone();
        let mut data = STANDARD.decode(&flipped.encrypted_data).unwrap();
        data[0] ^= 1;
        flipped.encrypted_data = STANDARD.encode(data);
        assert!(matches!(
            store.restore_backup(&flipped, "backup password").await,
            Err(StoreError::BackupDecryption)
        ));

        let mut bad_iv = backup.clone();
        bad_iv.iv = STANDARD.encode([0u8; 5]);
        assert!(matches!(
            store.restore_backup(&bad_iv, "backup password").await,
            Err(StoreError::BackupDecryption)
        ));

        let mut garbage = backup;
        garbage.salt = "***".into();
        assert!(matches!(
            store.restore_backup(&garbage, "backup password").await,
            Err(StoreError::BackupDecryption)
        ));
    }

    #[tokio::test]
    async fn restores_on_differently_tuned_store() {
        let source = store().await;
        let pair = {
            let kx = ck_crypto::KeyExchange::new();
            kx.ready().unwrap();
            kx.generate_key_pair().unwrap()
        };
        source.store_key_pair("me", &pair, "key password").await.unwrap();
        let backup = source.create_backup("backup password").await.unwrap();
        assert_eq!(backup.kdf_params, Some(source.kdf().params()));

        let mut config = StoreConfig::insecure_fast();
        config.kdf.memory_kib = 2048;
        let target = Store::in_memory(config).await.unwrap();
        let summary = target.restore_backup(&backup, "backup password").await.unwrap();
        assert_eq!(summary.key_pairs, 1);

        let restored = target.get_key_pair("me", "key password").await.into_result().unwrap().unwrap();
        assert_eq!(restored.private_key(), pair.private_key());
        assert!(matches!(
            target.restore_backup(&backup, "wrong password").await,
            Err(StoreError::BackupDecryption)
        ));
    }

    #[tokio::test]
    async fn oversized_envelope_params_are_format_error() {
        let store = store().await;
        let mut backup = store.create_backup("backup password").await.unwrap();
        backup.kdf_params = Some(ck_crypto::KdfParams::Argon2id {
            memory_kib: u32::MAX,
            iterations: 1,
            parallelism: 1,
        });
        let err = store.restore_backup(&backup, "backup password").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[tokio::test]
    async fn authenticated_but_unparseable_payload_is_format_error() {
        let store = store().await;
        let salt = generate_salt();
        let key = derive_blocking(store.kdf(), "backup password", salt).await.unwrap();
        let sealed = aead::encrypt_with_aad(&key, b"{not json", BACKUP_AAD).unwrap();
        let mut ct = sealed.ciphertext.clone();
        ct.extend_from_slice(&sealed.tag);
        let backup = EncryptedBackup::new(&ct, &sealed.iv, &salt, store.kdf().params(), Utc::now());

        let err = store.restore_backup(&backup, "backup password").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
