//! Identity key pairs: the private half is sealed under a key derived from a
//! per-record password, with a fresh salt and nonce on every write. The KDF
//! parameters are stored with the row, so retuning the configured cost
//! never locks out an existing record.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use ck_crypto::{aead, generate_salt, validate_password, KeyPair};
use ck_proto::{PrivateKeyBlob, StoredKeyPair};
use tracing::{debug, info};

use crate::{
    db::Store,
    error::StoreError,
    lookup::Lookup,
    models::{kdf_params_to_db, KeyPairRow},
    session::derive_blocking,
};

const KEY_PAIR_AAD: &[u8] = b"ck-keypair-v1";

fn key_pair_aad(id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(KEY_PAIR_AAD.len() + 1 + id.len());
    aad.extend_from_slice(KEY_PAIR_AAD);
    aad.push(0);
    aad.extend_from_slice(id.as_bytes());
    aad
}

impl Store {
    /// Seal `key_pair` under `password` and persist it as `id`.
    /// An existing record with the same id is replaced wholesale.
    pub async fn store_key_pair(
        &self,
        id: &str,
        key_pair: &KeyPair,
        password: &str,
    ) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::InvalidInput("key pair id must not be empty".into()));
        }
        validate_password(password, self.config().min_password_len())?;

        let salt = generate_salt();
        let params = self.kdf().params();
        let wrapping_key = derive_blocking(self.kdf(), password, salt).await?;
        let sealed = aead::encrypt_with_aad(&wrapping_key, key_pair.private_key(), &key_pair_aad(id))?;

        let mut ciphertext = sealed.ciphertext.clone();
        ciphertext.extend_from_slice(&sealed.tag);
        let blob = PrivateKeyBlob { salt, nonce: sealed.iv, ciphertext };

        sqlx::query(
            "INSERT INTO key_pairs (id, public_key, encrypted_private_key, kdf, kdf_params, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 public_key = excluded.public_key,
                 encrypted_private_key = excluded.encrypted_private_key,
                 kdf = excluded.kdf,
                 kdf_params = excluded.kdf_params,
                 created_at = excluded.created_at",
        )
        .bind(id)
        .bind(key_pair.public_b64())
        .bind(blob.to_b64())
        .bind(params.algorithm().as_str())
        .bind(kdf_params_to_db(&params)?)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        info!(id, "key pair stored");
        Ok(())
    }

    /// Unseal the key pair stored as `id`.
    ///
    /// `NotFound` when absent; `Failed(Decryption)` on a wrong password or a
    /// damaged blob; `Failed(Format)` when the record cannot be parsed.
    pub async fn get_key_pair(&self, id: &str, password: &str) -> Lookup<KeyPair> {
        self.load_key_pair(id, password).await.into()
    }

    async fn load_key_pair(&self, id: &str, password: &str) -> Result<Option<KeyPair>, StoreError> {
        let Some(stored) = self.stored_key_pair(id).await? else {
            return Ok(None);
        };
        if stored.kdf != self.kdf().algorithm() {
            return Err(StoreError::Format(format!(
                "key pair {id} was sealed with {}, store is configured for {}",
                stored.kdf,
                self.kdf().algorithm()
            )));
        }

        let blob = PrivateKeyBlob::from_b64(&stored.encrypted_private_key)?;
        let public = STANDARD
            .decode(&stored.public_key)
            .map_err(|e| StoreError::Format(format!("public key of {id}: {e}")))?;
        if blob.ciphertext.len() < aead::TAG_LEN {
            return Err(StoreError::Format(format!("private key blob of {id} is truncated")));
        }

        let kdf = self.kdf_for(stored.kdf_params.as_ref())?;
        let wrapping_key = derive_blocking(&kdf, password, blob.salt).await?;
        let (ct, tag) = blob.ciphertext.split_at(blob.ciphertext.len() - aead::TAG_LEN);
        let private = aead::decrypt_with_aad(&wrapping_key, &blob.nonce, ct, tag, &key_pair_aad(id))
            .map_err(|_| {
                debug!(id, "key pair unseal failed");
                StoreError::Decryption
            })?;

        let pair = KeyPair::from_parts(&public, &private)
            .map_err(|_| StoreError::Format(format!("public key of {id} does not match its private key")))?;
        Ok(Some(pair))
    }

    /// The persisted (still sealed) record, if any.
    pub async fn stored_key_pair(&self, id: &str) -> Result<Option<StoredKeyPair>, StoreError> {
        let row: Option<KeyPairRow> = sqlx::query_as(
            "SELECT id, public_key, encrypted_private_key, kdf, kdf_params, created_at FROM key_pairs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(StoredKeyPair::try_from).transpose()
    }

    /// Returns whether a record was removed.
    pub async fn delete_key_pair(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM key_pairs WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            info!(id, "key pair deleted");
        }
        Ok(removed)
    }

    pub async fn get_all_key_pair_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar("SELECT id FROM key_pairs ORDER BY created_at, id")
            .fetch_all(self.pool())
            .await?)
    }

    /// Base64 public key for `id`. No password needed.
    pub async fn export_public_key(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(sqlx::query_scalar("SELECT public_key FROM key_pairs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use ck_crypto::KeyExchange;

    async fn store() -> Store {
        Store::in_memory(StoreConfig::insecure_fast()).await.unwrap()
    }

    fn key_pair() -> KeyPair {
        let kx = KeyExchange::new();
        kx.ready().unwrap();
        kx.generate_key_pair().unwrap()
    }

    #[tokio::test]
    async fn round_trip_with_correct_password() {
        let store = store().await;
        let pair = key_pair();
        store.store_key_pair("device-1", &pair, "correct horse").await.unwrap();

        let loaded = store.get_key_pair("device-1", "correct horse").await.into_result().unwrap().unwrap();
        assert_eq!(loaded.private_key(), pair.private_key());
        assert_eq!(loaded.public_key(), pair.public_key());
    }

    #[tokio::test]
    async fn wrong_password_fails_loudly() {
        let store = store().await;
        store.store_key_pair("device-1", &key_pair(), "correct horse").await.unwrap();
        let lookup = store.get_key_pair("device-1", "battery staple").await;
        assert!(matches!(lookup, Lookup::Failed(StoreError::Decryption)));
    }

    #[tokio::test]
    async fn absent_is_not_found() {
        let store = store().await;
        assert!(store.get_key_pair("nobody", "whatever1").await.is_not_found());
        assert_eq!(store.export_public_key("nobody").await.unwrap(), None);
        assert!(!store.delete_key_pair("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn short_password_and_empty_id_rejected() {
        let store = store().await;
        let pair = key_pair();
        assert!(matches!(
            store.store_key_pair("a", &pair, "1234567").await,
            Err(StoreError::PasswordTooShort { .. })
        ));
        assert!(matches!(
            store.store_key_pair("", &pair, "12345678").await,
            Err(StoreError::InvalidInput(_))
        ));
        assert!(store.get_all_key_pair_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overwrite_replaces_record() {
        let store = store().await;
        let first = key_pair();
        let second = key_pair();
        store.store_key_pair("me", &first, "password-one").await.unwrap();
        store.store_key_pair("me", &second, "password-two").await.unwrap();

        assert_eq!(store.get_all_key_pair_ids().await.unwrap(), ["me"]);
        assert!(store.get_key_pair("me", "password-one").await.is_failed());
        let loaded = store.get_key_pair("me", "password-two").await.into_result().unwrap().unwrap();
        assert_eq!(loaded.public_key(), second.public_key());
    }

    #[tokio::test]
    async fn export_and_delete() {
        let store = store().await;
        let pair = key_pair();
        store.store_key_pair("me", &pair, "12345678").await.unwrap();
        assert_eq!(store.export_public_key("me").await.unwrap(), Some(pair.public_b64()));
        assert!(store.delete_key_pair("me").await.unwrap());
        assert!(store.get_key_pair("me", "12345678").await.is_not_found());
    }

    #[tokio::test]
    async fn blob_moved_to_another_id_fails() {
        let store = store().await;
        store.store_key_pair("a", &key_pair(), "12345678").await.unwrap();
        store.store_key_pair("b", &key_pair(), "12345678").await.unwrap();

        sqlx::query(
            "UPDATE key_pairs SET encrypted_private_key = (SELECT encrypted_private_key FROM key_pairs WHERE id = 'a'),
                                  public_key = (SELECT public_key FROM key_pairs WHERE id = 'a')
             WHERE id = 'b'",
        )
        .execute(store.pool())
        .await
        .unwrap();
        assert!(matches!(
            store.get_key_pair("b", "12345678").await,
            Lookup::Failed(StoreError::Decryption)
        ));
    }

    #[tokio::test]
    async fn corrupted_blob_is_format_error() {
        let store = store().await;
        store.store_key_pair("me", &key_pair(), "12345678").await.unwrap();
        sqlx::query("UPDATE key_pairs SET encrypted_private_key = 'AAAA' WHERE id = 'me'")
            .execute(store.pool())
            .await
            .unwrap();
        let err = store.get_key_pair("me", "12345678").await.into_result().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Format);
    }

    #[tokio::test]
    async fn opens_with_recorded_params_after_retune() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let pair = key_pair();

        let store = Store::open(&path, StoreConfig::insecure_fast()).await.unwrap();
        store.store_key_pair("me", &pair, "correct horse").await.unwrap();
        assert_eq!(
            store.stored_key_pair("me").await.unwrap().unwrap().kdf_params,
            Some(store.kdf().params())
        );
        store.close().await;

        let mut retuned = StoreConfig::insecure_fast();
        retuned.kdf.memory_kib = 2048;
        let store = Store::open(&path, retuned).await.unwrap();
        let loaded = store.get_key_pair("me", "correct horse").await.into_result().unwrap().unwrap();
        assert_eq!(loaded.private_key(), pair.private_key());
        assert!(matches!(
            store.get_key_pair("me", "battery staple").await,
            Lookup::Failed(StoreError::Decryption)
        ));

        // New seals use the current configuration.
        store.store_key_pair("me", &pair, "correct horse").await.unwrap();
        assert_eq!(
            store.stored_key_pair("me").await.unwrap().unwrap().kdf_params,
            Some(ck_crypto::KdfParams::Argon2id { memory_kib: 2048, iterations: 1, parallelism: 1 })
        );
    }

    #[tokio::test]
    async fn legacy_row_without_params_uses_config() {
        let store = store().await;
        let pair = key_pair();
        store.store_key_pair("me", &pair, "12345678").await.unwrap();
        sqlx::query("UPDATE key_pairs SET kdf_params = NULL")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(store.get_key_pair("me", "12345678").await.is_found());
    }

    #[tokio::test]
    async fn kdf_mismatch_is_format_error() {
        let store = store().await;
        store.store_key_pair("me", &key_pair(), "12345678").await.unwrap();
        sqlx::query("UPDATE key_pairs SET kdf = 'pbkdf2-sha256'")
            .execute(store.pool())
            .await
            .unwrap();
        assert!(matches!(
            store.get_key_pair("me", "12345678").await,
            Lookup::Failed(StoreError::Format(_))
        ));
    }
}
