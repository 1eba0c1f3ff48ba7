//! Database handle over SQLite via sqlx.

use std::{path::Path, str::FromStr, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine};
use ck_crypto::{
    aead, generate_salt,
    password::{validate_password, SALT_LEN},
    KdfParams, PasswordKdf,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::{
    config::StoreConfig,
    error::StoreError,
    models::{kdf_params_to_db, parse_kdf_params},
    session::{derive_blocking, MasterKey, Session},
};

const META_MASTER_SALT: &str = "master_key_salt";
const META_MASTER_KDF: &str = "master_key_kdf";
const META_MASTER_KDF_PARAMS: &str = "master_key_kdf_params";
const META_MASTER_CHECK: &str = "master_key_check";
const MASTER_CHECK_PLAINTEXT: &[u8] = b"cipherkeep master key check";
const MASTER_CHECK_AAD: &[u8] = b"ck-master-check-v1";

/// Raw `store_meta` entries describing the master key.
struct MasterMeta {
    salt: Option<String>,
    kdf: Option<String>,
    params: Option<String>,
    check: Option<String>,
}

/// Central store handle. Cheap to clone (the pool is shared).
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    kdf: Arc<dyn PasswordKdf>,
    config: StoreConfig,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path` and run pending migrations.
    ///
    /// WAL mode is set on the connection options, not in a migration: SQLite
    /// refuses to change `journal_mode` inside the transaction sqlx wraps
    /// each migration in.
    pub async fn open(db_path: &Path, config: StoreConfig) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;
        let store = Self::with_pool(pool, config).await?;
        info!(path = %db_path.display(), "key store opened");
        Ok(store)
    }

    /// Fresh in-memory database. Everything is lost when the store is dropped.
    pub async fn in_memory(config: StoreConfig) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // One connection that is never recycled: the database vanishes
        // when its last connection closes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(opts)
            .await?;
        Self::with_pool(pool, config).await
    }

    async fn with_pool(pool: SqlitePool, config: StoreConfig) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        let kdf = config.kdf.build()?;
        Ok(Self { pool, kdf, config })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn kdf(&self) -> &Arc<dyn PasswordKdf> {
        &self.kdf
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Empty session using this store's KDF, password floor and auto-lock.
    pub async fn new_session(&self) -> Session {
        let session = Session::new(Arc::clone(&self.kdf), self.config.min_password_len());
        session.set_auto_lock_timeout(self.config.auto_lock_secs).await;
        session
    }

    /// Derive the master key from `password` with the persisted salt and
    /// KDF parameters, and install it.
    ///
    /// The first unlock creates the salt and a sealed check value; later
    /// unlocks with a different password fail with `Decryption` before any
    /// conversation key is touched.
    pub async fn unlock_session(&self, session: &Session, password: &str) -> Result<(), StoreError> {
        validate_password(password, self.config.min_password_len())?;

        let mut meta = self.master_meta().await?;
        if meta.check.is_none() {
            if let Some(key) = self.init_master_key(&meta, password).await? {
                session.install(key).await;
                return Ok(());
            }
            // Another handle initialised the store first; its salt wins.
            meta = self.master_meta().await?;
        }

        let key = self.open_master_check(&meta, password).await?;
        session.install(key).await;
        Ok(())
    }

    async fn master_meta(&self) -> Result<MasterMeta, StoreError> {
        Ok(MasterMeta {
            salt: self.get_meta(META_MASTER_SALT).await?,
            kdf: self.get_meta(META_MASTER_KDF).await?,
            params: self.get_meta(META_MASTER_KDF_PARAMS).await?,
            check: self.get_meta(META_MASTER_CHECK).await?,
        })
    }

    fn master_kdf(&self, meta: &MasterMeta) -> Result<Arc<dyn PasswordKdf>, StoreError> {
        if let Some(kdf) = &meta.kdf {
            if kdf != self.kdf.algorithm().as_str() {
                return Err(StoreError::Format(format!(
                    "master key was set up with {kdf}, store is configured for {}",
                    self.kdf.algorithm()
                )));
            }
        }
        let params = meta
            .params
            .as_deref()
            .map(|json| parse_kdf_params(json, "the master key"))
            .transpose()?;
        self.kdf_for(params.as_ref())
    }

    async fn open_master_check(&self, meta: &MasterMeta, password: &str) -> Result<MasterKey, StoreError> {
        let check = meta
            .check
            .as_deref()
            .ok_or_else(|| StoreError::Format("master key check missing".into()))?;
        let salt = meta
            .salt
            .as_deref()
            .ok_or_else(|| StoreError::Format("master key check present without a salt".into()))?;
        let salt = decode_salt(salt)?;
        let sealed = decode_master_check(check)?;

        let kdf = self.master_kdf(meta)?;
        let key = MasterKey::from(derive_blocking(&kdf, password, salt).await?);
        if aead::open(key.as_bytes(), &sealed, MASTER_CHECK_AAD).is_err() {
            debug!("unlock rejected: master key check failed");
            return Err(StoreError::Decryption);
        }
        Ok(key)
    }

    /// First unlock: persist salt, KDF and check value. Returns `None` when
    /// a concurrent unlock committed its own values first.
    async fn init_master_key(&self, meta: &MasterMeta, password: &str) -> Result<Option<MasterKey>, StoreError> {
        let kdf = self.master_kdf(meta)?;
        let salt = match meta.salt.as_deref() {
            Some(b64) => decode_salt(b64)?,
            None => generate_salt(),
        };
        let key = MasterKey::from(derive_blocking(&kdf, password, salt).await?);
        let check = aead::encrypt_with_aad(key.as_bytes(), MASTER_CHECK_PLAINTEXT, MASTER_CHECK_AAD)?;
        let check = STANDARD.encode(check.to_bytes());

        let mut tx = self.pool.begin().await?;
        for (k, v) in [
            (META_MASTER_SALT, STANDARD.encode(salt)),
            (META_MASTER_KDF, kdf.algorithm().as_str().to_owned()),
            (META_MASTER_KDF_PARAMS, kdf_params_to_db(&kdf.params())?),
            (META_MASTER_CHECK, check.clone()),
        ] {
            sqlx::query("INSERT OR IGNORE INTO store_meta (key, value) VALUES (?, ?)")
                .bind(k)
                .bind(v)
                .execute(&mut *tx)
                .await?;
        }
        let stored: Option<String> = sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
            .bind(META_MASTER_CHECK)
            .fetch_optional(&mut *tx)
            .await?;
        if stored.as_deref() != Some(check.as_str()) {
            tx.rollback().await?;
            debug!("master key was initialised concurrently");
            return Ok(None);
        }
        tx.commit().await?;
        info!(kdf = %kdf.algorithm(), "master key initialised");
        Ok(Some(key))
    }

    /// Strategy for opening something sealed with `params`. `None` marks
    /// data written before parameters were recorded: the configured
    /// strategy applies.
    pub(crate) fn kdf_for(&self, params: Option<&KdfParams>) -> Result<Arc<dyn PasswordKdf>, StoreError> {
        let Some(params) = params else {
            return Ok(Arc::clone(&self.kdf));
        };
        if params.algorithm() != self.kdf.algorithm() {
            return Err(StoreError::Format(format!(
                "sealed with {}, store is configured for {}",
                params.algorithm(),
                self.kdf.algorithm()
            )));
        }
        if *params == self.kdf.params() {
            return Ok(Arc::clone(&self.kdf));
        }
        params
            .build()
            .map_err(|e| StoreError::Format(format!("stored kdf parameters: {e}")))
    }

    // ── Whole-store operations ───────────────────────────────────────────────

    /// Remove every key pair, conversation key and rotation record.
    /// Store metadata (the master-key salt) survives.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM key_pairs").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM conversation_keys").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM rotation_history").execute(&mut *tx).await?;
        tx.commit().await?;
        info!("key store cleared");
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    async fn get_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(sqlx::query_scalar("SELECT value FROM store_meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }
}

fn decode_salt(b64: &str) -> Result<[u8; SALT_LEN], StoreError> {
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| StoreError::Format(format!("master key salt: {e}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::Format(format!("master key salt must be {SALT_LEN} bytes")))
}

fn decode_master_check(b64: &str) -> Result<aead::Sealed, StoreError> {
    let bytes = STANDARD
        .decode(b64)
        .map_err(|e| StoreError::Format(format!("master key check: {e}")))?;
    aead::Sealed::from_bytes(&bytes)
        .map_err(|_| StoreError::Format(format!("master key check is truncated ({} bytes)", bytes.len())))
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("kdf", &self.kdf).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::in_memory(StoreConfig::insecure_fast()).await.unwrap()
    }

    #[tokio::test]
    async fn migrations_create_tables() {
        let store = store().await;
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%' ORDER BY name",
        )
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(tables, ["conversation_keys", "key_pairs", "rotation_history", "store_meta"]);
    }

    #[tokio::test]
    async fn unlock_persists_salt_and_checks_password() {
        let store = store().await;
        let first = store.new_session().await;
        store.unlock_session(&first, "master password").await.unwrap();
        assert!(first.is_set().await);

        let second = store.new_session().await;
        store.unlock_session(&second, "master password").await.unwrap();
        let a = first.with_key(|k| Ok(*k)).await.unwrap();
        let b = second.with_key(|k| Ok(*k)).await.unwrap();
        assert_eq!(a, b, "same password + persisted salt gives the same master key");

        let wrong = store.new_session().await;
        assert!(matches!(
            store.unlock_session(&wrong, "not the password").await,
            Err(StoreError::Decryption)
        ));
        assert!(!wrong.is_set().await);
    }

    #[tokio::test]
    async fn unlock_rejects_short_password() {
        let store = store().await;
        let session = store.new_session().await;
        assert!(matches!(
            store.unlock_session(&session, "1234567").await,
            Err(StoreError::PasswordTooShort { min: 8 })
        ));
    }

    fn retuned(memory_kib: u32) -> StoreConfig {
        let mut config = StoreConfig::insecure_fast();
        config.kdf.memory_kib = memory_kib;
        config
    }

    #[tokio::test]
    async fn unlock_uses_recorded_params_after_retune() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");

        let store = Store::open(&path, retuned(1024)).await.unwrap();
        let session = store.new_session().await;
        store.unlock_session(&session, "master password").await.unwrap();
        let before = session.with_key(|k| Ok(*k)).await.unwrap();
        store.close().await;

        let store = Store::open(&path, retuned(2048)).await.unwrap();
        let session = store.new_session().await;
        store.unlock_session(&session, "master password").await.unwrap();
        assert_eq!(session.with_key(|k| Ok(*k)).await.unwrap(), before);
        assert!(matches!(
            store.unlock_session(&store.new_session().await, "not the password").await,
            Err(StoreError::Decryption)
        ));
    }

    #[tokio::test]
    async fn truncated_master_check_is_format_error() {
        let store = store().await;
        store.unlock_session(&store.new_session().await, "master password").await.unwrap();
        sqlx::query("UPDATE store_meta SET value = 'AAAA' WHERE key = ?")
            .bind(META_MASTER_CHECK)
            .execute(store.pool())
            .await
            .unwrap();

        let session = store.new_session().await;
        let err = store.unlock_session(&session, "master password").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Format);
        assert!(!session.is_set().await);
    }

    #[tokio::test]
    async fn out_of_range_master_params_are_format_error() {
        let store = store().await;
        store.unlock_session(&store.new_session().await, "master password").await.unwrap();
        sqlx::query("UPDATE store_meta SET value = ? WHERE key = ?")
            .bind(r#"{"algorithm":"argon2id","memoryKib":4294967295,"iterations":1,"parallelism":1}"#)
            .bind(META_MASTER_KDF_PARAMS)
            .execute(store.pool())
            .await
            .unwrap();
        let err = store.unlock_session(&store.new_session().await, "master password").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Format);
    }

    #[tokio::test]
    async fn concurrent_first_unlock_keeps_the_first_check() {
        let store = store().await;
        let empty = store.master_meta().await.unwrap();
        let winner = store.init_master_key(&empty, "first password").await.unwrap();
        assert!(winner.is_some());
        let check = store.get_meta(META_MASTER_CHECK).await.unwrap();
        let salt = store.get_meta(META_MASTER_SALT).await.unwrap();

        // A second handle that read the empty metadata before the first committed.
        let loser = store.init_master_key(&empty, "second password").await.unwrap();
        assert!(loser.is_none());
        assert_eq!(store.get_meta(META_MASTER_CHECK).await.unwrap(), check);
        assert_eq!(store.get_meta(META_MASTER_SALT).await.unwrap(), salt);

        let session = store.new_session().await;
        store.unlock_session(&session, "first password").await.unwrap();
        let a = session.with_key(|k| Ok(*k)).await.unwrap();
        assert_eq!(&a, winner.unwrap().as_bytes());
        assert!(store.unlock_session(&store.new_session().await, "second password").await.is_err());
    }

    #[tokio::test]
    async fn in_memory_stores_are_isolated() {
        let a = store().await;
        let b = store().await;
        sqlx::query("INSERT INTO store_meta (key, value) VALUES ('k', 'v')")
            .execute(a.pool())
            .await
            .unwrap();
        assert_eq!(a.get_meta("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(b.get_meta("k").await.unwrap(), None);
    }
}
