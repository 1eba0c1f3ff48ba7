//! Session: the in-memory master key.
//!
//! A [`Session`] holds the 32-byte master key that wraps every conversation
//! key at rest. It starts empty, is set once (directly or from a password),
//! and is cleared on logout. Clearing, dropping the last handle, or an
//! auto-lock timeout zeroizes the key.
//!
//! Sessions are plain values passed into each store call, so two sessions
//! over the same database never see each other's key.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use ck_crypto::{
    password::{validate_password, SALT_LEN},
    generate_salt, PasswordKdf, KEY_LEN,
};
use tokio::sync::RwLock;
use tracing::info;
use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::error::StoreError;

/// 256-bit key-wrapping key. Never applied to user content.
#[derive(Clone, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            StoreError::InvalidInput(format!(
                "master key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<Zeroizing<[u8; KEY_LEN]>> for MasterKey {
    fn from(bytes: Zeroizing<[u8; KEY_LEN]>) -> Self {
        Self(*bytes)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

struct SessionInner {
    key: MasterKey,
    last_activity: Instant,
}

/// Cloneable session handle. Clones share the same key slot.
#[derive(Clone)]
pub struct Session {
    inner: Arc<RwLock<Option<SessionInner>>>,
    auto_lock_secs: Arc<AtomicU64>,
    kdf: Arc<dyn PasswordKdf>,
    min_password_len: usize,
}

impl Session {
    /// Empty session deriving password keys with `kdf`.
    pub fn new(kdf: Arc<dyn PasswordKdf>, min_password_len: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            auto_lock_secs: Arc::new(AtomicU64::new(0)),
            kdf,
            min_password_len,
        }
    }

    /// Install a caller-supplied master key. Anything but 32 bytes is rejected.
    pub async fn set_master_key(&self, key: &[u8]) -> Result<(), StoreError> {
        let key = MasterKey::from_bytes(key)?;
        self.install(key).await;
        Ok(())
    }

    pub(crate) async fn install(&self, key: MasterKey) {
        let mut guard = self.inner.write().await;
        *guard = Some(SessionInner { key, last_activity: Instant::now() });
        info!("master key set");
    }

    /// Derive the master key from `password` and install it.
    ///
    /// With `salt = None` a fresh salt is generated. The salt used is
    /// returned so the caller can persist it for the next unlock.
    pub async fn derive_master_key_from_password(
        &self,
        password: &str,
        salt: Option<[u8; SALT_LEN]>,
    ) -> Result<[u8; SALT_LEN], StoreError> {
        validate_password(password, self.min_password_len)?;
        let salt = salt.unwrap_or_else(generate_salt);
        let key = derive_blocking(&self.kdf, password, salt).await?;
        self.install(MasterKey::from(key)).await;
        Ok(salt)
    }

    /// Forget the master key (zeroized on drop).
    pub async fn clear(&self) {
        let mut guard = self.inner.write().await;
        if guard.take().is_some() {
            info!("master key cleared");
        }
    }

    /// Whether a master key is present and the idle timer has not fired.
    pub async fn is_set(&self) -> bool {
        let expired = match self.inner.read().await.as_ref() {
            Some(inner) => self.expired(inner),
            None => return false,
        };
        if expired {
            self.lock_expired().await;
            return false;
        }
        true
    }

    /// Idle seconds before the key is dropped. 0 disables auto-lock.
    pub async fn set_auto_lock_timeout(&self, seconds: u64) {
        self.auto_lock_secs.store(seconds, Ordering::Relaxed);
    }

    /// Reset the idle timer.
    pub async fn touch(&self) {
        let mut guard = self.inner.write().await;
        if let Some(inner) = guard.as_mut() {
            inner.last_activity = Instant::now();
        }
    }

    /// Seconds until auto-lock. `None` when no key is set, `u64::MAX` when disabled.
    pub async fn time_until_lock(&self) -> Option<u64> {
        let secs = self.auto_lock_secs.load(Ordering::Relaxed);
        let guard = self.inner.read().await;
        guard.as_ref().map(|inner| {
            if secs == 0 {
                return u64::MAX;
            }
            secs.saturating_sub(inner.last_activity.elapsed().as_secs())
        })
    }

    /// Run `f` with the raw master key. Fails with `MasterKeyNotSet` when the
    /// session is empty or has auto-locked. Touches the idle timer.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; KEY_LEN]) -> Result<R, StoreError>,
    {
        if !self.is_set().await {
            return Err(StoreError::MasterKeyNotSet);
        }
        let mut guard = self.inner.write().await;
        match guard.as_mut() {
            Some(inner) => {
                inner.last_activity = Instant::now();
                f(inner.key.as_bytes())
            }
            None => Err(StoreError::MasterKeyNotSet),
        }
    }

    fn expired(&self, inner: &SessionInner) -> bool {
        let secs = self.auto_lock_secs.load(Ordering::Relaxed);
        secs > 0 && inner.last_activity.elapsed() > Duration::from_secs(secs)
    }

    async fn lock_expired(&self) {
        let mut guard = self.inner.write().await;
        let expired = match guard.as_ref() {
            Some(inner) => self.expired(inner),
            None => false,
        };
        if expired {
            *guard = None;
            info!("master key auto-locked after inactivity");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("kdf", &self.kdf).finish_non_exhaustive()
    }
}

/// Run a password KDF off the async executor.
pub(crate) async fn derive_blocking(
    kdf: &Arc<dyn PasswordKdf>,
    password: &str,
    salt: [u8; SALT_LEN],
) -> Result<Zeroizing<[u8; KEY_LEN]>, StoreError> {
    let kdf = Arc::clone(kdf);
    let password = Zeroizing::new(password.to_owned());
    let key = tokio::task::spawn_blocking(move || kdf.derive(&password, &salt)).await??;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_crypto::KdfConfig;

    fn session() -> Session {
        Session::new(KdfConfig::insecure_fast().build().unwrap(), 8)
    }

    #[tokio::test]
    async fn starts_empty() {
        let s = session();
        assert!(!s.is_set().await);
        assert!(matches!(s.with_key(|_| Ok(())).await, Err(StoreError::MasterKeyNotSet)));
        assert_eq!(s.time_until_lock().await, None);
    }

    #[tokio::test]
    async fn set_and_clear() {
        let s = session();
        s.set_master_key(&[9u8; 32]).await.unwrap();
        assert!(s.is_set().await);
        let first = s.with_key(|k| Ok(k[0])).await.unwrap();
        assert_eq!(first, 9);

        let shared = s.clone();
        shared.clear().await;
        assert!(!s.is_set().await);
    }

    #[tokio::test]
    async fn rejects_wrong_length_key() {
        let s = session();
        assert!(matches!(
            s.set_master_key(&[1u8; 16]).await,
            Err(StoreError::InvalidInput(_))
        ));
        assert!(!s.is_set().await);
    }

    #[tokio::test]
    async fn password_derivation_is_reproducible() {
        let a = session();
        let salt = a.derive_master_key_from_password("hunter2hunter2", None).await.unwrap();
        let b = session();
        let same = b.derive_master_key_from_password("hunter2hunter2", Some(salt)).await.unwrap();
        assert_eq!(salt, same);

        let ka = a.with_key(|k| Ok(*k)).await.unwrap();
        let kb = b.with_key(|k| Ok(*k)).await.unwrap();
        assert_eq!(ka, kb);
    }

    #[tokio::test]
    async fn short_password_rejected() {
        let s = session();
        assert!(matches!(
            s.derive_master_key_from_password("short", None).await,
            Err(StoreError::PasswordTooShort { min: 8 })
        ));
        assert!(!s.is_set().await);
    }

    #[tokio::test]
    async fn independent_sessions_do_not_interfere() {
        let a = session();
        let b = session();
        a.set_master_key(&[1u8; 32]).await.unwrap();
        assert!(!b.is_set().await);
    }

    #[tokio::test]
    async fn auto_lock_fires() {
        let s = session();
        s.set_master_key(&[3u8; 32]).await.unwrap();
        s.set_auto_lock_timeout(1).await;
        assert!(s.time_until_lock().await.unwrap() <= 1);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(!s.is_set().await);
        assert!(matches!(s.with_key(|_| Ok(())).await, Err(StoreError::MasterKeyNotSet)));
    }

    #[test]
    fn master_key_debug_is_redacted() {
        let key = MasterKey::from_bytes(&[0xAB; 32]).unwrap();
        assert_eq!(format!("{key:?}"), "MasterKey(<redacted>)");
    }
}
