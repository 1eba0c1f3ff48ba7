use ck_crypto::{password::MIN_PASSWORD_LEN, KdfConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kdf: KdfConfig,
    /// Raised above 8 if desired; values below 8 are ignored.
    #[serde(default = "default_min_password_len")]
    pub min_password_len: usize,
    /// Idle seconds before a session forgets its master key. 0 = never.
    #[serde(default)]
    pub auto_lock_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kdf: KdfConfig::default(),
            min_password_len: MIN_PASSWORD_LEN,
            auto_lock_secs: 0,
        }
    }
}

impl StoreConfig {
    /// Cheap KDF parameters for tests.
    pub fn insecure_fast() -> Self {
        Self { kdf: KdfConfig::insecure_fast(), ..Self::default() }
    }

    pub fn min_password_len(&self) -> usize {
        self.min_password_len.max(MIN_PASSWORD_LEN)
    }
}

fn default_min_password_len() -> usize {
    MIN_PASSWORD_LEN
}
