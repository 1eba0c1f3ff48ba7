use anyhow::{Context, Result};
use ck_store::StoreConfig;
use std::path::Path;
use tracing::{debug, warn};

/// Load the store config from `explicit` if given (must exist), else from
/// `fallback` if present, else defaults.
pub fn load(explicit: Option<&Path>, fallback: &Path) -> Result<StoreConfig> {
    let path = match explicit {
        Some(p) => p,
        None if fallback.exists() => fallback,
        None => {
            debug!("no config file, using defaults");
            return Ok(StoreConfig::default());
        }
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: StoreConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config {}", path.display()))?;
    if config.min_password_len < ck_crypto::password::MIN_PASSWORD_LEN {
        warn!(
            configured = config.min_password_len,
            "min_password_len below the fixed floor of 8 is ignored"
        );
    }
    Ok(config)
}
