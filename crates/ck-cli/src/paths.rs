use anyhow::{anyhow, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "cipherkeep";
pub const APP_NAME: &str = "cipherkeep";

pub const DATA_DIR_ENV: &str = "CIPHERKEEP_DATA_DIR";

/// `--data-dir`, else `$CIPHERKEEP_DATA_DIR`, else the platform data directory.
pub fn data_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("keys.db")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.json")
}
