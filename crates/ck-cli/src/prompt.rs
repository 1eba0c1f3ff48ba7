use anyhow::{anyhow, Result};
use zeroize::Zeroizing;

pub const PASSWORD_ENV: &str = "CIPHERKEEP_PASSWORD";
pub const MASTER_PASSWORD_ENV: &str = "CIPHERKEEP_MASTER_PASSWORD";

fn from_env(var: &str) -> Option<Zeroizing<String>> {
    match std::env::var(var) {
        Ok(pw) if !pw.is_empty() => Some(Zeroizing::new(pw)),
        _ => None,
    }
}

/// Key-pair or backup password: `$CIPHERKEEP_PASSWORD`, else a prompt.
pub fn password(prompt: &str) -> Result<Zeroizing<String>> {
    if let Some(pw) = from_env(PASSWORD_ENV) {
        return Ok(pw);
    }
    read(prompt)
}

/// As [`password`], asking twice when prompting interactively.
pub fn new_password(prompt: &str) -> Result<Zeroizing<String>> {
    if let Some(pw) = from_env(PASSWORD_ENV) {
        return Ok(pw);
    }
    let first = read(prompt)?;
    let second = read("Confirm password: ")?;
    if *first != *second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}

/// Master password: `$CIPHERKEEP_MASTER_PASSWORD`, else a prompt.
pub fn master_password() -> Result<Zeroizing<String>> {
    if let Some(pw) = from_env(MASTER_PASSWORD_ENV) {
        return Ok(pw);
    }
    read("Master password: ")
}

fn read(prompt: &str) -> Result<Zeroizing<String>> {
    rpassword::prompt_password(prompt)
        .map(Zeroizing::new)
        .map_err(|e| anyhow!("password prompt: {e}"))
}
