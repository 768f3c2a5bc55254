use std::path::PathBuf;

use crate::error::{BrowserError, Result};

pub fn s3vault_config_dir() -> Result<PathBuf> {
    let home = if cfg!(target_os = "windows") {
        std::env::var("USERPROFILE")
            .or_else(|_| std::env::var("HOME"))
            .map_err(|_| BrowserError::Credentials("Unable to resolve USERPROFILE/HOME".to_string()))?
    } else {
        std::env::var("HOME")
            .map_err(|_| BrowserError::Credentials("Unable to resolve HOME".to_string()))?
    };

    let mut path = PathBuf::from(home);
    if cfg!(target_os = "macos") {
        path.push("Library");
        path.push("Application Support");
        path.push("s3vault");
    } else {
        path.push(".config");
        path.push("s3vault");
    }
    Ok(path)
}

pub fn credentials_path() -> Result<PathBuf> {
    Ok(s3vault_config_dir()?.join("credentials.enc"))
}
