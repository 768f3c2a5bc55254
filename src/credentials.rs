//! Persistence of the connection config between sessions.
//!
//! The OS keychain is preferred. When it cannot be reached the config is
//! written to an AES-256-GCM encrypted file in the application config dir.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::config::ConnectionConfig;
use crate::config_paths;
use crate::error::{BrowserError, Result};

const CREDENTIALS_FILE_VERSION: u8 = 1;
const PBKDF2_ITERATIONS: u32 = 600_000;
const KEY_BYTES: usize = 32;
const SALT_BYTES: usize = 32;
const IV_BYTES: usize = 12;

pub trait CredentialStore: Send + Sync {
    fn save(&self, config: &ConnectionConfig) -> Result<()>;

    fn load(&self) -> Result<Option<ConnectionConfig>>;

    fn clear(&self) -> Result<()>;
}

fn credentials_error(message: impl Into<String>) -> BrowserError {
    BrowserError::Credentials(message.into())
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn decode_base64(input: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(input)
        .map_err(|err| credentials_error(format!("Invalid base64 payload: {err}")))
}

fn derive_key(secret: &str, salt: &[u8], iterations: u32) -> [u8; KEY_BYTES] {
    let mut key = [0u8; KEY_BYTES];
    pbkdf2_hmac::<Sha512>(secret.as_bytes(), salt, iterations, &mut key);
    key
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsFile {
    version: u8,
    salt: String,
    iv: String,
    data: String,
}

/// Config sealed in a local file with a key derived from `secret`.
pub struct EncryptedFileCredentialStore {
    path: PathBuf,
    secret: String,
    iterations: u32,
}

impl EncryptedFileCredentialStore {
    pub fn new(path: impl Into<PathBuf>, secret: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            secret: secret.into(),
            iterations: PBKDF2_ITERATIONS,
        }
    }

    /// Store under the per-user config dir, keyed to that directory.
    pub fn for_current_user() -> Result<Self> {
        let dir = config_paths::s3vault_config_dir()?;
        Ok(Self::new(
            config_paths::credentials_path()?,
            dir.to_string_lossy().into_owned(),
        ))
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seal(&self, plaintext: &[u8]) -> Result<CredentialsFile> {
        let salt = random_bytes::<SALT_BYTES>();
        let iv = random_bytes::<IV_BYTES>();
        let key = derive_key(&self.secret, &salt, self.iterations);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|err| credentials_error(format!("Invalid encryption key: {err}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| credentials_error("Credential encryption failed"))?;

        Ok(CredentialsFile {
            version: CREDENTIALS_FILE_VERSION,
            salt: BASE64.encode(salt),
            iv: BASE64.encode(iv),
            data: BASE64.encode(ciphertext),
        })
    }

    fn open(&self, file: &CredentialsFile) -> Result<Vec<u8>> {
        if file.version != CREDENTIALS_FILE_VERSION {
            return Err(credentials_error(format!(
                "Unsupported credentials file version: {}",
                file.version
            )));
        }
        let salt = decode_base64(&file.salt)?;
        let iv = decode_base64(&file.iv)?;
        if iv.len() != IV_BYTES {
            return Err(credentials_error("Invalid credentials IV length"));
        }
        let ciphertext = decode_base64(&file.data)?;

        let key = derive_key(&self.secret, &salt, self.iterations);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|err| credentials_error(format!("Invalid encryption key: {err}")))?;
        cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| credentials_error("Stored credentials could not be decrypted"))
    }
}

impl CredentialStore for EncryptedFileCredentialStore {
    fn save(&self, config: &ConnectionConfig) -> Result<()> {
        let plaintext = serde_json::to_vec(config)
            .map_err(|err| credentials_error(format!("Failed to serialize credentials: {err}")))?;
        let sealed = self.seal(&plaintext)?;
        let serialized = serde_json::to_string_pretty(&sealed)
            .map_err(|err| credentials_error(format!("Failed to serialize credentials: {err}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serialized)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600)) {
                tracing::warn!(path = %self.path.display(), "could not restrict permissions: {err}");
            }
        }
        Ok(())
    }

    fn load(&self) -> Result<Option<ConnectionConfig>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        let sealed: CredentialsFile = serde_json::from_str(&raw)
            .map_err(|err| credentials_error(format!("Invalid credentials file: {err}")))?;
        let plaintext = self.open(&sealed)?;
        let config = serde_json::from_slice(&plaintext)
            .map_err(|err| credentials_error(format!("Invalid stored credentials: {err}")))?;
        Ok(Some(config))
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// OS keychain entry, falling back to an encrypted file when the keychain
/// service is unreachable.
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
pub struct KeyringCredentialStore {
    service: String,
    account: String,
    fallback: EncryptedFileCredentialStore,
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
impl KeyringCredentialStore {
    pub const DEFAULT_SERVICE: &'static str = "com.s3vault.credentials";
    pub const DEFAULT_ACCOUNT: &'static str = "connection";

    pub fn new(fallback: EncryptedFileCredentialStore) -> Self {
        Self {
            service: Self::DEFAULT_SERVICE.to_string(),
            account: Self::DEFAULT_ACCOUNT.to_string(),
            fallback,
        }
    }

    pub fn for_current_user() -> Result<Self> {
        Ok(Self::new(EncryptedFileCredentialStore::for_current_user()?))
    }

    fn entry(&self) -> std::result::Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(&self.service, &self.account)
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
impl CredentialStore for KeyringCredentialStore {
    fn save(&self, config: &ConnectionConfig) -> Result<()> {
        let json = serde_json::to_string(config)
            .map_err(|err| credentials_error(format!("Failed to serialize credentials: {err}")))?;

        match self.entry().and_then(|entry| entry.set_password(&json)) {
            Ok(()) => {
                if let Err(err) = self.fallback.clear() {
                    tracing::warn!("failed to remove fallback credentials file: {err}");
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!("OS keychain unavailable, using encrypted file: {err}");
                self.fallback.save(config)
            }
        }
    }

    fn load(&self) -> Result<Option<ConnectionConfig>> {
        let entry = match self.entry() {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!("OS keychain unavailable: {err}");
                return self.fallback.load();
            }
        };

        match entry.get_password() {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|err| credentials_error(format!("Invalid stored credentials: {err}"))),
            Err(keyring::Error::NoEntry) => self.fallback.load(),
            Err(err) => {
                tracing::debug!("OS keychain read failed: {err}");
                self.fallback.load()
            }
        }
    }

    fn clear(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Ok(entry) = self.entry() {
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(err) => errors.push(format!("OS keychain: {err}")),
            }
        }
        if let Err(err) = self.fallback.clear() {
            errors.push(err.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(credentials_error(errors.join(", ")))
        }
    }
}

/// Process-local store for headless use.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<ConnectionConfig>>,
}

impl MemoryCredentialStore {
    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<ConnectionConfig>>> {
        self.slot
            .lock()
            .map_err(|_| credentials_error("Credential lock poisoned"))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save(&self, config: &ConnectionConfig) -> Result<()> {
        *self.slot()? = Some(config.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<ConnectionConfig>> {
        Ok(self.slot()?.clone())
    }

    fn clear(&self) -> Result<()> {
        *self.slot()? = None;
        Ok(())
    }
}
