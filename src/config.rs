use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::{BrowserError, Result};
use crate::store::MAX_PAGE_SIZE;

const DEFAULT_REGION: &str = "us-east-1";
const MULTIPART_THRESHOLD_BYTES: usize = 5 * 1024 * 1024;
const MULTIPART_PART_SIZE_BYTES: usize = 8 * 1024 * 1024;

/// Credentials and addressing for one bucket.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub region: String,
    pub bucket_name: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .field("bucket_name", &self.bucket_name)
            .field("endpoint_url", &self.endpoint_url)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.access_key_id.trim().is_empty() || self.secret_access_key.trim().is_empty() {
            return Err(BrowserError::invalid("Access key id and secret key are required"));
        }
        if self.bucket_name.trim().is_empty() {
            return Err(BrowserError::invalid("Bucket name is required"));
        }
        if let Some(endpoint) = self.endpoint() {
            let url = Url::parse(endpoint)
                .map_err(|err| BrowserError::invalid(format!("Invalid endpoint {endpoint}: {err}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(BrowserError::invalid(format!(
                    "Endpoint must use http or https: {endpoint}"
                )));
            }
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Explicit region, else one read off an AWS endpoint host, else `us-east-1`.
    pub fn effective_region(&self) -> String {
        let explicit = self.region.trim();
        if !explicit.is_empty() {
            return explicit.to_string();
        }
        self.endpoint()
            .and_then(region_from_endpoint)
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    /// Custom S3-compatible providers need path-style addressing.
    pub fn force_path_style(&self) -> bool {
        self.endpoint().is_some()
    }
}

fn region_from_endpoint(endpoint: &str) -> Option<String> {
    let host = Url::parse(endpoint).ok()?.host_str()?.to_string();
    let rest = host.strip_suffix(".amazonaws.com")?;
    let region = rest
        .strip_prefix("s3.")
        .or_else(|| rest.strip_prefix("s3-"))?;
    let valid = !region.is_empty()
        && region
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    valid.then(|| region.to_string())
}

/// Tunables for listing, folder operations and transfers.
#[derive(Clone, Debug)]
pub struct BrowserSettings {
    pub page_size: i32,
    pub folder_concurrency: usize,
    pub archive_compression: u32,
    pub multipart_threshold: usize,
    pub multipart_part_size: usize,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            folder_concurrency: 1,
            archive_compression: 6,
            multipart_threshold: MULTIPART_THRESHOLD_BYTES,
            multipart_part_size: MULTIPART_PART_SIZE_BYTES,
        }
    }
}

impl BrowserSettings {
    /// Defaults overridden by `S3VAULT_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            page_size: env_parse("S3VAULT_PAGE_SIZE").unwrap_or(defaults.page_size),
            folder_concurrency: env_parse("S3VAULT_FOLDER_CONCURRENCY")
                .unwrap_or(defaults.folder_concurrency),
            archive_compression: env_parse("S3VAULT_ARCHIVE_LEVEL")
                .unwrap_or(defaults.archive_compression),
            ..defaults
        }
        .clamped()
    }

    pub fn clamped(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        self.folder_concurrency = self.folder_concurrency.clamp(1, 16);
        self.archive_compression = self.archive_compression.min(9);
        self.multipart_part_size = self.multipart_part_size.max(MULTIPART_THRESHOLD_BYTES);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring unparsable setting");
            None
        }
    }
}
