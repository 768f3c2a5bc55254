use serde::Serialize;
use std::fmt;

/// One object that a multi-object operation could not process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyFailure {
    pub key: String,
    pub reason: String,
}

impl KeyFailure {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Summary carried by [`BrowserError::PartialBatchFailure`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub operation: &'static str,
    pub succeeded: usize,
    pub failed: Vec<KeyFailure>,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} finished with {} succeeded and {} failed",
            self.operation,
            self.succeeded,
            self.failed.len()
        )?;
        for failure in &self.failed {
            write!(f, "\n  {}: {}", failure.key, failure.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("Not connected to S3")]
    NotConnected,

    #[error("S3 request failed: {0}")]
    StoreRequestFailed(String),

    #[error("{0}")]
    PartialBatchFailure(BatchFailure),

    #[error("Canceled by user")]
    UserCanceled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed writing archive: {0}")]
    ArchiveWrite(String),

    #[error("Failed finalizing archive: {0}")]
    ArchiveFinalize(String),

    #[error("Credential storage failed: {0}")]
    Credentials(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    pub fn store(message: impl fmt::Display) -> Self {
        Self::StoreRequestFailed(message.to_string())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Whether the caller is expected to re-authenticate before retrying.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::UserCanceled)
    }
}

pub type Result<T, E = BrowserError> = std::result::Result<T, E>;
