use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{KeyFailure, Result};

/// Snapshot of one stored object as returned by a listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub storage_class: Option<String>,
}

impl ObjectRecord {
    /// Zero-byte placeholder standing in for an otherwise empty folder.
    pub fn is_folder_marker(&self) -> bool {
        self.key.ends_with('/')
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        file_name_of(&self.key)
    }
}

/// Common prefix returned by a delimited listing. Always ends with `/`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    pub prefix: String,
}

impl FolderRecord {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: normalize_prefix(&prefix.into()),
        }
    }

    /// Folder name without parents or the trailing slash.
    pub fn name(&self) -> &str {
        file_name_of(self.prefix.trim_end_matches('/'))
    }
}

/// One page of a listing as returned by the store.
#[derive(Clone, Debug, Default)]
pub struct ListingPage {
    pub objects: Vec<ObjectRecord>,
    pub folders: Vec<FolderRecord>,
    pub continuation_token: Option<String>,
    pub is_truncated: bool,
}

/// Complete result of a delimited listing across every page.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderListing {
    pub files: Vec<ObjectRecord>,
    pub folders: Vec<FolderRecord>,
}

/// Streaming body of a fetched object.
pub struct ObjectBody {
    pub size: u64,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Per-key outcome of a batch delete request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchDeleteOutcome {
    pub deleted: Vec<String>,
    pub failed: Vec<KeyFailure>,
}

impl BatchDeleteOutcome {
    pub fn merge(&mut self, other: BatchDeleteOutcome) {
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        String::new()
    } else if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

pub fn file_name_of(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Prefix of the folder that contains `key` (or folder prefix), empty at root.
pub fn parent_prefix(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[..=idx],
        None => "",
    }
}
