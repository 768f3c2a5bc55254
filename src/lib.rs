//! Folder-aware browsing and bulk transfers over an S3 bucket.

pub mod config;
pub mod config_paths;
pub mod credentials;
pub mod error;
pub mod folder_ops;
pub mod model;
pub mod pager;
pub mod path_state;
pub mod s3;
pub mod session;
pub mod store;
pub mod transfers;

#[cfg(test)]
mod test_support;

pub use config::{BrowserSettings, ConnectionConfig};
pub use credentials::{CredentialStore, EncryptedFileCredentialStore, MemoryCredentialStore};
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
pub use credentials::KeyringCredentialStore;
pub use error::{BatchFailure, BrowserError, KeyFailure, Result};
pub use folder_ops::{ArchiveReport, DeleteReport, FolderOperationEngine, RenameReport, RenameState};
pub use model::{FolderListing, FolderRecord, ObjectRecord};
pub use pager::PrefixPager;
pub use path_state::{Breadcrumb, PathState};
pub use s3::S3ObjectStore;
pub use session::{BrowserSession, DestinationPicker, DownloadFilesReport, Outcome};
pub use store::ObjectStoreClient;
pub use transfers::{TransferEvent, TransferKind, TransferRecord, TransferStatus, TransferTracker};

/// Installs the global `tracing` subscriber, filtered by `RUST_LOG` and
/// defaulting to `info`. Later calls are ignored.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
