use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::config::{BrowserSettings, ConnectionConfig};
use crate::credentials::CredentialStore;
use crate::error::{BatchFailure, BrowserError, KeyFailure, Result};
use crate::folder_ops::{ArchiveReport, DeleteReport, FolderOperationEngine, RenameReport};
use crate::model::{file_name_of, normalize_prefix, parent_prefix, FolderListing};
use crate::path_state::{validate_name, Breadcrumb, PathState};
use crate::s3::S3ObjectStore;
use crate::store::{ListRequest, ObjectStoreClient};
use crate::transfers::{
    calculate_percentage, ProgressSender, TransferKind, TransferRecord, TransferReporter,
    TransferTracker,
};

const ARCHIVE_EXTENSION: &str = ".zip";

/// Returns [`BrowserError::UserCanceled`] when the user dismisses the dialog.
pub trait DestinationPicker: Send + Sync {
    fn save_file(&self, suggested_name: &str) -> Result<PathBuf>;

    fn choose_directory(&self) -> Result<PathBuf>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Done(T),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(value) => Some(value),
            Self::Canceled => None,
        }
    }
}

fn picked(choice: Result<PathBuf>) -> Result<Option<PathBuf>> {
    match choice {
        Ok(path) => Ok(Some(path)),
        Err(err) if err.is_canceled() => Ok(None),
        Err(err) => Err(err),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFilesReport {
    pub directory: PathBuf,
    pub downloaded: Vec<PathBuf>,
    pub failed: Vec<KeyFailure>,
}

impl DownloadFilesReport {
    pub fn into_result(self) -> Result<Self> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        Err(BrowserError::PartialBatchFailure(BatchFailure {
            operation: "download files",
            succeeded: self.downloaded.len(),
            failed: self.failed,
        }))
    }
}

pub type StoreConnector = Arc<
    dyn Fn(&ConnectionConfig, &BrowserSettings) -> Result<Arc<dyn ObjectStoreClient>>
        + Send
        + Sync,
>;

fn s3_connector() -> StoreConnector {
    Arc::new(
        |config: &ConnectionConfig,
         settings: &BrowserSettings|
         -> Result<Arc<dyn ObjectStoreClient>> {
            let store = S3ObjectStore::from_config(config, settings)?;
            Ok(Arc::new(store) as Arc<dyn ObjectStoreClient>)
        },
    )
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
fn default_credential_store() -> Result<Arc<dyn CredentialStore>> {
    Ok(Arc::new(
        crate::credentials::KeyringCredentialStore::for_current_user()?,
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn default_credential_store() -> Result<Arc<dyn CredentialStore>> {
    Ok(Arc::new(
        crate::credentials::EncryptedFileCredentialStore::for_current_user()?,
    ))
}

struct Connection {
    bucket: String,
    store: Arc<dyn ObjectStoreClient>,
    engine: FolderOperationEngine,
}

pub struct BrowserSession {
    connection: Option<Connection>,
    path: PathState,
    transfers: TransferTracker,
    progress: ProgressSender,
    settings: BrowserSettings,
    credentials: Arc<dyn CredentialStore>,
    connector: StoreConnector,
}

impl BrowserSession {
    pub fn new(settings: BrowserSettings, credentials: Arc<dyn CredentialStore>) -> Self {
        let (transfers, progress) = TransferTracker::progress_channel();
        Self {
            connection: None,
            path: PathState::new(),
            transfers,
            progress,
            settings: settings.clamped(),
            credentials,
            connector: s3_connector(),
        }
    }

    pub fn for_current_user() -> Result<Self> {
        Ok(Self::new(
            BrowserSettings::from_env(),
            default_credential_store()?,
        ))
    }

    pub fn with_connector(mut self, connector: StoreConnector) -> Self {
        self.connector = connector;
        self
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn bucket(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.bucket.as_str())
    }

    fn connection(&self) -> Result<&Connection> {
        self.connection.as_ref().ok_or(BrowserError::NotConnected)
    }

    /// Checks the bucket with a one-key listing before saving credentials.
    pub async fn connect(&mut self, config: ConnectionConfig) -> Result<()> {
        config.validate()?;
        let store = (self.connector)(&config, &self.settings)?;
        let bucket = config.bucket_name.trim().to_string();

        let check = ListRequest {
            prefix: "",
            delimiter: Some("/"),
            max_keys: 1,
            continuation_token: None,
        };
        if let Err(err) = store.list(&bucket, check).await {
            tracing::warn!(bucket = %bucket, "bucket check failed: {err}");
            return Err(err);
        }

        if let Err(err) = self.credentials.save(&config) {
            tracing::warn!("connected but credentials were not saved: {err}");
        }

        let engine = FolderOperationEngine::new(store.clone(), &self.settings);
        tracing::info!(bucket = %bucket, region = %config.effective_region(), "connected");
        self.connection = Some(Connection {
            bucket,
            store,
            engine,
        });
        self.path.reset();
        Ok(())
    }

    pub async fn auto_connect(&mut self) -> Result<bool> {
        match self.credentials.load()? {
            Some(config) => {
                self.connect(config).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            tracing::info!(bucket = %connection.bucket, "disconnected");
        }
        self.path.reset();
    }

    pub fn forget_credentials(&mut self) -> Result<()> {
        self.disconnect();
        self.credentials.clear()
    }

    pub fn current_path(&self) -> &str {
        self.path.current()
    }

    pub fn navigate(&mut self, prefix: &str) {
        self.path.navigate(prefix);
    }

    pub fn go_up(&mut self) {
        self.path.go_up();
    }

    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.path.breadcrumbs()
    }

    pub async fn list_current_folder(&self) -> Result<FolderListing> {
        let connection = self.connection()?;
        connection
            .engine
            .pager()
            .list_all(&connection.bucket, self.path.current())
            .await
    }

    pub async fn create_folder(&self, name: &str) -> Result<String> {
        let connection = self.connection()?;
        let prefix = normalize_prefix(&self.path.resolve(name)?);
        connection
            .store
            .put(&connection.bucket, &prefix, Bytes::new(), &|_, _| {})
            .await?;
        tracing::info!(bucket = %connection.bucket, prefix = %prefix, "folder created");
        Ok(prefix)
    }

    pub async fn delete_folder(&self, prefix: &str) -> Result<DeleteReport> {
        let connection = self.connection()?;
        connection
            .engine
            .delete_folder(&connection.bucket, prefix)
            .await?
            .into_result()
    }

    pub async fn rename_folder(&self, old_prefix: &str, new_name: &str) -> Result<RenameReport> {
        let connection = self.connection()?;
        let name = validate_name(new_name)?;
        let old_prefix = normalize_prefix(old_prefix.trim_start_matches('/'));
        if old_prefix.is_empty() {
            return Err(BrowserError::invalid("A folder prefix is required"));
        }
        let new_prefix = format!("{}{name}/", parent_prefix(&old_prefix));
        connection
            .engine
            .rename_folder(&connection.bucket, &old_prefix, &new_prefix)
            .await?
            .into_result()
    }

    pub async fn delete_file(&self, key: &str) -> Result<()> {
        let connection = self.connection()?;
        if key.is_empty() || key.ends_with('/') {
            return Err(BrowserError::invalid(format!("Not a file key: {key}")));
        }
        connection.store.delete(&connection.bucket, key).await?;
        tracing::info!(bucket = %connection.bucket, key, "file deleted");
        Ok(())
    }

    pub async fn rename_file(&self, old_key: &str, new_name: &str) -> Result<String> {
        let connection = self.connection()?;
        if old_key.is_empty() || old_key.ends_with('/') {
            return Err(BrowserError::invalid(format!("Not a file key: {old_key}")));
        }
        let new_key = format!("{}{}", parent_prefix(old_key), validate_name(new_name)?);
        if new_key == old_key {
            return Err(BrowserError::invalid("File already has that name"));
        }

        let entry = connection
            .engine
            .move_object(&connection.bucket, old_key.to_string(), new_key.clone())
            .await;
        RenameReport::from_entries(vec![entry]).into_result()?;
        Ok(new_key)
    }

    pub async fn upload_file(&self, name: &str, body: Bytes) -> Result<String> {
        let connection = self.connection()?;
        let key = self.path.resolve(name)?;
        let size = body.len() as u64;

        let reporter = self.begin_upload(&key, size);
        let sent = connection
            .store
            .put(&connection.bucket, &key, body, &|sent, total| {
                reporter.bytes(sent, total)
            })
            .await
            .map(|()| size);
        finish_upload(connection, &key, &reporter, sent)
    }

    /// Streams from disk; the file is never read whole into memory.
    pub async fn upload_path(&self, local_path: &Path) -> Result<String> {
        let connection = self.connection()?;
        let name = local_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                BrowserError::invalid(format!("No file name in {}", local_path.display()))
            })?;
        let key = self.path.resolve(name)?;
        let size = tokio::fs::metadata(local_path).await?.len();

        let reporter = self.begin_upload(&key, size);
        let sent = connection
            .store
            .put_file(&connection.bucket, &key, local_path, &|sent, total| {
                reporter.bytes(sent, total)
            })
            .await;
        finish_upload(connection, &key, &reporter, sent)
    }

    fn begin_upload(&self, key: &str, size: u64) -> TransferReporter {
        let id = self
            .transfers
            .begin(TransferKind::Upload, file_name_of(key), Some(size));
        self.progress.reporter(&id)
    }

    pub async fn download_file(
        &self,
        key: &str,
        picker: &dyn DestinationPicker,
    ) -> Result<Outcome<PathBuf>> {
        let connection = self.connection()?;
        if key.is_empty() || key.ends_with('/') {
            return Err(BrowserError::invalid(format!("Not a file key: {key}")));
        }
        let file_name = file_name_of(key);
        let Some(destination) = picked(picker.save_file(file_name))? else {
            return Ok(Outcome::Canceled);
        };

        let id = self.transfers.begin(TransferKind::Download, file_name, None);
        let reporter = self.progress.reporter(&id);
        let written = self
            .track_download(connection, key, &destination, &reporter)
            .await?;
        tracing::info!(key, bytes = written, path = %destination.display(), "download complete");
        Ok(Outcome::Done(destination))
    }

    pub async fn download_files(
        &self,
        keys: &[String],
        picker: &dyn DestinationPicker,
    ) -> Result<Outcome<DownloadFilesReport>> {
        let connection = self.connection()?;
        if keys.is_empty() {
            return Err(BrowserError::invalid("No files selected"));
        }
        let Some(directory) = picked(picker.choose_directory())? else {
            return Ok(Outcome::Canceled);
        };

        let mut report = DownloadFilesReport {
            directory: directory.clone(),
            ..DownloadFilesReport::default()
        };
        let mut used_names: HashSet<String> = HashSet::new();

        for key in keys {
            if key.is_empty() || key.ends_with('/') {
                report
                    .failed
                    .push(KeyFailure::new(key.clone(), "not a file key"));
                continue;
            }
            let file_name = unique_file_name(file_name_of(key), &mut used_names);
            let destination = directory.join(&file_name);

            let id = self.transfers.begin(TransferKind::Download, &file_name, None);
            let reporter = self.progress.reporter(&id);
            match self
                .track_download(connection, key, &destination, &reporter)
                .await
            {
                Ok(_) => report.downloaded.push(destination),
                Err(err) if err.requires_reconnect() => return Err(err),
                Err(err) => report.failed.push(KeyFailure::new(key.clone(), err.to_string())),
            }
        }

        tracing::info!(
            directory = %directory.display(),
            downloaded = report.downloaded.len(),
            failed = report.failed.len(),
            "multi-file download finished"
        );
        Ok(Outcome::Done(report))
    }

    pub async fn download_folder(
        &self,
        prefix: &str,
        archive_name: &str,
        picker: &dyn DestinationPicker,
    ) -> Result<Outcome<ArchiveReport>> {
        let connection = self.connection()?;
        let archive_name = validate_name(archive_name)?;
        let suggested = if archive_name.ends_with(ARCHIVE_EXTENSION) {
            archive_name.to_string()
        } else {
            format!("{archive_name}{ARCHIVE_EXTENSION}")
        };
        let Some(destination) = picked(picker.save_file(&suggested))? else {
            return Ok(Outcome::Canceled);
        };

        let id = self.transfers.begin(TransferKind::Download, &suggested, None);
        let reporter = self.progress.reporter(&id);
        let archived = connection
            .engine
            .download_folder(&connection.bucket, prefix, &destination, |done, total| {
                reporter.progress(calculate_percentage(done as u64, total as u64).min(99))
            })
            .await;

        let report = match archived {
            Ok(report) => report,
            Err(err) => {
                reporter.fail(&err);
                return Err(err);
            }
        };
        if report.is_complete() {
            let size = tokio::fs::metadata(&report.path)
                .await
                .map(|meta| meta.len())
                .unwrap_or(report.bytes_archived);
            reporter.complete_with_size(size);
        } else {
            reporter.fail(format!(
                "{} of {} files could not be archived",
                report.failed.len(),
                report.failed.len() + report.archived_count
            ));
        }
        report.into_result().map(Outcome::Done)
    }

    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.transfers.list()
    }

    pub fn transfer_tracker(&self) -> &TransferTracker {
        &self.transfers
    }

    async fn track_download(
        &self,
        connection: &Connection,
        key: &str,
        destination: &Path,
        reporter: &TransferReporter,
    ) -> Result<u64> {
        match stream_to_file(connection, key, destination, reporter).await {
            Ok(written) => {
                reporter.complete_with_size(written);
                Ok(written)
            }
            Err(err) => {
                tracing::warn!(key, "download failed: {err}");
                reporter.fail(&err);
                Err(err)
            }
        }
    }
}

fn finish_upload(
    connection: &Connection,
    key: &str,
    reporter: &TransferReporter,
    sent: Result<u64>,
) -> Result<String> {
    match sent {
        Ok(size) => {
            reporter.complete_with_size(size);
            tracing::info!(bucket = %connection.bucket, key, bytes = size, "upload complete");
            Ok(key.to_string())
        }
        Err(err) => {
            tracing::warn!(key, "upload failed: {err}");
            reporter.fail(&err);
            Err(err)
        }
    }
}

async fn stream_to_file(
    connection: &Connection,
    key: &str,
    destination: &Path,
    reporter: &TransferReporter,
) -> Result<u64> {
    let mut body = connection.store.get(&connection.bucket, key).await?;
    let total = body.size;
    reporter.bytes(0, total);

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(destination).await?;
    let mut writer = tokio::io::BufWriter::new(file);
    let mut transferred = 0u64;

    let written: Result<()> = async {
        while let Some(chunk) = body.stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            transferred += chunk.len() as u64;
            reporter.bytes(transferred, total);
        }
        writer.flush().await?;
        Ok(())
    }
    .await;

    if let Err(err) = written {
        if let Err(remove_err) = tokio::fs::remove_file(destination).await {
            tracing::debug!(
                path = %destination.display(),
                "could not remove partial download: {remove_err}"
            );
        }
        return Err(err);
    }
    Ok(transferred)
}

/// `name`, or `name-1`, `name-2`... when an earlier download took it.
fn unique_file_name(name: &str, used: &mut HashSet<String>) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, extension) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    let mut counter = 1usize;
    loop {
        let candidate = format!("{stem}-{counter}{extension}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}
