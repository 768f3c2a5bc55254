use chrono::{DateTime, Datelike, Timelike, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Seek, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::config::BrowserSettings;
use crate::error::{BatchFailure, BrowserError, KeyFailure, Result};
use crate::model::{normalize_prefix, ObjectBody, ObjectRecord};
use crate::pager::PrefixPager;
use crate::store::ObjectStoreClient;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub deleted_count: usize,
    pub failed: Vec<KeyFailure>,
    pub passes: usize,
}

impl DeleteReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(BrowserError::PartialBatchFailure(BatchFailure {
                operation: "delete folder",
                succeeded: self.deleted_count,
                failed: self.failed,
            }))
        }
    }
}

/// How far a single object got through copy-then-delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenameState {
    /// Copy failed; only the source exists.
    Pending,
    /// Copied but the source could not be deleted; both keys exist.
    Copied,
    /// Copied and the source deleted.
    Moved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameEntry {
    pub source: String,
    pub destination: String,
    pub state: RenameState,
    pub error: Option<String>,
}

impl RenameEntry {
    fn failure(&self) -> Option<KeyFailure> {
        let error = self.error.as_deref()?;
        let reason = match self.state {
            RenameState::Copied => format!(
                "copied to {} but the original could not be deleted: {error}",
                self.destination
            ),
            _ => format!("copy to {} failed: {error}", self.destination),
        };
        Some(KeyFailure::new(self.source.clone(), reason))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameReport {
    pub renamed_count: usize,
    pub entries: Vec<RenameEntry>,
}

impl RenameReport {
    pub(crate) fn from_entries(entries: Vec<RenameEntry>) -> Self {
        let renamed_count = entries
            .iter()
            .filter(|entry| entry.state == RenameState::Moved)
            .count();
        Self {
            renamed_count,
            entries,
        }
    }

    /// Objects left present under both the old and the new key.
    pub fn copied_only(&self) -> impl Iterator<Item = &RenameEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.state == RenameState::Copied)
    }

    pub fn failures(&self) -> Vec<KeyFailure> {
        self.entries.iter().filter_map(RenameEntry::failure).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.renamed_count == self.entries.len()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            return Ok(self);
        }
        Err(BrowserError::PartialBatchFailure(BatchFailure {
            operation: "rename folder",
            succeeded: self.renamed_count,
            failed: self.failures(),
        }))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReport {
    pub path: PathBuf,
    pub archived_count: usize,
    pub bytes_archived: u64,
    pub failed: Vec<KeyFailure>,
}

impl ArchiveReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_result(self) -> Result<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(BrowserError::PartialBatchFailure(BatchFailure {
                operation: "download folder",
                succeeded: self.archived_count,
                failed: self.failed,
            }))
        }
    }
}

/// Destination key for `key` when the folder `old_prefix` becomes `new_prefix`.
/// Only a leading match is rewritten.
pub fn rewrite_key(key: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    key.strip_prefix(old_prefix)
        .map(|rest| format!("{new_prefix}{rest}"))
}

/// `None` for markers and for keys that would escape the archive root.
pub fn archive_entry_name(key: &str, prefix: &str) -> Option<String> {
    let relative = key.strip_prefix(prefix)?;
    if relative.is_empty() || relative.ends_with('/') {
        return None;
    }
    let candidate = Path::new(relative);
    if candidate.is_absolute()
        || candidate
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(relative.to_string())
}

enum EntryOutcome {
    Written(u64),
    Skipped(String),
}

pub struct FolderOperationEngine {
    store: Arc<dyn ObjectStoreClient>,
    pager: PrefixPager,
    concurrency: usize,
    compression: u32,
}

impl FolderOperationEngine {
    pub fn new(store: Arc<dyn ObjectStoreClient>, settings: &BrowserSettings) -> Self {
        let pager = PrefixPager::new(store.clone()).with_page_size(settings.page_size);
        Self {
            store,
            pager,
            concurrency: settings.folder_concurrency.max(1),
            compression: settings.archive_compression.min(9),
        }
    }

    pub fn pager(&self) -> &PrefixPager {
        &self.pager
    }

    /// A paginated folder is re-enumerated after each round until a round
    /// finds nothing left to delete. Refused keys are reported once.
    pub async fn delete_folder(&self, bucket: &str, prefix: &str) -> Result<DeleteReport> {
        let prefix = folder_prefix(prefix)?;
        let mut report = DeleteReport::default();
        let mut refused: HashSet<String> = HashSet::new();
        let mut paginated = false;

        loop {
            let enumeration = self.pager.enumerate(bucket, &prefix).await?;
            report.passes += 1;

            let targets: Vec<String> = enumeration
                .keys()
                .into_iter()
                .filter(|key| !refused.contains(key))
                .collect();
            if targets.is_empty() {
                break;
            }

            let (deleted, failed) = match self.store.delete_many(bucket, &targets).await {
                Ok(outcome) => (outcome.deleted.len(), outcome.failed),
                Err(err) if err.requires_reconnect() => return Err(err),
                Err(err) => {
                    let reason = err.to_string();
                    let failed = targets
                        .iter()
                        .map(|key| KeyFailure::new(key.clone(), reason.clone()))
                        .collect();
                    (0, failed)
                }
            };

            for failure in &failed {
                tracing::warn!(bucket, key = %failure.key, reason = %failure.reason, "delete failed");
                refused.insert(failure.key.clone());
            }
            report.deleted_count += deleted;
            report.failed.extend(failed);

            paginated |= enumeration.pages > 1;
            if !paginated || deleted == 0 {
                break;
            }
        }

        tracing::info!(
            bucket,
            prefix = %prefix,
            deleted = report.deleted_count,
            failed = report.failed.len(),
            passes = report.passes,
            "folder delete finished"
        );
        Ok(report)
    }

    pub async fn rename_folder(
        &self,
        bucket: &str,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<RenameReport> {
        let old_prefix = folder_prefix(old_prefix)?;
        let new_prefix = folder_prefix(new_prefix)?;
        if old_prefix == new_prefix {
            return Err(BrowserError::invalid("Folder already has that name"));
        }
        if new_prefix.starts_with(&old_prefix) {
            return Err(BrowserError::invalid(format!(
                "Cannot move {old_prefix} into its own subfolder {new_prefix}"
            )));
        }

        let enumeration = self.pager.enumerate(bucket, &old_prefix).await?;
        let moves: Vec<(String, String)> = enumeration
            .objects
            .into_iter()
            .filter_map(|object| {
                let destination = rewrite_key(&object.key, &old_prefix, &new_prefix)?;
                Some((object.key, destination))
            })
            .collect();

        let entries: Vec<RenameEntry> = stream::iter(moves)
            .map(|(source, destination)| self.move_object(bucket, source, destination))
            .buffered(self.concurrency)
            .collect()
            .await;

        let report = RenameReport::from_entries(entries);
        tracing::info!(
            bucket,
            from = %old_prefix,
            to = %new_prefix,
            renamed = report.renamed_count,
            total = report.entries.len(),
            "folder rename finished"
        );
        Ok(report)
    }

    pub async fn move_object(&self, bucket: &str, source: String, destination: String) -> RenameEntry {
        let mut entry = RenameEntry {
            source,
            destination,
            state: RenameState::Pending,
            error: None,
        };

        if let Err(err) = self
            .store
            .copy(bucket, &entry.source, &entry.destination)
            .await
        {
            tracing::warn!(bucket, key = %entry.source, "copy failed: {err}");
            entry.error = Some(err.to_string());
            return entry;
        }
        entry.state = RenameState::Copied;

        match self.store.delete(bucket, &entry.source).await {
            Ok(()) => entry.state = RenameState::Moved,
            Err(err) => {
                tracing::warn!(bucket, key = %entry.source, "delete after copy failed: {err}");
                entry.error = Some(err.to_string());
            }
        }
        entry
    }

    /// `on_progress` receives `(objects done, objects total)`.
    pub async fn download_folder(
        &self,
        bucket: &str,
        prefix: &str,
        destination: &Path,
        mut on_progress: impl FnMut(usize, usize),
    ) -> Result<ArchiveReport> {
        let prefix = folder_prefix(prefix)?;
        let enumeration = self.pager.enumerate(bucket, &prefix).await?;

        let mut failed = Vec::new();
        let mut entries: Vec<(ObjectRecord, String)> = Vec::new();
        for object in enumeration.objects {
            if object.key == prefix || object.is_folder_marker() {
                continue;
            }
            match archive_entry_name(&object.key, &prefix) {
                Some(name) => entries.push((object, name)),
                None => failed.push(KeyFailure::new(
                    object.key.clone(),
                    "key cannot be stored as an archive entry",
                )),
            }
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(destination).map_err(|err| {
            BrowserError::ArchiveWrite(format!("Failed to create {}: {err}", destination.display()))
        })?;
        let mut archive = ZipWriter::new(io::BufWriter::new(file));
        let options = self.entry_options();

        let total = entries.len();
        let mut archived_count = 0usize;
        let mut bytes_archived = 0u64;
        on_progress(0, total);

        let mut fetches = stream::iter(entries)
            .map(|(object, name)| async move {
                let body = self.store.get(bucket, &object.key).await;
                (object, name, body)
            })
            .buffered(self.concurrency);

        let mut done = 0usize;
        while let Some((object, name, body)) = fetches.next().await {
            done += 1;
            let written = match body {
                Ok(body) => write_entry(&mut archive, &name, &object, body, options).await,
                Err(err) => Ok(EntryOutcome::Skipped(err.to_string())),
            };
            match written {
                Ok(EntryOutcome::Written(size)) => {
                    archived_count += 1;
                    bytes_archived += size;
                }
                Ok(EntryOutcome::Skipped(reason)) => {
                    tracing::warn!(bucket, key = %object.key, "object left out of archive: {reason}");
                    failed.push(KeyFailure::new(object.key, reason));
                }
                Err(err) => {
                    drop(fetches);
                    drop(archive);
                    discard_partial(destination);
                    return Err(err);
                }
            }
            on_progress(done, total);
        }
        drop(fetches);

        if let Err(err) = finish_archive(archive) {
            discard_partial(destination);
            return Err(err);
        }

        tracing::info!(
            bucket,
            prefix = %prefix,
            archived = archived_count,
            failed = failed.len(),
            path = %destination.display(),
            "folder archive written"
        );
        Ok(ArchiveReport {
            path: destination.to_path_buf(),
            archived_count,
            bytes_archived,
            failed,
        })
    }

    fn entry_options(&self) -> SimpleFileOptions {
        let options = SimpleFileOptions::default().unix_permissions(0o644);
        if self.compression == 0 {
            options.compression_method(CompressionMethod::Stored)
        } else {
            options
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(self.compression)))
        }
    }
}

/// An `Err` is fatal to the archive; a broken or short body drops its entry.
async fn write_entry(
    archive: &mut ZipWriter<io::BufWriter<fs::File>>,
    name: &str,
    object: &ObjectRecord,
    mut body: ObjectBody,
    options: SimpleFileOptions,
) -> Result<EntryOutcome> {
    let write_failed =
        |err: &dyn std::fmt::Display| BrowserError::ArchiveWrite(format!("{name}: {err}"));
    let options = options
        .large_file(body.size >= u64::from(u32::MAX))
        .last_modified_time(entry_time(&object.last_modified));
    archive
        .start_file(name, options)
        .map_err(|err| write_failed(&err))?;

    let mut written = 0u64;
    let mut broken = None;
    while let Some(chunk) = body.stream.next().await {
        match chunk {
            Ok(chunk) => {
                archive.write_all(&chunk).map_err(|err| write_failed(&err))?;
                written += chunk.len() as u64;
            }
            Err(err) => {
                broken = Some(err.to_string());
                break;
            }
        }
    }
    if broken.is_none() && written != body.size {
        broken = Some(format!(
            "expected {} bytes but received {written}",
            body.size
        ));
    }

    match broken {
        None => Ok(EntryOutcome::Written(written)),
        Some(reason) => {
            archive.abort_file().map_err(|err| write_failed(&err))?;
            Ok(EntryOutcome::Skipped(reason))
        }
    }
}

fn entry_time(modified: &DateTime<Utc>) -> zip::DateTime {
    u16::try_from(modified.year())
        .ok()
        .and_then(|year| {
            zip::DateTime::from_date_and_time(
                year,
                modified.month() as u8,
                modified.day() as u8,
                modified.hour() as u8,
                modified.minute() as u8,
                modified.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

fn folder_prefix(prefix: &str) -> Result<String> {
    let prefix = normalize_prefix(prefix.trim_start_matches('/'));
    if prefix.is_empty() {
        return Err(BrowserError::invalid("A folder prefix is required"));
    }
    Ok(prefix)
}

fn finish_archive(archive: ZipWriter<io::BufWriter<fs::File>>) -> Result<()> {
    let finalize = |err: io::Error| BrowserError::ArchiveFinalize(err.to_string());
    let writer = archive
        .finish()
        .map_err(|err| BrowserError::ArchiveFinalize(err.to_string()))?;
    let mut file = writer
        .into_inner()
        .map_err(|err| BrowserError::ArchiveFinalize(err.error().to_string()))?;
    // An aborted last entry can leave stale bytes past the footer.
    let end = file.stream_position().map_err(finalize)?;
    file.set_len(end).map_err(finalize)?;
    file.sync_all().map_err(finalize)
}

fn discard_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        tracing::debug!(path = %path.display(), "could not remove partial archive: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{temp_dir, Call, MemoryStore};
    use std::io::Read;

    const BUCKET: &str = "media";

    fn engine(store: &Arc<MemoryStore>, concurrency: usize) -> FolderOperationEngine {
        let settings = BrowserSettings {
            folder_concurrency: concurrency,
            ..BrowserSettings::default()
        };
        FolderOperationEngine::new(store.clone(), &settings)
    }

    fn read_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
        (0..archive.len())
            .map(|index| {
                let mut entry = archive.by_index(index).unwrap();
                let mut content = Vec::new();
                entry.read_to_end(&mut content).unwrap();
                (entry.name().to_string(), content)
            })
            .collect()
    }

    #[test]
    fn rewrite_only_touches_the_leading_prefix() {
        assert_eq!(
            rewrite_key("a/b/d/e.txt", "a/b/", "a/c/").as_deref(),
            Some("a/c/d/e.txt")
        );
        assert_eq!(
            rewrite_key("a/b/x/a/b/y.txt", "a/b/", "z/").as_deref(),
            Some("z/x/a/b/y.txt")
        );
        assert_eq!(rewrite_key("x/a/b/y.txt", "a/b/", "z/"), None);
    }

    #[test]
    fn archive_names_are_relative_to_the_folder() {
        assert_eq!(
            archive_entry_name("photos/2024/trip/a.jpg", "photos/2024/").as_deref(),
            Some("trip/a.jpg")
        );
        assert_eq!(archive_entry_name("photos/2024/", "photos/2024/"), None);
        assert_eq!(archive_entry_name("photos/2024/empty/", "photos/2024/"), None);
        assert_eq!(archive_entry_name("photos/2024/../etc/passwd", "photos/2024/"), None);
    }

    #[tokio::test]
    async fn deleting_an_empty_prefix_succeeds_with_zero() {
        let store = MemoryStore::new(BUCKET).shared();
        store.insert("other/file.txt", b"keep");

        let report = engine(&store, 1).delete_folder(BUCKET, "missing/").await.unwrap();
        assert_eq!(report.deleted_count, 0);
        assert!(report.is_complete());
        assert_eq!(store.keys(), vec!["other/file.txt"]);
        assert!(!store.calls().iter().any(|c| matches!(c, Call::DeleteMany(_))));
    }

    #[tokio::test]
    async fn delete_targets_markers_and_nested_keys_across_pages() {
        let store = MemoryStore::new(BUCKET).with_page_size(2).shared();
        store.insert("docs/", b"");
        store.insert("docs/a.txt", b"a");
        store.insert("docs/sub/", b"");
        store.insert("docs/sub/b.txt", b"b");
        store.insert("docs/sub/deeper/c.txt", b"c");
        store.insert("docsheet.txt", b"keep");

        let report = engine(&store, 1).delete_folder(BUCKET, "docs/").await.unwrap();
        assert_eq!(report.deleted_count, 5);
        assert!(report.is_complete());
        assert_eq!(store.keys(), vec!["docsheet.txt"]);

        let batches: Vec<_> = store
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::DeleteMany(keys) => Some(keys),
                _ => None,
            })
            .collect();
        assert!(batches[0].contains(&"docs/".to_string()));
    }

    #[tokio::test]
    async fn delete_repeats_until_late_arrivals_are_gone() {
        let store = MemoryStore::new(BUCKET).with_page_size(2).shared();
        for key in ["logs/1", "logs/2", "logs/3"] {
            store.insert(key, b"x");
        }
        store.arrive_after_delete(&["logs/4"]);

        let report = engine(&store, 1).delete_folder(BUCKET, "logs/").await.unwrap();
        assert_eq!(report.deleted_count, 4);
        assert_eq!(report.passes, 3);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn partial_batch_delete_reports_each_rejected_key() {
        let store = MemoryStore::new(BUCKET).shared();
        for key in ["tmp/1", "tmp/2", "tmp/3", "tmp/4", "tmp/5"] {
            store.insert(key, b"x");
        }
        store.reject_delete("tmp/2", "AccessDenied");
        store.reject_delete("tmp/4", "ObjectLocked");

        let report = engine(&store, 1).delete_folder(BUCKET, "tmp/").await.unwrap();
        assert_eq!(report.deleted_count, 3);
        assert_eq!(
            report.failed,
            vec![
                KeyFailure::new("tmp/2", "AccessDenied"),
                KeyFailure::new("tmp/4", "ObjectLocked"),
            ]
        );

        match report.into_result() {
            Err(BrowserError::PartialBatchFailure(summary)) => {
                assert_eq!(summary.succeeded, 3);
                assert_eq!(summary.failed.len(), 2);
            }
            other => panic!("expected a partial failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_rejected_batch_does_not_hide_deletions_from_earlier_batches() {
        let store = MemoryStore::new(BUCKET).shared();
        for i in 0..1500 {
            store.insert(&format!("bulk/{i:04}"), b"x");
        }
        store.fail_delete_batch(2, "SlowDown");

        let report = engine(&store, 1).delete_folder(BUCKET, "bulk/").await.unwrap();
        assert_eq!(report.deleted_count, 1000);
        assert_eq!(report.failed.len(), 500);
        assert_eq!(report.failed[0], KeyFailure::new("bulk/1000", "S3 request failed: SlowDown"));
        assert_eq!(report.passes, 2);
        assert_eq!(store.keys().len(), 500);
        assert_eq!(store.keys()[0], "bulk/1000");

        match report.into_result() {
            Err(BrowserError::PartialBatchFailure(summary)) => {
                assert_eq!(summary.succeeded, 1000);
                assert_eq!(summary.failed.len(), 500);
            }
            other => panic!("expected a partial failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_rejected_delete_request_marks_every_key_failed() {
        let store = MemoryStore::new(BUCKET).shared();
        for key in ["tmp/1", "tmp/2", "tmp/3"] {
            store.insert(key, b"x");
        }
        store.fail_delete_request("AccessDenied");

        let report = engine(&store, 1).delete_folder(BUCKET, "tmp/").await.unwrap();
        assert_eq!(report.deleted_count, 0);
        assert_eq!(report.passes, 1);
        let failed: Vec<_> = report.failed.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(failed, vec!["tmp/1", "tmp/2", "tmp/3"]);
        assert!(report
            .failed
            .iter()
            .all(|f| f.reason == "S3 request failed: AccessDenied"));
        assert_eq!(store.keys().len(), 3);
    }

    #[tokio::test]
    async fn refused_keys_do_not_loop_forever_on_paginated_folders() {
        let store = MemoryStore::new(BUCKET).with_page_size(1).shared();
        store.insert("locked/a", b"x");
        store.insert("locked/b", b"x");
        store.reject_delete("locked/a", "ObjectLocked");

        let report = engine(&store, 1).delete_folder(BUCKET, "locked/").await.unwrap();
        assert_eq!(report.deleted_count, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(store.keys(), vec!["locked/a"]);
    }

    #[tokio::test]
    async fn rename_moves_every_object_and_marker() {
        for concurrency in [1, 4] {
            let store = MemoryStore::new(BUCKET).with_page_size(2).shared();
            store.insert("a/b/", b"");
            store.insert("a/b/d/e.txt", b"e");
            store.insert("a/b/f.txt", b"f");
            store.insert("a/bee.txt", b"untouched");

            let report = engine(&store, concurrency)
                .rename_folder(BUCKET, "a/b/", "a/c/")
                .await
                .unwrap();

            assert_eq!(report.renamed_count, 3);
            assert!(report.is_complete());
            assert_eq!(
                store.keys(),
                vec!["a/bee.txt", "a/c/", "a/c/d/e.txt", "a/c/f.txt"]
            );
            assert_eq!(store.content("a/c/d/e.txt").unwrap(), b"e");
            let sources: Vec<_> = report.entries.iter().map(|e| e.source.as_str()).collect();
            assert_eq!(sources, vec!["a/b/", "a/b/d/e.txt", "a/b/f.txt"]);
        }
    }

    #[tokio::test]
    async fn rename_copies_before_deleting_each_object() {
        let store = MemoryStore::new(BUCKET).shared();
        store.insert("src/1.txt", b"1");
        store.insert("src/2.txt", b"2");

        engine(&store, 1)
            .rename_folder(BUCKET, "src/", "dst/")
            .await
            .unwrap();

        let calls = store.calls();
        for key in ["src/1.txt", "src/2.txt"] {
            let copied = calls
                .iter()
                .position(|c| matches!(c, Call::Copy { from, .. } if from == key))
                .unwrap();
            let deleted = calls
                .iter()
                .position(|c| matches!(c, Call::Delete(k) if k == key))
                .unwrap();
            assert!(copied < deleted, "{key} deleted before it was copied");
        }
    }

    #[tokio::test]
    async fn failed_delete_after_copy_keeps_both_keys_and_is_reported() {
        let store = MemoryStore::new(BUCKET).shared();
        store.insert("old/keep.txt", b"k");
        store.insert("old/stuck.txt", b"s");
        store.insert("old/broken.txt", b"b");
        store.reject_delete("old/stuck.txt", "AccessDenied");
        store.fail_copy("old/broken.txt", "InternalError");

        let report = engine(&store, 1)
            .rename_folder(BUCKET, "old/", "new/")
            .await
            .unwrap();

        assert_eq!(report.renamed_count, 1);
        let copied: Vec<_> = report.copied_only().map(|e| e.source.as_str()).collect();
        assert_eq!(copied, vec!["old/stuck.txt"]);
        assert!(store.content("old/stuck.txt").is_some());
        assert!(store.content("new/stuck.txt").is_some());

        let broken = report
            .entries
            .iter()
            .find(|e| e.source == "old/broken.txt")
            .unwrap();
        assert_eq!(broken.state, RenameState::Pending);
        assert!(store.content("new/broken.txt").is_none());
        assert!(!store
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Delete(k) if k == "old/broken.txt")));

        match report.into_result() {
            Err(BrowserError::PartialBatchFailure(summary)) => {
                assert_eq!(summary.succeeded, 1);
                assert_eq!(summary.failed.len(), 2);
                assert!(summary
                    .failed
                    .iter()
                    .any(|f| f.key == "old/stuck.txt" && f.reason.contains("copied to new/stuck.txt")));
            }
            other => panic!("expected a partial failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rename_into_own_subfolder_is_rejected() {
        let store = MemoryStore::new(BUCKET).shared();
        store.insert("a/x.txt", b"x");
        let err = engine(&store, 1)
            .rename_folder(BUCKET, "a/", "a/b/")
            .await
            .unwrap_err();
        assert!(matches!(err, BrowserError::InvalidInput(_)));
        assert_eq!(store.keys(), vec!["a/x.txt"]);
    }

    #[tokio::test]
    async fn archive_contains_relative_paths_and_skips_markers() {
        let store = MemoryStore::new(BUCKET).with_page_size(2).shared();
        store.insert("photos/2024/", b"");
        store.insert("photos/2024/trip/", b"");
        store.insert("photos/2024/trip/a.jpg", b"jpeg bytes");
        store.insert("photos/2024/b.png", b"png");
        store.insert("photos/2023/c.jpg", b"elsewhere");

        let dir = temp_dir("archive");
        let destination = dir.join("2024.zip");
        let mut progress = Vec::new();

        let report = engine(&store, 2)
            .download_folder(BUCKET, "photos/2024/", &destination, |done, total| {
                progress.push((done, total))
            })
            .await
            .unwrap();

        assert_eq!(report.archived_count, 2);
        assert!(report.is_complete());
        assert_eq!(progress.first(), Some(&(0, 2)));
        assert_eq!(progress.last(), Some(&(2, 2)));

        let entries = read_archive(&destination);
        assert_eq!(
            entries,
            vec![
                ("b.png".to_string(), b"png".to_vec()),
                ("trip/a.jpg".to_string(), b"jpeg bytes".to_vec()),
            ]
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn archive_fetch_failures_are_reported_not_fatal() {
        let store = MemoryStore::new(BUCKET).shared();
        store.insert("f/ok.txt", b"ok");
        store.insert("f/bad.txt", b"bad");
        store.fail_get("f/bad.txt", "NoSuchKey");

        let dir = temp_dir("archive-partial");
        let destination = dir.join("f.zip");
        let report = engine(&store, 1)
            .download_folder(BUCKET, "f/", &destination, |_, _| {})
            .await
            .unwrap();

        assert_eq!(report.archived_count, 1);
        assert_eq!(report.failed, vec![KeyFailure::new("f/bad.txt", "S3 request failed: NoSuchKey")]);
        assert_eq!(read_archive(&destination).len(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn archive_entries_with_broken_or_short_bodies_are_dropped() {
        let store = MemoryStore::new(BUCKET).shared();
        store.insert("f/cut.txt", b"truncated");
        store.insert("f/ok.txt", b"complete body");
        store.insert("f/short.txt", b"tiny");
        store.fail_stream("f/cut.txt", "connection reset");
        store.misreport_size("f/short.txt", 99);

        let dir = temp_dir("archive-stream");
        let destination = dir.join("f.zip");
        let report = engine(&store, 1)
            .download_folder(BUCKET, "f/", &destination, |_, _| {})
            .await
            .unwrap();

        assert_eq!(report.archived_count, 1);
        assert_eq!(report.bytes_archived, 13);
        assert_eq!(
            report.failed,
            vec![
                KeyFailure::new("f/cut.txt", "S3 request failed: connection reset"),
                KeyFailure::new("f/short.txt", "expected 99 bytes but received 4"),
            ]
        );
        assert_eq!(
            read_archive(&destination),
            vec![("ok.txt".to_string(), b"complete body".to_vec())]
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn archive_of_an_empty_folder_is_written_with_no_entries() {
        let store = MemoryStore::new(BUCKET).shared();
        store.insert("empty/", b"");
        store.insert("empty/nested/", b"");

        let dir = temp_dir("archive-empty");
        let destination = dir.join("empty.zip");
        let mut progress = Vec::new();
        let report = engine(&store, 1)
            .download_folder(BUCKET, "empty/", &destination, |done, total| {
                progress.push((done, total))
            })
            .await
            .unwrap();

        assert_eq!(report.archived_count, 0);
        assert!(report.is_complete());
        assert_eq!(progress, vec![(0, 0)]);
        assert!(read_archive(&destination).is_empty());
        assert!(!store.calls().iter().any(|c| matches!(c, Call::Get(_))));
        let _ = fs::remove_dir_all(dir);
    }
}
