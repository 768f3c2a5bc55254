use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{BrowserError, KeyFailure, Result};
use crate::model::{BatchDeleteOutcome, FolderRecord, ListingPage, ObjectBody, ObjectRecord};
use crate::store::{
    delete_in_batches, ListRequest, ObjectStoreClient, UploadProgress, DELETE_BATCH_SIZE,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    List { prefix: String, token: Option<String> },
    Get(String),
    Put(String),
    Delete(String),
    DeleteMany(Vec<String>),
    Copy { from: String, to: String },
    Head(String),
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Vec<u8>>,
    calls: Vec<Call>,
    list_calls: usize,
    fail_list_on: HashMap<usize, String>,
    reject_delete: HashMap<String, String>,
    fail_copy: HashMap<String, String>,
    fail_get: HashMap<String, String>,
    fail_stream: HashMap<String, String>,
    misreported_sizes: HashMap<String, u64>,
    fail_put: HashMap<String, (usize, String)>,
    delete_batches: usize,
    fail_delete_batch_on: HashMap<usize, String>,
    fail_delete_request: Option<String>,
    arrive_after_delete: Vec<String>,
    reverse_pages: bool,
}

/// Bucket held in memory, paging like S3 with start-after continuation tokens.
pub struct MemoryStore {
    bucket: String,
    page_size: usize,
    chunk_size: usize,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            page_size: 1000,
            chunk_size: 3,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, key: &str, content: &[u8]) {
        self.state().objects.insert(key.to_string(), content.to_vec());
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn content(&self, key: &str) -> Option<Vec<u8>> {
        self.state().objects.get(key).cloned()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn reverse_page_contents(&self, reverse: bool) {
        self.state().reverse_pages = reverse;
    }

    /// Fails the `nth` list call (1-based) with `message`.
    pub fn fail_list_page(&self, nth: usize, message: &str) {
        self.state().fail_list_on.insert(nth, message.to_string());
    }

    pub fn reject_delete(&self, key: &str, reason: &str) {
        self.state()
            .reject_delete
            .insert(key.to_string(), reason.to_string());
    }

    pub fn fail_copy(&self, source_key: &str, reason: &str) {
        self.state()
            .fail_copy
            .insert(source_key.to_string(), reason.to_string());
    }

    pub fn fail_get(&self, key: &str, reason: &str) {
        self.state().fail_get.insert(key.to_string(), reason.to_string());
    }

    /// Lets the body of `key` start streaming, then breaks it after one chunk.
    pub fn fail_stream(&self, key: &str, reason: &str) {
        self.state()
            .fail_stream
            .insert(key.to_string(), reason.to_string());
    }

    /// Reports `size` as the length of `key` while serving its real bytes.
    pub fn misreport_size(&self, key: &str, size: u64) {
        self.state().misreported_sizes.insert(key.to_string(), size);
    }

    /// Fails an upload of `key` once `after_parts` chunks have been accepted.
    pub fn fail_put(&self, key: &str, after_parts: usize, reason: &str) {
        self.state()
            .fail_put
            .insert(key.to_string(), (after_parts, reason.to_string()));
    }

    /// Rejects the `nth` delete batch (1-based, counted across calls).
    pub fn fail_delete_batch(&self, nth: usize, message: &str) {
        self.state()
            .fail_delete_batch_on
            .insert(nth, message.to_string());
    }

    /// Rejects every batch delete request outright.
    pub fn fail_delete_request(&self, message: &str) {
        self.state().fail_delete_request = Some(message.to_string());
    }

    /// Keys written by a concurrent client right after the next batch delete.
    pub fn arrive_after_delete(&self, keys: &[&str]) {
        self.state()
            .arrive_after_delete
            .extend(keys.iter().map(|key| key.to_string()));
    }

    fn delete_batch(&self, keys: &[String]) -> Result<BatchDeleteOutcome> {
        let mut state = self.state();
        state.calls.push(Call::DeleteMany(keys.to_vec()));
        state.delete_batches += 1;
        let nth = state.delete_batches;
        if let Some(message) = state.fail_delete_batch_on.get(&nth) {
            return Err(BrowserError::store(message));
        }

        let mut outcome = BatchDeleteOutcome::default();
        for key in keys {
            if let Some(reason) = state.reject_delete.get(key).cloned() {
                outcome.failed.push(KeyFailure::new(key.clone(), reason));
            } else {
                state.objects.remove(key);
                outcome.deleted.push(key.clone());
            }
        }
        Ok(outcome)
    }

    fn store_upload(
        &self,
        key: &str,
        content: Vec<u8>,
        on_progress: UploadProgress<'_>,
    ) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::Put(key.to_string()));
        let total = content.len() as u64;
        let failure = state.fail_put.get(key).cloned();

        let mut sent = 0u64;
        for (index, chunk) in content.chunks(self.chunk_size).enumerate() {
            if let Some((after_parts, reason)) = &failure {
                if index == *after_parts {
                    return Err(BrowserError::store(reason));
                }
            }
            sent += chunk.len() as u64;
            on_progress(sent, total);
        }
        if content.is_empty() {
            on_progress(0, 0);
        }
        state.objects.insert(key.to_string(), content);
        Ok(())
    }

    fn check_bucket(&self, bucket: &str) -> Result<()> {
        if bucket == self.bucket {
            Ok(())
        } else {
            Err(BrowserError::store(format!("NoSuchBucket: {bucket}")))
        }
    }
}

fn last_modified() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

fn record(key: &str, content: &[u8]) -> ObjectRecord {
    ObjectRecord {
        key: key.to_string(),
        size: content.len() as u64,
        last_modified: last_modified(),
        storage_class: Some("STANDARD".to_string()),
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryStore {
    async fn list(&self, bucket: &str, request: ListRequest<'_>) -> Result<ListingPage> {
        self.check_bucket(bucket)?;
        let mut state = self.state();
        state.list_calls += 1;
        state.calls.push(Call::List {
            prefix: request.prefix.to_string(),
            token: request.continuation_token.map(str::to_string),
        });
        let nth = state.list_calls;
        if let Some(message) = state.fail_list_on.get(&nth) {
            return Err(BrowserError::store(message));
        }

        let max_keys = (request.max_keys.max(1) as usize).min(self.page_size);
        let mut page = ListingPage::default();
        let mut emitted = 0usize;
        let mut last_key: Option<String> = None;
        let mut last_folder: Option<String> = None;

        let candidates = state.objects.iter().filter(|(key, _)| {
            key.starts_with(request.prefix)
                && request
                    .continuation_token
                    .map_or(true, |token| key.as_str() > token)
        });

        for (key, content) in candidates {
            let rest = &key[request.prefix.len()..];
            let folder = request.delimiter.and_then(|delimiter| {
                rest.find(delimiter)
                    .map(|idx| format!("{}{}", request.prefix, &rest[..idx + delimiter.len()]))
            });

            if let Some(folder) = folder {
                if last_folder.as_deref() == Some(folder.as_str()) {
                    last_key = Some(key.clone());
                    continue;
                }
                if emitted == max_keys {
                    page.is_truncated = true;
                    break;
                }
                page.folders.push(FolderRecord::new(folder.clone()));
                last_folder = Some(folder);
            } else {
                if emitted == max_keys {
                    page.is_truncated = true;
                    break;
                }
                page.objects.push(record(key, content));
            }
            emitted += 1;
            last_key = Some(key.clone());
        }

        if page.is_truncated {
            page.continuation_token = last_key;
        }
        if state.reverse_pages {
            page.objects.reverse();
            page.folders.reverse();
        }
        Ok(page)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        self.check_bucket(bucket)?;
        let mut state = self.state();
        state.calls.push(Call::Get(key.to_string()));
        if let Some(reason) = state.fail_get.get(key) {
            return Err(BrowserError::store(reason));
        }
        let content = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| BrowserError::store(format!("NoSuchKey: {key}")))?;

        let mut chunks: Vec<Result<Bytes>> = content
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if let Some(reason) = state.fail_stream.get(key) {
            chunks.truncate(1);
            chunks.push(Err(BrowserError::store(reason)));
        }
        let size = state
            .misreported_sizes
            .get(key)
            .copied()
            .unwrap_or(content.len() as u64);
        Ok(ObjectBody {
            size,
            stream: stream::iter(chunks).boxed(),
        })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        on_progress: UploadProgress<'_>,
    ) -> Result<()> {
        self.check_bucket(bucket)?;
        self.store_upload(key, body.to_vec(), on_progress)
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        on_progress: UploadProgress<'_>,
    ) -> Result<u64> {
        self.check_bucket(bucket)?;
        let content = tokio::fs::read(path).await?;
        let size = content.len() as u64;
        self.store_upload(key, content, on_progress)?;
        Ok(size)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.check_bucket(bucket)?;
        let mut state = self.state();
        state.calls.push(Call::Delete(key.to_string()));
        if let Some(reason) = state.reject_delete.get(key) {
            return Err(BrowserError::store(reason));
        }
        state.objects.remove(key);
        Ok(())
    }

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<BatchDeleteOutcome> {
        self.check_bucket(bucket)?;
        let rejected = self.state().fail_delete_request.clone();
        if let Some(message) = rejected {
            return Err(BrowserError::store(message));
        }

        let outcome = delete_in_batches(keys, DELETE_BATCH_SIZE, |batch| {
            std::future::ready(self.delete_batch(batch))
        })
        .await?;

        let mut state = self.state();
        for key in std::mem::take(&mut state.arrive_after_delete) {
            state.objects.insert(key, b"late".to_vec());
        }
        Ok(outcome)
    }

    async fn copy(&self, bucket: &str, source_key: &str, dest_key: &str) -> Result<()> {
        self.check_bucket(bucket)?;
        let mut state = self.state();
        state.calls.push(Call::Copy {
            from: source_key.to_string(),
            to: dest_key.to_string(),
        });
        if let Some(reason) = state.fail_copy.get(source_key) {
            return Err(BrowserError::store(reason));
        }
        let content = state
            .objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| BrowserError::store(format!("NoSuchKey: {source_key}")))?;
        state.objects.insert(dest_key.to_string(), content);
        Ok(())
    }

    async fn head_metadata(&self, bucket: &str, key: &str) -> Result<u64> {
        self.check_bucket(bucket)?;
        let mut state = self.state();
        state.calls.push(Call::Head(key.to_string()));
        state
            .objects
            .get(key)
            .map(|content| content.len() as u64)
            .ok_or_else(|| BrowserError::store(format!("NoSuchKey: {key}")))
    }
}

/// Fresh directory under the system temp dir.
pub fn temp_dir(label: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("s3vault-{label}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
