use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::path::Path;

use crate::error::{KeyFailure, Result};
use crate::model::{BatchDeleteOutcome, ListingPage, ObjectBody};

/// Largest page S3 hands back from a single listing call.
pub const MAX_PAGE_SIZE: i32 = 1000;

/// Most keys one DeleteObjects request accepts.
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Called with `(bytes sent, bytes total)` as an upload advances.
pub type UploadProgress<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

#[derive(Clone, Debug)]
pub struct ListRequest<'a> {
    pub prefix: &'a str,
    pub delimiter: Option<&'a str>,
    pub max_keys: i32,
    pub continuation_token: Option<&'a str>,
}

/// Object operations against an authenticated bucket endpoint.
///
/// Implementations surface every transport, auth or service-side failure as
/// [`BrowserError::StoreRequestFailed`](crate::BrowserError::StoreRequestFailed).
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn list(&self, bucket: &str, request: ListRequest<'_>) -> Result<ListingPage>;

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        on_progress: UploadProgress<'_>,
    ) -> Result<()>;

    /// Uploads a local file without reading it into memory. Returns its size.
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        on_progress: UploadProgress<'_>,
    ) -> Result<u64>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Deletes `keys`, reporting each key as deleted or failed. An `Err` means
    /// the request as a whole was rejected and nothing was deleted.
    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<BatchDeleteOutcome>;

    async fn copy(&self, bucket: &str, source_key: &str, dest_key: &str) -> Result<()>;

    async fn head_metadata(&self, bucket: &str, key: &str) -> Result<u64>;
}

/// Splits `keys` into batches for `delete_batch`. A rejected batch marks its
/// own keys failed and the remaining batches still run.
pub async fn delete_in_batches<'k, F, Fut>(
    keys: &'k [String],
    batch_size: usize,
    mut delete_batch: F,
) -> Result<BatchDeleteOutcome>
where
    F: FnMut(&'k [String]) -> Fut,
    Fut: Future<Output = Result<BatchDeleteOutcome>>,
{
    let mut outcome = BatchDeleteOutcome::default();
    for batch in keys.chunks(batch_size.max(1)) {
        match delete_batch(batch).await {
            Ok(done) => outcome.merge(done),
            Err(err) if err.requires_reconnect() => return Err(err),
            Err(err) => {
                tracing::warn!(keys = batch.len(), "batch delete request failed: {err}");
                let reason = err.to_string();
                outcome.failed.extend(
                    batch
                        .iter()
                        .map(|key| KeyFailure::new(key.clone(), reason.clone())),
                );
            }
        }
    }
    Ok(outcome)
}
