use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
    Client as S3Client,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashSet;
use std::path::Path;
use tokio::fs as tokio_fs;
use tokio::io::AsyncReadExt;

use crate::config::{BrowserSettings, ConnectionConfig};
use crate::error::{BrowserError, KeyFailure, Result};
use crate::model::{BatchDeleteOutcome, FolderRecord, ListingPage, ObjectBody, ObjectRecord};
use crate::store::{
    delete_in_batches, ListRequest, ObjectStoreClient, UploadProgress, DELETE_BATCH_SIZE,
    MAX_PAGE_SIZE,
};

const COPY_SOURCE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'/');

fn request_failed<E: std::error::Error>(err: E) -> BrowserError {
    BrowserError::store(DisplayErrorContext(err))
}

fn to_utc(dt: &aws_sdk_s3::primitives::DateTime) -> DateTime<Utc> {
    dt.to_millis()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

pub fn to_s3_client(config: &ConnectionConfig) -> Result<S3Client> {
    config.validate()?;

    let credentials = Credentials::new(
        config.access_key_id.trim().to_string(),
        config.secret_access_key.trim().to_string(),
        None,
        None,
        "s3vault",
    );

    let mut config_builder = aws_sdk_s3::config::Builder::new()
        .behavior_version_latest()
        .region(Region::new(config.effective_region()))
        .credentials_provider(credentials);

    if let Some(endpoint) = config.endpoint() {
        config_builder = config_builder.endpoint_url(endpoint.to_string());
    }
    if config.force_path_style() {
        config_builder = config_builder.force_path_style(true);
    }

    Ok(S3Client::from_conf(config_builder.build()))
}

enum PartSource {
    Memory { body: Bytes, offset: usize },
    File(tokio_fs::File),
}

impl PartSource {
    async fn next_part(&mut self, part_size: usize) -> Result<Option<Bytes>> {
        match self {
            Self::Memory { body, offset } => {
                if *offset >= body.len() {
                    return Ok(None);
                }
                let end = (*offset + part_size).min(body.len());
                let part = body.slice(*offset..end);
                *offset = end;
                Ok(Some(part))
            }
            Self::File(file) => {
                let mut buffer = vec![0u8; part_size];
                let mut read_total = 0;
                while read_total < buffer.len() {
                    let read = file.read(&mut buffer[read_total..]).await?;
                    if read == 0 {
                        break;
                    }
                    read_total += read;
                }
                if read_total == 0 {
                    return Ok(None);
                }
                buffer.truncate(read_total);
                Ok(Some(Bytes::from(buffer)))
            }
        }
    }
}

/// [`ObjectStoreClient`] backed by `aws-sdk-s3`.
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: S3Client,
    multipart_threshold: usize,
    multipart_part_size: usize,
}

impl S3ObjectStore {
    pub fn new(client: S3Client, settings: &BrowserSettings) -> Self {
        Self {
            client,
            multipart_threshold: settings.multipart_threshold,
            multipart_part_size: settings.multipart_part_size.max(1),
        }
    }

    pub fn from_config(config: &ConnectionConfig, settings: &BrowserSettings) -> Result<Self> {
        Ok(Self::new(to_s3_client(config)?, settings))
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        mut source: PartSource,
        total: u64,
        on_progress: UploadProgress<'_>,
    ) -> Result<()> {
        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(request_failed)?;
        let upload_id = multipart
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| BrowserError::store("Missing multipart upload id"))?;

        let upload_result: Result<()> = async {
            let mut transferred: u64 = 0;
            let mut part_number: i32 = 1;
            let mut parts: Vec<CompletedPart> = Vec::new();
            while let Some(part) = source.next_part(self.multipart_part_size).await? {
                let part_len = part.len() as u64;
                let output = self
                    .client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id.clone())
                    .part_number(part_number)
                    .body(ByteStream::from(part))
                    .send()
                    .await
                    .map_err(request_failed)?;

                parts.push(
                    CompletedPart::builder()
                        .set_e_tag(output.e_tag().map(str::to_string))
                        .part_number(part_number)
                        .build(),
                );
                transferred += part_len;
                on_progress(transferred, total);
                part_number += 1;
            }

            if parts.is_empty() {
                return Err(BrowserError::store("Multipart upload produced no parts"));
            }

            let completed_upload = CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build();
            self.client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id.clone())
                .multipart_upload(completed_upload)
                .send()
                .await
                .map_err(request_failed)?;
            Ok(())
        }
        .await;

        if let Err(err) = upload_result {
            if let Err(abort_err) = self
                .client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
            {
                tracing::warn!(
                    bucket,
                    key,
                    "abort of multipart upload failed: {}",
                    DisplayErrorContext(abort_err)
                );
            }
            return Err(err);
        }
        Ok(())
    }

    async fn delete_chunk(&self, bucket: &str, keys: &[String]) -> Result<BatchDeleteOutcome> {
        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let object = ObjectIdentifier::builder()
                .key(key.clone())
                .build()
                .map_err(|err| BrowserError::store(format!("Invalid object identifier: {err}")))?;
            objects.push(object);
        }
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|err| BrowserError::store(format!("Invalid delete payload: {err}")))?;

        let output = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(request_failed)?;

        // Quiet mode only reports the keys that failed.
        let failed: Vec<KeyFailure> = output
            .errors()
            .iter()
            .map(|error| {
                let reason = match (error.code(), error.message()) {
                    (Some(code), Some(message)) => format!("{code}: {message}"),
                    (Some(code), None) => code.to_string(),
                    (None, Some(message)) => message.to_string(),
                    (None, None) => "delete rejected".to_string(),
                };
                KeyFailure::new(error.key().unwrap_or_default(), reason)
            })
            .collect();
        let failed_keys: HashSet<&str> = failed.iter().map(|f| f.key.as_str()).collect();
        let deleted = keys
            .iter()
            .filter(|key| !failed_keys.contains(key.as_str()))
            .cloned()
            .collect();

        Ok(BatchDeleteOutcome { deleted, failed })
    }
}

#[async_trait]
impl ObjectStoreClient for S3ObjectStore {
    async fn list(&self, bucket: &str, request: ListRequest<'_>) -> Result<ListingPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(request.prefix)
            .max_keys(request.max_keys.clamp(1, MAX_PAGE_SIZE))
            .set_delimiter(request.delimiter.map(str::to_string))
            .set_continuation_token(request.continuation_token.map(str::to_string))
            .send()
            .await
            .map_err(request_failed)?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|item| {
                Some(ObjectRecord {
                    key: item.key()?.to_string(),
                    size: item.size().unwrap_or(0).max(0) as u64,
                    last_modified: item.last_modified().map(to_utc).unwrap_or_else(Utc::now),
                    storage_class: item.storage_class().map(|class| class.as_str().to_string()),
                })
            })
            .collect();
        let folders = output
            .common_prefixes()
            .iter()
            .filter_map(|prefix| prefix.prefix())
            .map(FolderRecord::new)
            .collect();

        Ok(ListingPage {
            objects,
            folders,
            continuation_token: output.next_continuation_token().map(str::to_string),
            is_truncated: output.is_truncated().unwrap_or(false),
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(request_failed)?;
        let size = output.content_length().unwrap_or(0).max(0) as u64;

        let stream = stream::try_unfold(output.body, |mut body| async move {
            match body.try_next().await {
                Ok(Some(chunk)) => Ok(Some((chunk, body))),
                Ok(None) => Ok(None),
                Err(err) => Err(BrowserError::store(format!(
                    "Download stream failed: {}",
                    DisplayErrorContext(err)
                ))),
            }
        })
        .boxed();

        Ok(ObjectBody { size, stream })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        on_progress: UploadProgress<'_>,
    ) -> Result<()> {
        let total = body.len() as u64;
        if body.len() > self.multipart_threshold {
            let source = PartSource::Memory { body, offset: 0 };
            return self
                .put_multipart(bucket, key, source, total, on_progress)
                .await;
        }
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(request_failed)?;
        on_progress(total, total);
        Ok(())
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        on_progress: UploadProgress<'_>,
    ) -> Result<u64> {
        let total = tokio_fs::metadata(path).await?.len();

        if total > self.multipart_threshold as u64 {
            let file = tokio_fs::File::open(path).await?;
            self.put_multipart(bucket, key, PartSource::File(file), total, on_progress)
                .await?;
            return Ok(total);
        }

        let body = ByteStream::from_path(path.to_path_buf())
            .await
            .map_err(|err| BrowserError::store(format!("Failed to stream {}: {err}", path.display())))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(request_failed)?;
        on_progress(total, total);
        Ok(total)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(request_failed)?;
        Ok(())
    }

    async fn delete_many(&self, bucket: &str, keys: &[String]) -> Result<BatchDeleteOutcome> {
        delete_in_batches(keys, DELETE_BATCH_SIZE, |batch| self.delete_chunk(bucket, batch)).await
    }

    async fn copy(&self, bucket: &str, source_key: &str, dest_key: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(bucket)
            .key(dest_key)
            .copy_source(copy_source(bucket, source_key))
            .send()
            .await
            .map_err(request_failed)?;
        Ok(())
    }

    async fn head_metadata(&self, bucket: &str, key: &str) -> Result<u64> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(request_failed)?;
        Ok(head.content_length().unwrap_or(0).max(0) as u64)
    }
}

fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE_ENCODE_SET))
}
