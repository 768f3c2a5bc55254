use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{BrowserError, Result};
use crate::model::{FolderListing, FolderRecord, ObjectRecord};
use crate::store::{ListRequest, ObjectStoreClient, MAX_PAGE_SIZE};

const DELIMITER: &str = "/";

/// Every object under a prefix, nested folders and folder markers included.
#[derive(Clone, Debug, Default)]
pub struct Enumeration {
    pub objects: Vec<ObjectRecord>,
    pub pages: usize,
}

impl Enumeration {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|object| object.key.clone()).collect()
    }
}

#[derive(Default)]
struct Accumulated {
    objects: BTreeMap<String, ObjectRecord>,
    folders: BTreeSet<FolderRecord>,
    pages: usize,
}

/// Drives continuation-token pagination until the store reports the last page.
#[derive(Clone)]
pub struct PrefixPager {
    store: Arc<dyn ObjectStoreClient>,
    page_size: i32,
}

impl PrefixPager {
    pub fn new(store: Arc<dyn ObjectStoreClient>) -> Self {
        Self {
            store,
            page_size: MAX_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    /// One level of the folder view: files directly under `prefix` and the
    /// sub-folders one segment below it. Folder markers are not files.
    pub async fn list_all(&self, bucket: &str, prefix: &str) -> Result<FolderListing> {
        let accumulated = self.fetch_all(bucket, prefix, Some(DELIMITER)).await?;

        let files = accumulated
            .objects
            .into_values()
            .filter(|object| !object.is_folder_marker())
            .collect();

        Ok(FolderListing {
            files,
            folders: accumulated.folders.into_iter().collect(),
        })
    }

    /// Flat enumeration used by the bulk folder operations.
    pub async fn enumerate(&self, bucket: &str, prefix: &str) -> Result<Enumeration> {
        let accumulated = self.fetch_all(bucket, prefix, None).await?;
        Ok(Enumeration {
            objects: accumulated.objects.into_values().collect(),
            pages: accumulated.pages,
        })
    }

    async fn fetch_all(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Accumulated> {
        let mut accumulated = Accumulated::default();
        let mut continuation_token: Option<String> = None;

        loop {
            let request = ListRequest {
                prefix,
                delimiter,
                max_keys: self.page_size,
                continuation_token: continuation_token.as_deref(),
            };
            let page = self.store.list(bucket, request).await?;
            accumulated.pages += 1;

            for object in page.objects {
                accumulated.objects.insert(object.key.clone(), object);
            }
            accumulated.folders.extend(page.folders);

            if !page.is_truncated {
                break;
            }
            match page.continuation_token {
                Some(token) => continuation_token = Some(token),
                None => {
                    return Err(BrowserError::store(format!(
                        "Listing of {bucket}/{prefix} was truncated without a continuation token"
                    )))
                }
            }
        }

        tracing::debug!(
            bucket,
            prefix,
            pages = accumulated.pages,
            objects = accumulated.objects.len(),
            folders = accumulated.folders.len(),
            "listing complete"
        );
        Ok(accumulated)
    }
}
