//! Listing the objects of a repository in the object store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{retry::RetryConfig, BehaviorVersion, Builder as S3ConfigBuilder, Credentials, Region},
    error::DisplayErrorContext,
    Client,
};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    download::ObjectDescriptor,
    errors::{CoopError, CoopResult},
    utils::{human_readable_size, parse_s3_url},
};

pub const DEFAULT_ENDPOINT: &str = "https://data.source.coop";
const MAX_ATTEMPTS: u32 = 5;

/// Count and byte total for one file extension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeStats {
    pub count: usize,
    pub size: u64,
}

/// Aggregate view of a batch of objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total_files: usize,
    pub total_size: u64,
    /// Keyed by extension, `(no extension)` for keys without one.
    pub file_types: BTreeMap<String, TypeStats>,
}

impl BatchSummary {
    pub fn total_size_human(&self) -> String {
        human_readable_size(self.total_size)
    }

    /// File types ordered by total size, largest first.
    pub fn types_by_size(&self) -> Vec<(&str, TypeStats)> {
        let mut types: Vec<_> = self
            .file_types
            .iter()
            .map(|(ext, stats)| (ext.as_str(), *stats))
            .collect();
        types.sort_by(|a, b| b.1.size.cmp(&a.1.size));
        types
    }
}

pub fn summarize(objects: &[ObjectDescriptor]) -> BatchSummary {
    let mut summary = BatchSummary::default();
    for object in objects {
        summary.total_files += 1;
        summary.total_size += object.size;

        let mut ext = object.extension();
        if ext.is_empty() {
            ext = String::from("(no extension)");
        }
        let stats = summary.file_types.entry(ext).or_default();
        stats.count += 1;
        stats.size += object.size;
    }
    summary
}

/// Case-insensitive extension filter. `None` and an empty string keep
/// everything.
pub fn matches_file_type(object: &ObjectDescriptor, file_type: Option<&str>) -> bool {
    match file_type {
        Some(wanted) if !wanted.is_empty() => wanted.to_lowercase() == object.extension(),
        _ => true,
    }
}

/// Source of the objects a download batch is built from.
#[async_trait]
pub trait ObjectInventory: Send + Sync {
    async fn list_objects(
        &self,
        s3_url: &str,
        file_type: Option<&str>,
    ) -> CoopResult<Vec<ObjectDescriptor>>;

    async fn list_objects_with_summary(
        &self,
        s3_url: &str,
        file_type: Option<&str>,
    ) -> CoopResult<(Vec<ObjectDescriptor>, BatchSummary)> {
        let objects = self.list_objects(s3_url, file_type).await?;
        let summary = summarize(&objects);
        Ok((objects, summary))
    }
}

/// Anonymous `ListObjectsV2` listing against the public data endpoint.
#[derive(Debug, Clone)]
pub struct S3Inventory {
    client: Client,
    endpoint: String,
}

impl S3Inventory {
    pub fn new(endpoint: &str) -> Self {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        // The endpoint is public; the empty key pair only satisfies the signer.
        let credentials = Credentials::new("", "", None, None, "source-coop-anonymous");

        let config = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("us-east-1"))
            .endpoint_url(&endpoint)
            .force_path_style(true)
            .retry_config(RetryConfig::standard().with_max_attempts(MAX_ATTEMPTS))
            .build();

        S3Inventory {
            client: Client::from_conf(config),
            endpoint,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Default for S3Inventory {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

#[async_trait]
impl ObjectInventory for S3Inventory {
    async fn list_objects(
        &self,
        s3_url: &str,
        file_type: Option<&str>,
    ) -> CoopResult<Vec<ObjectDescriptor>> {
        let (bucket, prefix) = parse_s3_url(s3_url)?;
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&bucket)
                .prefix(&prefix)
                .max_keys(1000);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| CoopError::Inventory(DisplayErrorContext(&e).to_string()))?;

            for obj in response.contents() {
                let Some(key) = obj.key() else { continue };
                if key.ends_with('/') {
                    continue;
                }
                let last_modified = obj
                    .last_modified()
                    .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos()))
                    .unwrap_or_default();
                let descriptor = ObjectDescriptor {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    download_url: format!("{}/{}/{}", self.endpoint, bucket, key),
                    last_modified,
                };
                if matches_file_type(&descriptor, file_type) {
                    objects.push(descriptor);
                }
            }
            debug!(%bucket, %prefix, listed = objects.len(), "listed page");

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            continuation_token = response.next_continuation_token().map(|s| s.to_string());
            if continuation_token.is_none() {
                break;
            }
        }

        Ok(objects)
    }
}
