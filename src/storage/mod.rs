pub mod s3;
pub mod sync;

pub use s3::S3Client;
pub use sync::{fetch_latest_artifacts, publish_artifacts, FetchReport, PublishReport};

use async_trait::async_trait;

use crate::error::StorageError;

/// One listed entry; `is_prefix` marks a "directory" in delimited listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub is_prefix: bool,
}

impl ObjectInfo {
    pub fn object(key: impl Into<String>, size: u64) -> Self {
        Self { key: key.into(), size, is_prefix: false }
    }

    pub fn prefix(key: impl Into<String>) -> Self {
        Self { key: key.into(), size: 0, is_prefix: true }
    }
}

/// Bucket-scoped object storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List keys under `prefix`; non-recursive listings stop at the next `/`
    async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<ObjectInfo>, StorageError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), StorageError>;
}
