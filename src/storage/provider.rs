use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::Result;
use crate::models::PartInfo;

/// Handle of a multipart upload opened on the object store
#[derive(Debug, Clone)]
pub struct MultipartSession {
    pub key: String,
    pub upload_id: String,
}

/// Object produced by completing a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledObject {
    pub size: u64,
    /// Lowercase hex SHA-256 of the assembled bytes
    pub sha256: String,
}

/// Object body with its metadata
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub size: u64,
}

/// Object storage backend
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a whole body in one call; returns the generated key.
    /// `ext` is a hint for the key suffix and content type.
    async fn put_direct(&self, data: Bytes, ext: &str) -> Result<String>;

    /// Open a multipart upload for a new key
    async fn initiate_multipart(&self, ext: &str) -> Result<MultipartSession>;

    /// Store one part; returns its eTag
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Assemble the parts, in the given order, into the final object and
    /// return its size and digest. Completing an already completed session
    /// for the same key succeeds.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> Result<AssembledObject>;

    /// Discard a multipart upload and its parts
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Download an object
    async fn get(&self, key: &str) -> Result<StoredObject>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Time-limited download URL, optionally forcing an attachment filename
    async fn presign(&self, key: &str, ttl: Duration, filename: Option<&str>) -> Result<String>;

    /// Get the storage type name
    fn storage_type(&self) -> &'static str;
}
