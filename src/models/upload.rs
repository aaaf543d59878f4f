use serde::{Deserialize, Serialize};

/// One uploaded part of a multipart session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
}

/// Prepare request, sent before any bytes move
#[derive(Debug, Deserialize)]
pub struct PrepareUploadRequest {
    pub content_hash: String,
    pub name: String,
    #[serde(default)]
    pub ext: String,
}

/// What the client must do next
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadPlan {
    /// Content already in the pool; attach `blob_id` directly
    Existing { blob_id: String },
    /// Upload parts to `key` under `upload_id`, then complete
    Upload {
        key: String,
        upload_id: String,
        chunk_size: u64,
    },
}

/// Complete request
#[derive(Debug, Deserialize)]
pub struct CompleteUploadRequest {
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<PartInfo>,
    pub content_hash: String,
    pub name: String,
    #[serde(default)]
    pub ext: String,
    pub size: i64,
}

#[derive(Debug, Serialize)]
pub struct CompleteUploadResponse {
    pub blob_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AbortUploadRequest {
    pub key: String,
    pub upload_id: String,
}

#[derive(Debug, Serialize)]
pub struct UploadPartResponse {
    pub etag: String,
}

/// Query of the part relay route; the body carries the bytes
#[derive(Debug, Deserialize)]
pub struct UploadPartQuery {
    pub key: String,
    pub upload_id: String,
    pub part_number: u32,
}
