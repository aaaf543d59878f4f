use serde::Serialize;
use sqlx::FromRow;

/// Blob pool row: one physical object per unique content hash, shared by
/// every tree entry that references it.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BlobEntry {
    pub id: String,
    pub content_hash: String,
    pub name: String,
    pub ext: String,
    pub size: i64,
    #[serde(skip_serializing)]
    pub storage_key: String,
    pub created_at: String,
    #[serde(skip_serializing)]
    pub deleted_at: Option<String>,
}

/// Metadata recorded when a new blob is committed to the pool
#[derive(Debug, Clone)]
pub struct NewBlob {
    pub content_hash: String,
    pub name: String,
    pub ext: String,
    pub size: i64,
    pub storage_key: String,
}

/// Outcome of a dedup lookup
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The pool already holds this content
    Hit(BlobEntry),
    /// No live blob for the hash; the bytes must be uploaded
    Miss,
}

/// Query string of a presigned object link
#[derive(Debug, serde::Deserialize)]
pub struct PresignedQuery {
    pub expires: i64,
    pub signature: String,
    #[serde(default)]
    pub filename: String,
}
