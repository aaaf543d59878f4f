use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Public share link pointing at one of the owner's file entries
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ShareLink {
    pub id: String,
    pub owner_user_id: String,
    pub tree_entry_id: String,
    pub blob_ref: String,
    /// Zero means the link never expires
    pub expires_in_seconds: i64,
    pub click_count: i64,
    pub created_at: String,
}

/// Request to create a share
#[derive(Debug, Deserialize)]
pub struct CreateShareRequest {
    pub entry_id: String,
    pub expires_in_seconds: Option<i64>,
}

/// Public view of a share link
#[derive(Debug, Serialize)]
pub struct ShareDetail {
    pub share_id: String,
    pub blob_id: String,
    pub name: String,
    pub ext: String,
    pub size: i64,
    pub download_url: String,
    pub expires_at: Option<String>,
}

/// Save a shared file into the caller's tree
#[derive(Debug, Deserialize)]
pub struct SaveShareRequest {
    #[serde(default = "super::file::root_id")]
    pub parent_id: String,
}
