use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Parent id of entries that live at the root of a user's tree
pub const ROOT_ID: &str = "0";

/// Node of a user's tree. A null `blob_ref` marks a folder.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TreeEntry {
    pub id: String,
    pub owner_user_id: String,
    pub parent_id: String,
    pub name: String,
    pub ext: String,
    pub blob_ref: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing)]
    pub deleted_at: Option<String>,
}

impl TreeEntry {
    pub fn is_folder(&self) -> bool {
        self.blob_ref.is_none()
    }
}

/// Row returned by list operations, joined with the blob size
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TreeListItem {
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub ext: String,
    pub blob_ref: Option<String>,
    pub size: Option<i64>,
    pub created_at: String,
}

/// Search hit with its ancestor path ("Root/Docs/2024")
#[derive(Debug, Clone, Serialize)]
pub struct SearchItem {
    #[serde(flatten)]
    pub entry: TreeListItem,
    pub parent_path: String,
}

/// One page of entries plus the total matching count
#[derive(Debug, Serialize)]
pub struct Page<T: Serialize> {
    pub list: Vec<T>,
    pub count: i64,
}

/// Pagination parameters, 1-based
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: i64,
    pub page_size: i64,
}

pub const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 200;

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    DEFAULT_PAGE_SIZE
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl PageRequest {
    pub fn new(page: i64, page_size: i64) -> Self {
        Self { page, page_size }
    }

    /// (limit, offset) with out-of-range values clamped
    pub fn limit_offset(&self) -> (i64, i64) {
        let size = if self.page_size <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size.min(MAX_PAGE_SIZE)
        };
        let page = self.page.max(1);
        (size, (page - 1).saturating_mul(size))
    }
}

/// Create folder request
#[derive(Debug, Deserialize)]
pub struct CreateFolderRequest {
    #[serde(default = "root_id")]
    pub parent_id: String,
    pub name: String,
}

/// Attach an existing blob to the caller's tree
#[derive(Debug, Deserialize)]
pub struct AttachFileRequest {
    #[serde(default = "root_id")]
    pub parent_id: String,
    pub blob_id: String,
    pub name: String,
    #[serde(default)]
    pub ext: String,
}

/// Rename request
#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

/// Move request
#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub parent_id: String,
}

/// List query parameters
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "root_id")]
    pub parent_id: String,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

/// Search query parameters
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub keyword: String,
    pub ext: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

pub(crate) fn root_id() -> String {
    ROOT_ID.to_string()
}
