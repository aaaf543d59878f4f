use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use std::time::Duration;

use crate::error::{ApiResponse, Result};
use crate::models::{
    AttachFileRequest, CreateFolderRequest, CurrentUser, ListQuery, MoveRequest, Page,
    PageRequest, RenameRequest, SearchItem, SearchQuery, TreeEntry, TreeListItem,
};
use crate::services::FileService;
use crate::AppState;

#[derive(Serialize)]
pub struct DeleteResponse {
    pub freed_bytes: i64,
}

#[derive(Serialize)]
pub struct DownloadUrlResponse {
    pub url: String,
}

/// List a folder
/// GET /api/v1/files?parent_id=xxx&page=1&page_size=20
pub async fn list_files(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<Page<TreeListItem>>>> {
    let page = FileService::list(
        &state.db,
        &current_user.id,
        &query.parent_id,
        PageRequest::new(query.page, query.page_size),
    )
    .await?;
    Ok(Json(ApiResponse::success(page)))
}

/// Search by name across the caller's tree
/// GET /api/v1/files/search?keyword=xxx&ext=pdf
pub async fn search_files(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<ApiResponse<Page<SearchItem>>>> {
    let page = FileService::search(
        &state.db,
        &current_user.id,
        &query.keyword,
        query.ext.as_deref(),
        PageRequest::new(query.page, query.page_size),
    )
    .await?;
    Ok(Json(ApiResponse::success(page)))
}

/// Get one entry
/// GET /api/v1/files/:id
pub async fn get_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<TreeEntry>>> {
    let entry = FileService::get_entry(&state.db, &current_user.id, &id).await?;
    Ok(Json(ApiResponse::success(entry)))
}

/// Create a folder
/// POST /api/v1/folders
pub async fn create_folder(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<CreateFolderRequest>,
) -> Result<Json<ApiResponse<TreeEntry>>> {
    let entry =
        FileService::create_folder(&state.db, &current_user.id, &req.parent_id, &req.name).await?;
    Ok(Json(ApiResponse::success(entry)))
}

/// Attach a pooled blob (after a prepare hit or a completed upload)
/// POST /api/v1/files/attach
pub async fn attach_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<AttachFileRequest>,
) -> Result<Json<ApiResponse<TreeEntry>>> {
    let ext = if req.ext.is_empty() {
        FileService::ext_from_name(&req.name)
    } else {
        req.ext
    };
    let entry = FileService::attach_file(
        &state.db,
        &current_user.id,
        &req.parent_id,
        &req.blob_id,
        &req.name,
        &ext,
    )
    .await?;
    Ok(Json(ApiResponse::success(entry)))
}

/// Rename an entry
/// PATCH /api/v1/files/:id
pub async fn rename_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<ApiResponse<TreeEntry>>> {
    let entry = FileService::rename(&state.db, &current_user.id, &id, &req.name).await?;
    Ok(Json(ApiResponse::success(entry)))
}

/// Move an entry under another folder
/// PUT /api/v1/files/:id/parent
pub async fn move_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(req): Json<MoveRequest>,
) -> Result<Json<ApiResponse<TreeEntry>>> {
    let entry = FileService::move_entry(&state.db, &current_user.id, &id, &req.parent_id).await?;
    Ok(Json(ApiResponse::success(entry)))
}

/// Delete a file or folder
/// DELETE /api/v1/files/:id
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let freed_bytes = FileService::delete(&state.db, &current_user.id, &id).await?;
    Ok(Json(ApiResponse::success(DeleteResponse { freed_bytes })))
}

/// Download a file
/// GET /api/v1/files/:id/download
pub async fn download_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Response> {
    let (entry, object) =
        FileService::download(&state.db, state.store.as_ref(), &current_user.id, &id).await?;
    super::attachment(object, &entry.name)
}

/// Presigned download link
/// GET /api/v1/files/:id/url
pub async fn download_url(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<DownloadUrlResponse>>> {
    let url = FileService::download_url(
        &state.db,
        state.store.as_ref(),
        &current_user.id,
        &id,
        Duration::from_secs(state.config.storage.presign_ttl_seconds),
    )
    .await?;
    Ok(Json(ApiResponse::success(DownloadUrlResponse { url })))
}
