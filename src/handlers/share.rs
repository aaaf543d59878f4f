use axum::{
    extract::{Path, State},
    Extension, Json,
};
use std::time::Duration;

use crate::error::{ApiResponse, Result};
use crate::models::{
    CreateShareRequest, CurrentUser, SaveShareRequest, ShareDetail, ShareLink, TreeEntry,
};
use crate::services::ShareService;
use crate::AppState;

/// Create a share link
/// POST /api/v1/shares
pub async fn create_share(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<CreateShareRequest>,
) -> Result<Json<ApiResponse<ShareLink>>> {
    let share = ShareService::create(
        &state.db,
        &current_user.id,
        &req.entry_id,
        req.expires_in_seconds,
        state.config.share.default_expire_seconds,
    )
    .await?;
    Ok(Json(ApiResponse::success(share)))
}

/// Public share info (no auth)
/// GET /api/v1/shares/:id
pub async fn get_public_share(
    State(state): State<AppState>,
    Path(share_id): Path<String>,
) -> Result<Json<ApiResponse<ShareDetail>>> {
    let detail = ShareService::detail(
        &state.db,
        state.store.as_ref(),
        Duration::from_secs(state.config.storage.presign_ttl_seconds),
        &share_id,
    )
    .await?;
    Ok(Json(ApiResponse::success(detail)))
}

/// Save a shared file into the caller's tree
/// POST /api/v1/shares/:id/save
pub async fn save_share(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Path(share_id): Path<String>,
    Json(req): Json<SaveShareRequest>,
) -> Result<Json<ApiResponse<TreeEntry>>> {
    let entry = ShareService::save(&state.db, &current_user.id, &share_id, &req.parent_id).await?;
    Ok(Json(ApiResponse::success(entry)))
}
