use axum::{
    body::Bytes,
    extract::{Multipart, Query, State},
    Extension, Json,
};

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{
    AbortUploadRequest, CompleteUploadRequest, CompleteUploadResponse, CurrentUser,
    PrepareUploadRequest, TreeEntry, UploadPartQuery, UploadPartResponse, UploadPlan, ROOT_ID,
};
use crate::services::UploadService;
use crate::AppState;

struct UploadForm {
    data: Bytes,
    file_name: String,
    parent_id: String,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm> {
    let mut data: Option<Bytes> = None;
    let mut file_name: Option<String> = None;
    let mut parent_id = ROOT_ID.to_string();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        AppError::BadRequest(format!("Failed to process multipart: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                let bytes = field.bytes().await.map_err(|e| {
                    AppError::BadRequest(format!("Failed to read file: {}", e))
                })?;
                data = Some(bytes);
            }
            "parent_id" => {
                let text = field.text().await.map_err(|e| {
                    AppError::BadRequest(format!("Failed to read parent_id: {}", e))
                })?;
                if !text.trim().is_empty() {
                    parent_id = text.trim().to_string();
                }
            }
            _ => {}
        }
    }

    let data = data.ok_or_else(|| AppError::BadRequest("No file provided".to_string()))?;
    let file_name =
        file_name.ok_or_else(|| AppError::BadRequest("No file name provided".to_string()))?;
    Ok(UploadForm {
        data,
        file_name,
        parent_id,
    })
}

/// Single-request upload
/// POST /api/v1/files/upload (multipart form: file, parent_id)
pub async fn upload_file(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    multipart: Multipart,
) -> Result<Json<ApiResponse<TreeEntry>>> {
    let form = read_upload_form(multipart).await?;

    let entry = UploadService::upload_direct(
        &state.db,
        state.store.as_ref(),
        state.config.upload.max_direct_bytes,
        &current_user.id,
        &form.parent_id,
        &form.file_name,
        form.data,
    )
    .await?;
    Ok(Json(ApiResponse::success(entry)))
}

/// Dedup check; opens a multipart session on a miss
/// POST /api/v1/files/upload/prepare
pub async fn prepare_upload(
    State(state): State<AppState>,
    Extension(_current_user): Extension<CurrentUser>,
    Json(req): Json<PrepareUploadRequest>,
) -> Result<Json<ApiResponse<UploadPlan>>> {
    let plan = UploadService::prepare(
        &state.db,
        state.store.as_ref(),
        state.config.upload.chunk_size,
        &req,
    )
    .await?;
    Ok(Json(ApiResponse::success(plan)))
}

/// Relay one part
/// POST /api/v1/files/upload/part?key=..&upload_id=..&part_number=N
pub async fn upload_part(
    State(state): State<AppState>,
    Extension(_current_user): Extension<CurrentUser>,
    Query(query): Query<UploadPartQuery>,
    body: Bytes,
) -> Result<Json<ApiResponse<UploadPartResponse>>> {
    let etag = UploadService::upload_part(
        state.store.as_ref(),
        &query.key,
        &query.upload_id,
        query.part_number,
        body,
    )
    .await?;
    Ok(Json(ApiResponse::success(UploadPartResponse { etag })))
}

/// Finalize a multipart upload into the blob pool
/// POST /api/v1/files/upload/complete
pub async fn complete_upload(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<CompleteUploadRequest>,
) -> Result<Json<ApiResponse<CompleteUploadResponse>>> {
    let upload_id = req.upload_id.clone();
    let blob_id = UploadService::complete(&state.db, state.store.as_ref(), req).await?;
    tracing::debug!(user_id = %current_user.id, blob_id = %blob_id, "Completed upload {}", upload_id);
    Ok(Json(ApiResponse::success(CompleteUploadResponse { blob_id })))
}

/// Abort a multipart upload
/// POST /api/v1/files/upload/abort
pub async fn abort_upload(
    State(state): State<AppState>,
    Extension(_current_user): Extension<CurrentUser>,
    Json(req): Json<AbortUploadRequest>,
) -> Result<Json<ApiResponse<()>>> {
    UploadService::abort(state.store.as_ref(), &req.key, &req.upload_id).await?;
    Ok(Json(ApiResponse::<()>::success_message("Upload aborted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::FromRequest;
    use axum::http::{header, Request};

    const BOUNDARY: &str = "XBOUNDARYX";

    async fn multipart(body: String) -> Multipart {
        let req = Request::builder()
            .method("POST")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(req, &()).await.unwrap()
    }

    fn file_part() -> String {
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\r\nhello\r\n",
            b = BOUNDARY
        )
    }

    #[tokio::test]
    async fn test_upload_form_reads_file_and_parent() {
        let body = format!(
            "{file}--{b}\r\nContent-Disposition: form-data; name=\"parent_id\"\r\n\r\n folder-1 \r\n--{b}--\r\n",
            file = file_part(),
            b = BOUNDARY
        );
        let form = read_upload_form(multipart(body).await).await.unwrap();
        assert_eq!(form.data.as_ref(), b"hello");
        assert_eq!(form.file_name, "a.txt");
        assert_eq!(form.parent_id, "folder-1");
    }

    #[tokio::test]
    async fn test_upload_form_defaults_parent_to_root() {
        let body = format!("{}--{}--\r\n", file_part(), BOUNDARY);
        let form = read_upload_form(multipart(body).await).await.unwrap();
        assert_eq!(form.parent_id, ROOT_ID);
    }

    #[tokio::test]
    async fn test_unreadable_parent_id_is_rejected() {
        // The parent_id field is cut off before its closing boundary
        let body = format!(
            "{file}--{b}\r\nContent-Disposition: form-data; name=\"parent_id\"\r\n\r\nfolder-1",
            file = file_part(),
            b = BOUNDARY
        );
        assert!(matches!(
            read_upload_form(multipart(body).await).await,
            Err(AppError::BadRequest(_))
        ));
    }
}
