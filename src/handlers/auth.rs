use axum::{extract::State, Extension, Json};

use crate::error::{ApiResponse, Result};
use crate::models::{CurrentUser, SendCodeRequest, VerifyCodeRequest};
use crate::services::MailCodeService;
use crate::AppState;

/// Revoke the token used for this request
/// POST /api/v1/auth/logout
pub async fn logout(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<()>>> {
    state.identity.revoke(&current_user.token).await?;
    Ok(Json(ApiResponse::<()>::success_message("Logged out successfully")))
}

/// Send an email verification code
/// POST /api/v1/mail/code
pub async fn send_code(
    State(state): State<AppState>,
    Json(req): Json<SendCodeRequest>,
) -> Result<Json<ApiResponse<()>>> {
    MailCodeService::send_code(
        &state.db,
        state.notifier.as_ref(),
        &req.email,
        state.config.mail.code_expire_seconds,
    )
    .await?;
    Ok(Json(ApiResponse::<()>::success_message("Verification code sent")))
}

/// Check and consume a verification code
/// POST /api/v1/mail/code/verify
pub async fn verify_code(
    State(state): State<AppState>,
    Json(req): Json<VerifyCodeRequest>,
) -> Result<Json<ApiResponse<()>>> {
    MailCodeService::verify_code(&state.db, &req.email, &req.code).await?;
    Ok(Json(ApiResponse::<()>::success_message("Email verified")))
}
