use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::models::CurrentUser;
use crate::services::QuotaLedger;
use crate::AppState;

/// Authentication middleware
/// Verifies the bearer token and makes sure the caller has a quota account
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    let token = match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) if !token.trim().is_empty() => token.trim().to_string(),
        _ => {
            return Err(AppError::Unauthorized(
                "Missing or invalid Authorization header".to_string(),
            ));
        }
    };

    let user_id = state.identity.verify(&token).await?;

    QuotaLedger::open_account(&state.db, &user_id, state.config.quota.default_total_bytes).await?;

    request.extensions_mut().insert(CurrentUser { id: user_id, token });

    Ok(next.run(request).await)
}
