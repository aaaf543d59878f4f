use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Extension, Json,
};

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{
    CurrentUser, OrderListQuery, PurchaseCreateRequest, PurchaseCreateResponse,
    PurchaseSyncRequest, PurchaseSyncResponse, QuotaUsage, StorageOrder,
};
use crate::services::{QuotaLedger, StoragePurchaseService};
use crate::AppState;

/// Current quota usage
/// GET /api/v1/quota
pub async fn get_quota(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<QuotaUsage>>> {
    let usage = QuotaLedger::usage(&state.db, &current_user.id).await?;
    Ok(Json(ApiResponse::success(usage)))
}

/// Start a capacity purchase
/// POST /api/v1/storage/purchase
pub async fn create_purchase(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<PurchaseCreateRequest>,
) -> Result<Json<ApiResponse<PurchaseCreateResponse>>> {
    let resp = StoragePurchaseService::create(
        &state.db,
        state.payments.as_ref(),
        &current_user.id,
        req,
    )
    .await?;
    Ok(Json(ApiResponse::success(resp)))
}

/// Pull the checkout state after the user returns from the provider
/// POST /api/v1/storage/purchase/sync
pub async fn sync_purchase(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Json(req): Json<PurchaseSyncRequest>,
) -> Result<Json<ApiResponse<PurchaseSyncResponse>>> {
    let resp = StoragePurchaseService::sync(
        &state.db,
        state.payments.as_ref(),
        &current_user.id,
        &req.session_id,
    )
    .await?;
    Ok(Json(ApiResponse::success(resp)))
}

/// The caller's orders
/// GET /api/v1/storage/orders?status=paid
pub async fn list_orders(
    State(state): State<AppState>,
    Extension(current_user): Extension<CurrentUser>,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<ApiResponse<Vec<StorageOrder>>>> {
    let orders =
        StoragePurchaseService::list_orders(&state.db, &current_user.id, query.status.as_deref())
            .await?;
    Ok(Json(ApiResponse::success(orders)))
}

/// Payment provider callback; authenticated by its signature header
/// POST /api/v1/storage/webhook
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<()>>> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Missing webhook signature".to_string()))?;

    StoragePurchaseService::handle_webhook(&state.db, state.payments.as_ref(), &body, signature)
        .await?;
    Ok(Json(ApiResponse::<()>::success_message("Received")))
}
