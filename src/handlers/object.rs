use axum::{
    extract::{Path, Query, State},
    response::Response,
};

use crate::error::Result;
use crate::models::PresignedQuery;
use crate::AppState;

/// Serve a presigned object link (no auth; the signature is the credential)
/// GET /api/v1/objects/*key
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<PresignedQuery>,
) -> Result<Response> {
    state
        .signer
        .verify(&key, query.expires, &query.filename, &query.signature)?;

    let object = state.store.get(&key).await?;
    super::attachment(object, &query.filename)
}
