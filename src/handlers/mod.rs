pub mod auth;
pub mod file;
pub mod object;
pub mod share;
pub mod storage;
pub mod upload;

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};

use crate::error::{AppError, Result};
use crate::storage::StoredObject;

/// Stream an object back as a download named `filename`
pub(crate) fn attachment(object: StoredObject, filename: &str) -> Result<Response> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, object.content_type)
        .header(header::CONTENT_LENGTH, object.size);

    if !filename.is_empty() {
        let fallback_name = filename.replace(['"', '\\'], "_");
        let encoded_name = urlencoding::encode(filename);
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                fallback_name, encoded_name
            ),
        );
    }

    builder
        .body(Body::from(object.data))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}
