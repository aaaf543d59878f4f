use bytes::Bytes;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    CompleteUploadRequest, NewBlob, PartInfo, PrepareUploadRequest, Resolution, TreeEntry,
    UploadPlan,
};
use crate::services::{BlobService, FileService, QuotaLedger};
use crate::storage::ObjectStore;

/// Direct and multipart upload flows feeding the blob pool
pub struct UploadService;

impl UploadService {
    fn validate_hash(content_hash: &str) -> Result<()> {
        if !BlobService::is_valid_hash(content_hash) {
            return Err(AppError::BadRequest(
                "content_hash must be a lowercase hex SHA-256".to_string(),
            ));
        }
        Ok(())
    }

    /// Sort parts by number and require exactly 1..=n
    pub fn ordered_parts(mut parts: Vec<PartInfo>) -> Result<Vec<PartInfo>> {
        if parts.is_empty() {
            return Err(AppError::BadRequest("No parts to complete".to_string()));
        }
        parts.sort_by_key(|p| p.part_number);

        let count = parts.len();
        for (index, part) in parts.iter().enumerate() {
            if part.part_number as usize != index + 1 {
                return Err(AppError::BadRequest(format!(
                    "Part numbers must run from 1 to {} without gaps or duplicates",
                    count
                )));
            }
        }
        Ok(parts)
    }

    /// Dedup lookup before any bytes move. A miss opens a multipart session.
    pub async fn prepare(
        db: &Database,
        store: &dyn ObjectStore,
        chunk_size: u64,
        req: &PrepareUploadRequest,
    ) -> Result<UploadPlan> {
        Self::validate_hash(&req.content_hash)?;
        FileService::validate_name(&req.name)?;

        match BlobService::resolve(db, &req.content_hash).await? {
            Resolution::Hit(blob) => {
                tracing::debug!(hash = %req.content_hash, blob_id = %blob.id, "Prepare hit the pool");
                Ok(UploadPlan::Existing { blob_id: blob.id })
            }
            Resolution::Miss => {
                let ext = FileService::normalize_ext(&req.ext);
                let session = store.initiate_multipart(&ext).await?;
                tracing::debug!(
                    hash = %req.content_hash,
                    key = %session.key,
                    "Prepare opened multipart session {}",
                    session.upload_id
                );
                Ok(UploadPlan::Upload {
                    key: session.key,
                    upload_id: session.upload_id,
                    chunk_size,
                })
            }
        }
    }

    /// Relay one part to the store
    pub async fn upload_part(
        store: &dyn ObjectStore,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        if part_number == 0 {
            return Err(AppError::BadRequest("Part numbers start at 1".to_string()));
        }
        if data.is_empty() {
            return Err(AppError::BadRequest("Empty part".to_string()));
        }
        store.upload_part(key, upload_id, part_number, data).await
    }

    /// Finalize a multipart upload into the pool. Safe to retry: a second
    /// call for the same content returns the blob already recorded.
    pub async fn complete(
        db: &Database,
        store: &dyn ObjectStore,
        req: CompleteUploadRequest,
    ) -> Result<String> {
        Self::validate_hash(&req.content_hash)?;
        let name = FileService::validate_name(&req.name)?.to_string();
        if req.size < 0 {
            return Err(AppError::BadRequest("size must not be negative".to_string()));
        }
        let parts = Self::ordered_parts(req.parts)?;

        let assembled = store
            .complete_multipart(&req.key, &req.upload_id, &parts)
            .await?;
        let size_ok = assembled.size == req.size as u64;
        let hash_ok = assembled.sha256 == req.content_hash;
        if !size_ok || !hash_ok {
            tracing::warn!(
                key = %req.key,
                declared_size = req.size,
                actual_size = assembled.size,
                declared_hash = %req.content_hash,
                actual_hash = %assembled.sha256,
                "Uploaded object does not match its declaration"
            );
            let recorded: Option<(String,)> =
                sqlx::query_as("SELECT id FROM blob_pool WHERE storage_key = ?")
                    .bind(&req.key)
                    .fetch_optional(db.pool())
                    .await?;
            if recorded.is_none() {
                Self::discard(store, &req.key).await;
            }
            let what = if size_ok { "content_hash" } else { "size" };
            return Err(AppError::BadRequest(format!(
                "Declared {} does not match uploaded data",
                what
            )));
        }

        let new_blob = NewBlob {
            content_hash: req.content_hash.clone(),
            name,
            ext: FileService::normalize_ext(&req.ext),
            size: req.size,
            storage_key: req.key.clone(),
        };
        let (blob, created) = match BlobService::insert_or_get(db, new_blob).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    key = %req.key,
                    hash = %req.content_hash,
                    "Orphaned storage object: blob record failed: {}",
                    e
                );
                return Err(e);
            }
        };

        // Lost the race to a concurrent upload of the same content
        if !created && blob.storage_key != req.key {
            tracing::info!(hash = %req.content_hash, winner = %blob.id, "Discarding duplicate upload {}", req.key);
            Self::discard(store, &req.key).await;
        }

        Ok(blob.id)
    }

    pub async fn abort(store: &dyn ObjectStore, key: &str, upload_id: &str) -> Result<()> {
        store.abort_multipart(key, upload_id).await
    }

    /// Single-request upload: hash, dedup, store, then attach to the tree
    pub async fn upload_direct(
        db: &Database,
        store: &dyn ObjectStore,
        max_direct_bytes: u64,
        user_id: &str,
        parent_id: &str,
        file_name: &str,
        data: Bytes,
    ) -> Result<TreeEntry> {
        let name = FileService::validate_name(file_name)?.to_string();
        if data.len() as u64 > max_direct_bytes {
            return Err(AppError::BadRequest(format!(
                "File exceeds the direct upload limit of {} bytes; use multipart upload",
                max_direct_bytes
            )));
        }

        let ext = FileService::ext_from_name(&name);
        let content_hash = BlobService::hash_bytes(&data);
        let size = data.len() as i64;

        let blob_id = match BlobService::resolve(db, &content_hash).await? {
            Resolution::Hit(blob) => blob.id,
            Resolution::Miss => {
                if !QuotaLedger::can_admit(db, user_id, size).await? {
                    return Err(AppError::QuotaExceeded);
                }

                let key = store.put_direct(data, &ext).await?;
                let new_blob = NewBlob {
                    content_hash: content_hash.clone(),
                    name: name.clone(),
                    ext: ext.clone(),
                    size,
                    storage_key: key.clone(),
                };
                match BlobService::insert_or_get(db, new_blob).await {
                    Ok((blob, created)) => {
                        if !created {
                            Self::discard(store, &key).await;
                        }
                        blob.id
                    }
                    Err(e) => {
                        tracing::error!(key = %key, hash = %content_hash, "Orphaned storage object: blob record failed: {}", e);
                        return Err(e);
                    }
                }
            }
        };

        FileService::attach_file(db, user_id, parent_id, &blob_id, &name, &ext).await
    }

    async fn discard(store: &dyn ObjectStore, key: &str) {
        if let Err(e) = store.delete(key).await {
            tracing::error!(key = %key, "Orphaned storage object: {}", e);
        }
    }
}
