use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{BlobEntry, NewBlob, Resolution};

const HASH_LEN: usize = 64;

/// Content-addressed blob pool and dedup resolver
pub struct BlobService;

impl BlobService {
    /// SHA-256 of the full body, lowercase hex
    pub fn hash_bytes(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    pub fn is_valid_hash(hash: &str) -> bool {
        hash.len() == HASH_LEN
            && hash
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }

    /// Look up a live blob by content hash. Read errors propagate; they are
    /// never reported as a miss.
    pub async fn resolve(db: &Database, content_hash: &str) -> Result<Resolution> {
        let blob: Option<BlobEntry> = sqlx::query_as(
            "SELECT * FROM blob_pool WHERE content_hash = ? AND deleted_at IS NULL",
        )
        .bind(content_hash)
        .fetch_optional(db.pool())
        .await?;

        Ok(match blob {
            Some(blob) => Resolution::Hit(blob),
            None => Resolution::Miss,
        })
    }

    pub async fn get(db: &Database, blob_id: &str) -> Result<BlobEntry> {
        sqlx::query_as("SELECT * FROM blob_pool WHERE id = ? AND deleted_at IS NULL")
            .bind(blob_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("Blob not found".to_string()))
    }

    /// Insert a blob unless a live one with the same hash exists. Returns the
    /// winning row and whether this call created it.
    pub async fn insert_or_get(db: &Database, blob: NewBlob) -> Result<(BlobEntry, bool)> {
        let id = Uuid::new_v4().to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO blob_pool (id, content_hash, name, ext, size, storage_key, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(content_hash) WHERE deleted_at IS NULL DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&blob.content_hash)
        .bind(&blob.name)
        .bind(&blob.ext)
        .bind(blob.size)
        .bind(&blob.storage_key)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await;

        let created = match result {
            Ok(done) => done.rows_affected() == 1,
            Err(e) => {
                let err = AppError::from(e);
                if !err.is_unique_violation() {
                    return Err(err);
                }
                false
            }
        };

        match Self::resolve(db, &blob.content_hash).await? {
            Resolution::Hit(winner) => {
                if created {
                    tracing::info!(hash = %winner.content_hash, blob_id = %winner.id, size = winner.size, "Blob added to pool");
                } else {
                    tracing::debug!(hash = %winner.content_hash, blob_id = %winner.id, "Blob already pooled");
                }
                Ok((winner, created))
            }
            Resolution::Miss => Err(AppError::Internal(format!(
                "Blob {} vanished after insert",
                blob.content_hash
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;

    fn new_blob(hash: &str, key: &str) -> NewBlob {
        NewBlob {
            content_hash: hash.to_string(),
            name: "a.txt".to_string(),
            ext: "txt".to_string(),
            size: 40,
            storage_key: key.to_string(),
        }
    }

    #[test]
    fn test_hash_shape() {
        let hash = BlobService::hash_bytes(b"hello");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(BlobService::is_valid_hash(&hash));
        assert!(!BlobService::is_valid_hash(&hash.to_uppercase()));
        assert!(!BlobService::is_valid_hash("abc"));
    }

    #[tokio::test]
    async fn test_insert_or_get_keeps_one_row_per_hash() {
        let (db, _dir) = test_database().await;
        let hash = BlobService::hash_bytes(b"content");

        assert!(matches!(
            BlobService::resolve(&db, &hash).await.unwrap(),
            Resolution::Miss
        ));

        let (first, created) = BlobService::insert_or_get(&db, new_blob(&hash, "objects/one"))
            .await
            .unwrap();
        assert!(created);

        let (second, created) = BlobService::insert_or_get(&db, new_blob(&hash, "objects/two"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.storage_key, "objects/one");

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blob_pool WHERE content_hash = ?")
            .bind(&hash)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 1);

        match BlobService::resolve(&db, &hash).await.unwrap() {
            Resolution::Hit(blob) => assert_eq!(blob.id, first.id),
            Resolution::Miss => panic!("expected hit"),
        }
    }
}
