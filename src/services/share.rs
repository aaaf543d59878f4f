use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{ShareDetail, ShareLink, TreeEntry};
use crate::services::FileService;
use crate::storage::ObjectStore;

pub struct ShareService;

impl ShareService {
    /// Create a public link to one of the owner's files. `None` falls back to
    /// `default_expire`; zero never expires.
    pub async fn create(
        db: &Database,
        owner_id: &str,
        entry_id: &str,
        expires_in_seconds: Option<i64>,
        default_expire: i64,
    ) -> Result<ShareLink> {
        let expires = expires_in_seconds.unwrap_or(default_expire);
        if expires < 0 {
            return Err(AppError::BadRequest("Expiry must not be negative".to_string()));
        }

        let entry = FileService::get_entry(db, owner_id, entry_id).await?;
        let blob_ref = entry
            .blob_ref
            .ok_or_else(|| AppError::BadRequest("Folders cannot be shared".to_string()))?;

        let share_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO share_link (id, owner_user_id, tree_entry_id, blob_ref, expires_in_seconds, click_count, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(&share_id)
        .bind(owner_id)
        .bind(entry_id)
        .bind(&blob_ref)
        .bind(expires)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await?;

        tracing::info!(user_id = %owner_id, share_id = %share_id, "Created share link");
        Self::get_live(db, &share_id).await
    }

    fn expires_at(share: &ShareLink) -> Result<Option<DateTime<Utc>>> {
        if share.expires_in_seconds == 0 {
            return Ok(None);
        }
        let created = DateTime::parse_from_rfc3339(&share.created_at)
            .map_err(|e| AppError::Internal(format!("Bad share timestamp: {}", e)))?
            .with_timezone(&Utc);
        Ok(Some(created + ChronoDuration::seconds(share.expires_in_seconds)))
    }

    /// Share whose file entry is still live and whose link has not expired
    async fn get_live(db: &Database, share_id: &str) -> Result<ShareLink> {
        let share: ShareLink = sqlx::query_as(
            r#"
            SELECT s.* FROM share_link s
            JOIN user_tree t ON t.id = s.tree_entry_id AND t.deleted_at IS NULL
            WHERE s.id = ?
            "#,
        )
        .bind(share_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or_else(|| AppError::NotFound("Share not found".to_string()))?;

        if let Some(expires_at) = Self::expires_at(&share)? {
            if expires_at <= Utc::now() {
                return Err(AppError::NotFound("Share has expired".to_string()));
            }
        }
        Ok(share)
    }

    /// Public view of a share; counts the visit
    pub async fn detail(
        db: &Database,
        store: &dyn ObjectStore,
        ttl: Duration,
        share_id: &str,
    ) -> Result<ShareDetail> {
        let share = Self::get_live(db, share_id).await?;

        sqlx::query("UPDATE share_link SET click_count = click_count + 1 WHERE id = ?")
            .bind(share_id)
            .execute(db.pool())
            .await?;

        let (name, ext, size, storage_key): (String, String, i64, String) = sqlx::query_as(
            r#"
            SELECT t.name, t.ext, b.size, b.storage_key
            FROM user_tree t JOIN blob_pool b ON b.id = ?
            WHERE t.id = ?
            "#,
        )
        .bind(&share.blob_ref)
        .bind(&share.tree_entry_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or_else(|| AppError::NotFound("Shared file not found".to_string()))?;

        let download_url = store.presign(&storage_key, ttl, Some(name.as_str())).await?;
        let expires_at = Self::expires_at(&share)?.map(|t| t.to_rfc3339());

        Ok(ShareDetail {
            share_id: share.id,
            blob_id: share.blob_ref,
            name,
            ext,
            size,
            download_url,
            expires_at,
        })
    }

    /// Save the shared file into the caller's tree under `parent_id`
    pub async fn save(
        db: &Database,
        user_id: &str,
        share_id: &str,
        parent_id: &str,
    ) -> Result<TreeEntry> {
        let share = Self::get_live(db, share_id).await?;

        let (name, ext): (String, String) =
            sqlx::query_as("SELECT name, ext FROM user_tree WHERE id = ?")
                .bind(&share.tree_entry_id)
                .fetch_one(db.pool())
                .await?;

        FileService::attach_file(db, user_id, parent_id, &share.blob_ref, &name, &ext).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewBlob, ROOT_ID};
    use crate::services::{BlobService, QuotaLedger};
    use crate::storage::{LocalObjectStore, UrlSigner};

    struct Fixture {
        db: Database,
        store: LocalObjectStore,
        entry_id: String,
        _dir: tempfile::TempDir,
        _objects: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let (db, dir) = crate::db::test_database().await;
        let objects = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(
            objects.path(),
            UrlSigner::new("secret", "http://localhost:8888"),
        );
        QuotaLedger::open_account(&db, "alice", 1000).await.unwrap();
        QuotaLedger::open_account(&db, "bob", 1000).await.unwrap();

        let key = store
            .put_direct(bytes::Bytes::from_static(b"shared"), "txt")
            .await
            .unwrap();
        let (blob, _) = BlobService::insert_or_get(
            &db,
            NewBlob {
                content_hash: BlobService::hash_bytes(b"shared"),
                name: "report.txt".to_string(),
                ext: "txt".to_string(),
                size: 6,
                storage_key: key,
            },
        )
        .await
        .unwrap();
        let entry = FileService::attach_file(&db, "alice", ROOT_ID, &blob.id, "report.txt", "txt")
            .await
            .unwrap();

        Fixture {
            db,
            store,
            entry_id: entry.id,
            _dir: dir,
            _objects: objects,
        }
    }

    #[tokio::test]
    async fn test_detail_counts_clicks() {
        let f = fixture().await;
        let share = ShareService::create(&f.db, "alice", &f.entry_id, Some(0), 3600)
            .await
            .unwrap();

        let ttl = Duration::from_secs(60);
        let detail = ShareService::detail(&f.db, &f.store, ttl, &share.id).await.unwrap();
        assert_eq!(detail.name, "report.txt");
        assert_eq!(detail.size, 6);
        assert!(detail.expires_at.is_none());
        assert!(detail.download_url.contains("signature="));
        ShareService::detail(&f.db, &f.store, ttl, &share.id).await.unwrap();

        let clicks: (i64,) = sqlx::query_as("SELECT click_count FROM share_link WHERE id = ?")
            .bind(&share.id)
            .fetch_one(f.db.pool())
            .await
            .unwrap();
        assert_eq!(clicks.0, 2);
    }

    #[tokio::test]
    async fn test_create_rules() {
        let f = fixture().await;
        assert!(matches!(
            ShareService::create(&f.db, "alice", &f.entry_id, Some(-1), 3600).await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            ShareService::create(&f.db, "bob", &f.entry_id, None, 3600).await,
            Err(AppError::NotFound(_))
        ));

        let folder = FileService::create_folder(&f.db, "alice", ROOT_ID, "docs")
            .await
            .unwrap();
        assert!(matches!(
            ShareService::create(&f.db, "alice", &folder.id, None, 3600).await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_and_deleted_shares_are_gone() {
        let f = fixture().await;
        let share = ShareService::create(&f.db, "alice", &f.entry_id, Some(60), 3600)
            .await
            .unwrap();

        // Backdate the link past its lifetime
        sqlx::query("UPDATE share_link SET created_at = ? WHERE id = ?")
            .bind((Utc::now() - ChronoDuration::seconds(120)).to_rfc3339())
            .bind(&share.id)
            .execute(f.db.pool())
            .await
            .unwrap();
        assert!(matches!(
            ShareService::detail(&f.db, &f.store, Duration::from_secs(60), &share.id).await,
            Err(AppError::NotFound(_))
        ));

        let forever = ShareService::create(&f.db, "alice", &f.entry_id, Some(0), 3600)
            .await
            .unwrap();
        FileService::delete(&f.db, "alice", &f.entry_id).await.unwrap();
        assert!(matches!(
            ShareService::save(&f.db, "bob", &forever.id, ROOT_ID).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_debits_receiver_once() {
        let f = fixture().await;
        let share = ShareService::create(&f.db, "alice", &f.entry_id, None, 3600)
            .await
            .unwrap();

        let saved = ShareService::save(&f.db, "bob", &share.id, ROOT_ID).await.unwrap();
        assert_eq!(saved.owner_user_id, "bob");
        assert_eq!(saved.name, "report.txt");
        assert_eq!(QuotaLedger::get_account(&f.db, "bob").await.unwrap().used_bytes, 6);

        assert!(matches!(
            ShareService::save(&f.db, "bob", &share.id, ROOT_ID).await,
            Err(AppError::AlreadyExists(_))
        ));
        assert_eq!(QuotaLedger::get_account(&f.db, "bob").await.unwrap().used_bytes, 6);
    }
}
