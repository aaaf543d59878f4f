use chrono::Utc;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{Page, PageRequest, SearchItem, TreeEntry, TreeListItem, ROOT_ID};
use crate::services::QuotaLedger;
use crate::storage::{ObjectStore, StoredObject};

const MAX_NAME_BYTES: usize = 255;
const ROOT_NAME: &str = "Root";
// Upper bound on ancestor walks; deeper chains mean corrupted links
const MAX_DEPTH: usize = 512;

/// Per-user file tree
pub struct FileService;

impl FileService {
    /// Validate an entry name and return it trimmed
    pub fn validate_name(name: &str) -> Result<&str> {
        let name = name.trim();
        if name.is_empty() || name.contains('/') || name.contains('\\') {
            return Err(AppError::BadRequest("Invalid name".to_string()));
        }
        if name.len() > MAX_NAME_BYTES {
            return Err(AppError::BadRequest("Name is too long".to_string()));
        }
        Ok(name)
    }

    /// Extension without the leading dot, lowercased
    pub fn normalize_ext(ext: &str) -> String {
        ext.trim().trim_start_matches('.').to_lowercase()
    }

    /// Extension taken from a file name ("report.PDF" -> "pdf")
    pub fn ext_from_name(name: &str) -> String {
        match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => Self::normalize_ext(ext),
            _ => String::new(),
        }
    }

    /// Get a live entry owned by `user_id`. Other users' entries are not found.
    pub async fn get_entry(db: &Database, user_id: &str, entry_id: &str) -> Result<TreeEntry> {
        let mut conn = db.pool().acquire().await?;
        Self::get_entry_tx(&mut conn, user_id, entry_id).await
    }

    async fn get_entry_tx(
        conn: &mut SqliteConnection,
        user_id: &str,
        entry_id: &str,
    ) -> Result<TreeEntry> {
        sqlx::query_as(
            "SELECT * FROM user_tree WHERE id = ? AND owner_user_id = ? AND deleted_at IS NULL",
        )
        .bind(entry_id)
        .bind(user_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| AppError::NotFound("File not found".to_string()))
    }

    /// Root is always a valid parent; anything else must be a live folder of
    /// the same user
    async fn ensure_folder(
        conn: &mut SqliteConnection,
        user_id: &str,
        parent_id: &str,
    ) -> Result<()> {
        if parent_id == ROOT_ID {
            return Ok(());
        }
        let folder: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM user_tree WHERE id = ? AND owner_user_id = ? AND blob_ref IS NULL AND deleted_at IS NULL",
        )
        .bind(parent_id)
        .bind(user_id)
        .fetch_optional(conn)
        .await?;

        folder
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound("Parent folder not found".to_string()))
    }

    async fn check_name_exists(
        conn: &mut SqliteConnection,
        user_id: &str,
        parent_id: &str,
        name: &str,
        exclude_id: Option<&str>,
    ) -> Result<()> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM user_tree
            WHERE owner_user_id = ? AND parent_id = ? AND name = ? AND deleted_at IS NULL AND id != ?
            "#,
        )
        .bind(user_id)
        .bind(parent_id)
        .bind(name)
        .bind(exclude_id.unwrap_or(""))
        .fetch_one(conn)
        .await?;

        if count.0 > 0 {
            return Err(AppError::NameConflict(format!(
                "An entry named '{}' already exists here",
                name
            )));
        }
        Ok(())
    }

    fn map_insert_conflict(err: sqlx::Error) -> AppError {
        let err = AppError::from(err);
        if err.is_unique_violation() {
            AppError::NameConflict("An entry with this name already exists here".to_string())
        } else {
            err
        }
    }

    /// Create a folder
    pub async fn create_folder(
        db: &Database,
        user_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<TreeEntry> {
        let name = Self::validate_name(name)?;
        let mut tx = db.pool().begin().await?;
        QuotaLedger::lock_account(tx.as_mut(), user_id).await?;

        Self::ensure_folder(tx.as_mut(), user_id, parent_id).await?;
        Self::check_name_exists(tx.as_mut(), user_id, parent_id, name, None).await?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO user_tree (id, owner_user_id, parent_id, name, ext, blob_ref, created_at, updated_at)
            VALUES (?, ?, ?, ?, '', NULL, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(parent_id)
        .bind(name)
        .bind(&now)
        .bind(&now)
        .execute(tx.as_mut())
        .await
        .map_err(Self::map_insert_conflict)?;

        let entry = Self::get_entry_tx(tx.as_mut(), user_id, &id).await?;
        tx.commit().await?;

        tracing::debug!(user_id = %user_id, folder_id = %id, "Created folder '{}'", name);
        Ok(entry)
    }

    /// Attach a pooled blob to the user's tree, debiting its size in the
    /// same transaction
    pub async fn attach_file(
        db: &Database,
        user_id: &str,
        parent_id: &str,
        blob_id: &str,
        name: &str,
        ext: &str,
    ) -> Result<TreeEntry> {
        let name = Self::validate_name(name)?;
        let ext = Self::normalize_ext(ext);

        let mut tx = db.pool().begin().await?;
        QuotaLedger::lock_account(tx.as_mut(), user_id).await?;

        Self::ensure_folder(tx.as_mut(), user_id, parent_id).await?;

        let size: (i64,) =
            sqlx::query_as("SELECT size FROM blob_pool WHERE id = ? AND deleted_at IS NULL")
                .bind(blob_id)
                .fetch_optional(tx.as_mut())
                .await?
                .ok_or_else(|| AppError::NotFound("Blob not found".to_string()))?;

        let referenced: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM user_tree WHERE owner_user_id = ? AND blob_ref = ? AND deleted_at IS NULL",
        )
        .bind(user_id)
        .bind(blob_id)
        .fetch_optional(tx.as_mut())
        .await?;
        if let Some((existing_id,)) = referenced {
            return Err(AppError::AlreadyExists(format!(
                "This content is already in your drive (entry {})",
                existing_id
            )));
        }

        Self::check_name_exists(tx.as_mut(), user_id, parent_id, name, None).await?;
        QuotaLedger::admit_and_debit(tx.as_mut(), user_id, size.0).await?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO user_tree (id, owner_user_id, parent_id, name, ext, blob_ref, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(parent_id)
        .bind(name)
        .bind(&ext)
        .bind(blob_id)
        .bind(&now)
        .bind(&now)
        .execute(tx.as_mut())
        .await
        .map_err(Self::map_insert_conflict)?;

        let entry = Self::get_entry_tx(tx.as_mut(), user_id, &id).await?;
        tx.commit().await?;

        tracing::info!(user_id = %user_id, blob_id = %blob_id, size = size.0, "Attached file '{}'", name);
        Ok(entry)
    }

    /// Rename an entry in place
    pub async fn rename(db: &Database, user_id: &str, entry_id: &str, new_name: &str) -> Result<TreeEntry> {
        let new_name = Self::validate_name(new_name)?;
        let mut tx = db.pool().begin().await?;
        QuotaLedger::lock_account(tx.as_mut(), user_id).await?;

        let entry = Self::get_entry_tx(tx.as_mut(), user_id, entry_id).await?;
        if entry.name == new_name {
            tx.commit().await?;
            return Ok(entry);
        }
        Self::check_name_exists(tx.as_mut(), user_id, &entry.parent_id, new_name, Some(entry_id)).await?;

        sqlx::query("UPDATE user_tree SET name = ?, updated_at = ? WHERE id = ?")
            .bind(new_name)
            .bind(Utc::now().to_rfc3339())
            .bind(entry_id)
            .execute(tx.as_mut())
            .await
            .map_err(Self::map_insert_conflict)?;

        let entry = Self::get_entry_tx(tx.as_mut(), user_id, entry_id).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Move an entry under another folder (or root)
    pub async fn move_entry(
        db: &Database,
        user_id: &str,
        entry_id: &str,
        new_parent_id: &str,
    ) -> Result<TreeEntry> {
        let mut tx = db.pool().begin().await?;
        QuotaLedger::lock_account(tx.as_mut(), user_id).await?;

        let entry = Self::get_entry_tx(tx.as_mut(), user_id, entry_id).await?;
        if entry.parent_id == new_parent_id {
            tx.commit().await?;
            return Ok(entry);
        }

        Self::ensure_folder(tx.as_mut(), user_id, new_parent_id).await?;

        // A folder may not end up inside its own subtree
        if entry.is_folder() {
            let mut current = new_parent_id.to_string();
            let mut depth = 0;
            while current != ROOT_ID {
                if current == entry.id {
                    return Err(AppError::BadRequest(
                        "Cannot move a folder into itself or its subfolder".to_string(),
                    ));
                }
                depth += 1;
                if depth > MAX_DEPTH {
                    return Err(AppError::Internal("Folder chain too deep".to_string()));
                }
                let parent: Option<(String,)> =
                    sqlx::query_as("SELECT parent_id FROM user_tree WHERE id = ? AND owner_user_id = ?")
                        .bind(&current)
                        .bind(user_id)
                        .fetch_optional(tx.as_mut())
                        .await?;
                match parent {
                    Some((pid,)) => current = pid,
                    None => break,
                }
            }
        }

        Self::check_name_exists(tx.as_mut(), user_id, new_parent_id, &entry.name, Some(entry_id)).await?;

        sqlx::query("UPDATE user_tree SET parent_id = ?, updated_at = ? WHERE id = ?")
            .bind(new_parent_id)
            .bind(Utc::now().to_rfc3339())
            .bind(entry_id)
            .execute(tx.as_mut())
            .await
            .map_err(Self::map_insert_conflict)?;

        let moved = Self::get_entry_tx(tx.as_mut(), user_id, entry_id).await?;
        tx.commit().await?;

        tracing::debug!(user_id = %user_id, entry_id = %entry_id, "Moved entry to {}", new_parent_id);
        Ok(moved)
    }

    /// Soft-delete one entry. A file reference credits its blob size in the
    /// same transaction; a folder removes only its own row, and its children
    /// stay live (reachable by id and search) and stay charged. Blobs stay in
    /// the pool.
    pub async fn delete(db: &Database, user_id: &str, entry_id: &str) -> Result<i64> {
        let mut tx = db.pool().begin().await?;
        QuotaLedger::lock_account(tx.as_mut(), user_id).await?;

        let entry = Self::get_entry_tx(tx.as_mut(), user_id, entry_id).await?;

        let mut freed: i64 = 0;
        if let Some(blob_ref) = &entry.blob_ref {
            let size: Option<(i64,)> = sqlx::query_as("SELECT size FROM blob_pool WHERE id = ?")
                .bind(blob_ref)
                .fetch_optional(tx.as_mut())
                .await?;
            freed = size.map(|s| s.0).unwrap_or(0);
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE user_tree SET deleted_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(entry_id)
            .execute(tx.as_mut())
            .await?;

        if freed > 0 {
            QuotaLedger::credit(tx.as_mut(), user_id, freed).await?;
        }
        tx.commit().await?;

        tracing::info!(user_id = %user_id, entry_id = %entry_id, freed, "Deleted entry");
        Ok(freed)
    }

    /// List one folder level: all folders plus one row per distinct blob,
    /// folders first
    pub async fn list(
        db: &Database,
        user_id: &str,
        parent_id: &str,
        page: PageRequest,
    ) -> Result<Page<TreeListItem>> {
        let mut conn = db.pool().acquire().await?;
        Self::ensure_folder(&mut conn, user_id, parent_id).await?;

        const VISIBLE: &str = r#"
            t.owner_user_id = ?1 AND t.parent_id = ?2 AND t.deleted_at IS NULL
            AND (t.blob_ref IS NULL OR t.rowid IN (
                SELECT MIN(rowid) FROM user_tree
                WHERE owner_user_id = ?1 AND parent_id = ?2 AND deleted_at IS NULL AND blob_ref IS NOT NULL
                GROUP BY blob_ref
            ))
        "#;

        let (limit, offset) = page.limit_offset();
        let list: Vec<TreeListItem> = sqlx::query_as(&format!(
            r#"
            SELECT t.id, t.parent_id, t.name, t.ext, t.blob_ref, b.size, t.created_at
            FROM user_tree t LEFT JOIN blob_pool b ON b.id = t.blob_ref
            WHERE {}
            ORDER BY t.blob_ref IS NOT NULL, t.name ASC
            LIMIT ?3 OFFSET ?4
            "#,
            VISIBLE
        ))
        .bind(user_id)
        .bind(parent_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?;

        let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM user_tree t WHERE {}", VISIBLE))
            .bind(user_id)
            .bind(parent_id)
            .fetch_one(&mut *conn)
            .await?;

        Ok(Page { list, count: count.0 })
    }

    /// Case-insensitive name search across the user's whole tree, newest
    /// first, each hit with its ancestor path
    pub async fn search(
        db: &Database,
        user_id: &str,
        keyword: &str,
        ext: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<SearchItem>> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(AppError::BadRequest("Keyword must not be empty".to_string()));
        }
        let ext = ext.map(Self::normalize_ext).filter(|e| !e.is_empty());

        const MATCHES: &str = r#"
            t.owner_user_id = ?1 AND t.deleted_at IS NULL
            AND instr(lower(t.name), lower(?2)) > 0
            AND (?3 IS NULL OR lower(t.ext) = ?3)
        "#;

        let mut conn = db.pool().acquire().await?;
        let (limit, offset) = page.limit_offset();
        let hits: Vec<TreeListItem> = sqlx::query_as(&format!(
            r#"
            SELECT t.id, t.parent_id, t.name, t.ext, t.blob_ref, b.size, t.created_at
            FROM user_tree t LEFT JOIN blob_pool b ON b.id = t.blob_ref
            WHERE {}
            ORDER BY t.created_at DESC, t.rowid DESC
            LIMIT ?4 OFFSET ?5
            "#,
            MATCHES
        ))
        .bind(user_id)
        .bind(keyword)
        .bind(&ext)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await?;

        let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM user_tree t WHERE {}", MATCHES))
            .bind(user_id)
            .bind(keyword)
            .bind(&ext)
            .fetch_one(&mut *conn)
            .await?;

        let mut folders: HashMap<String, (String, String)> = HashMap::new();
        let mut list = Vec::with_capacity(hits.len());
        for entry in hits {
            let parent_path = Self::build_path(&mut conn, user_id, &entry.parent_id, &mut folders).await?;
            list.push(SearchItem { entry, parent_path });
        }

        Ok(Page { list, count: count.0 })
    }

    /// "Root/A/B" for a folder id, walking parent links
    async fn build_path(
        conn: &mut SqliteConnection,
        user_id: &str,
        folder_id: &str,
        cache: &mut HashMap<String, (String, String)>,
    ) -> Result<String> {
        let mut names = Vec::new();
        let mut current = folder_id.to_string();

        while current != ROOT_ID && names.len() < MAX_DEPTH {
            let (name, parent) = match cache.get(&current) {
                Some(hit) => hit.clone(),
                None => {
                    let row: Option<(String, String)> = sqlx::query_as(
                        "SELECT name, parent_id FROM user_tree WHERE id = ? AND owner_user_id = ?",
                    )
                    .bind(&current)
                    .bind(user_id)
                    .fetch_optional(&mut *conn)
                    .await?;
                    match row {
                        Some(row) => {
                            cache.insert(current.clone(), row.clone());
                            row
                        }
                        None => break,
                    }
                }
            };
            names.push(name);
            current = parent;
        }

        names.push(ROOT_NAME.to_string());
        names.reverse();
        Ok(names.join("/"))
    }

    /// Resolve an owned file entry to its object
    pub async fn download(
        db: &Database,
        store: &dyn ObjectStore,
        user_id: &str,
        entry_id: &str,
    ) -> Result<(TreeEntry, StoredObject)> {
        let (entry, storage_key) = Self::file_object(db, user_id, entry_id).await?;
        let object = store.get(&storage_key).await?;
        Ok((entry, object))
    }

    /// Presigned download link for an owned file entry
    pub async fn download_url(
        db: &Database,
        store: &dyn ObjectStore,
        user_id: &str,
        entry_id: &str,
        ttl: Duration,
    ) -> Result<String> {
        let (entry, storage_key) = Self::file_object(db, user_id, entry_id).await?;
        store.presign(&storage_key, ttl, Some(entry.name.as_str())).await
    }

    async fn file_object(db: &Database, user_id: &str, entry_id: &str) -> Result<(TreeEntry, String)> {
        let entry = Self::get_entry(db, user_id, entry_id).await?;
        let blob_ref = entry
            .blob_ref
            .clone()
            .ok_or_else(|| AppError::BadRequest("Folders cannot be downloaded".to_string()))?;

        let key: (String,) = sqlx::query_as("SELECT storage_key FROM blob_pool WHERE id = ?")
            .bind(&blob_ref)
            .fetch_optional(db.pool())
            .await?
            .ok_or_else(|| AppError::NotFound("Blob not found".to_string()))?;
        Ok((entry, key.0))
    }
}
