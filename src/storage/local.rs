use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::PartInfo;
use crate::storage::{AssembledObject, MultipartSession, ObjectStore, StoredObject, UrlSigner};

const OBJECT_PREFIX: &str = "objects";
const STAGING_DIR: &str = ".multipart";
const SESSION_KEY_FILE: &str = "key";
const COPY_BUFFER: usize = 64 * 1024;

/// Local file system object store. Multipart parts are staged under
/// `.multipart/<upload_id>/` until completion.
pub struct LocalObjectStore {
    base_path: PathBuf,
    signer: UrlSigner,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>, signer: UrlSigner) -> Self {
        Self {
            base_path: base_path.into(),
            signer,
        }
    }

    /// Reject anything that could escape the base directory
    fn get_full_path(&self, key: &str) -> Result<PathBuf> {
        let valid = key.starts_with("objects/")
            && key.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
        if !valid {
            return Err(AppError::BadRequest(format!("Invalid object key: {}", key)));
        }
        Ok(self.base_path.join(key))
    }

    fn session_dir(&self, upload_id: &str) -> Result<PathBuf> {
        if upload_id.is_empty()
            || !upload_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(AppError::BadRequest("Invalid upload id".to_string()));
        }
        Ok(self.base_path.join(STAGING_DIR).join(upload_id))
    }

    fn done_marker(&self, upload_id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(upload_id)?;
        Ok(dir.with_extension("done"))
    }

    fn new_key(ext: &str) -> String {
        let ext: String = ext
            .trim_start_matches('.')
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(16)
            .collect();
        if ext.is_empty() {
            format!("{}/{}", OBJECT_PREFIX, Uuid::new_v4())
        } else {
            format!("{}/{}.{}", OBJECT_PREFIX, Uuid::new_v4(), ext.to_lowercase())
        }
    }

    /// Confirm the session exists and was opened for `key`
    async fn check_session(&self, key: &str, upload_id: &str) -> Result<PathBuf> {
        let dir = self.session_dir(upload_id)?;
        let recorded = fs::read_to_string(dir.join(SESSION_KEY_FILE))
            .await
            .map_err(|_| AppError::Storage(format!("Unknown upload session: {}", upload_id)))?;
        if recorded != key {
            return Err(AppError::Storage(format!(
                "Upload session {} does not belong to key {}",
                upload_id, key
            )));
        }
        Ok(dir)
    }

    async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    fn etag(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    /// Size and digest of a stored file, read in fixed-size chunks
    async fn digest_file(path: &Path) -> Result<AssembledObject> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }
        Ok(AssembledObject {
            size,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }

    /// Stream the parts into `out`, checking each part's eTag on the way
    async fn assemble(
        dir: &Path,
        parts: &[PartInfo],
        out: &mut fs::File,
    ) -> Result<AssembledObject> {
        let mut whole = Sha256::new();
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut size = 0u64;

        for part in parts {
            let mut file = fs::File::open(dir.join(part.part_number.to_string()))
                .await
                .map_err(|_| {
                    AppError::Storage(format!("Part {} was never uploaded", part.part_number))
                })?;
            let mut part_hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                part_hasher.update(&buf[..n]);
                whole.update(&buf[..n]);
                out.write_all(&buf[..n]).await?;
                size += n as u64;
            }
            if format!("{:x}", part_hasher.finalize()) != part.etag.trim_matches('"') {
                return Err(AppError::Storage(format!(
                    "ETag mismatch for part {}",
                    part.part_number
                )));
            }
        }
        out.flush().await?;

        Ok(AssembledObject {
            size,
            sha256: format!("{:x}", whole.finalize()),
        })
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_direct(&self, data: Bytes, ext: &str) -> Result<String> {
        let key = Self::new_key(ext);
        let full_path = self.get_full_path(&key)?;
        Self::write_file(&full_path, &data).await?;
        tracing::debug!("Saved object {:?} ({} bytes)", full_path, data.len());
        Ok(key)
    }

    async fn initiate_multipart(&self, ext: &str) -> Result<MultipartSession> {
        let key = Self::new_key(ext);
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.session_dir(&upload_id)?;
        Self::write_file(&dir.join(SESSION_KEY_FILE), key.as_bytes()).await?;
        tracing::debug!("Opened multipart session {} for {}", upload_id, key);
        Ok(MultipartSession { key, upload_id })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        if part_number == 0 {
            return Err(AppError::BadRequest("Part numbers start at 1".to_string()));
        }
        let dir = self.check_session(key, upload_id).await?;
        Self::write_file(&dir.join(part_number.to_string()), &data).await?;
        Ok(Self::etag(&data))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> Result<AssembledObject> {
        let full_path = self.get_full_path(key)?;

        // Replay of a finished session
        let marker = self.done_marker(upload_id)?;
        if let Ok(done_key) = fs::read_to_string(&marker).await {
            if done_key == key && fs::metadata(&full_path).await.is_ok() {
                tracing::debug!("Multipart session {} already completed", upload_id);
                return Self::digest_file(&full_path).await;
            }
            return Err(AppError::Storage(format!(
                "Upload session {} was completed for another key",
                upload_id
            )));
        }

        let dir = self.check_session(key, upload_id).await?;

        // Write beside the target, then rename so readers never see a partial object
        let tmp_path = full_path.with_extension("partial");
        if let Some(parent) = tmp_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut out = fs::File::create(&tmp_path).await?;
        let assembled = match Self::assemble(&dir, parts, &mut out).await {
            Ok(assembled) => assembled,
            Err(e) => {
                drop(out);
                let _ = fs::remove_file(&tmp_path).await;
                return Err(e);
            }
        };
        drop(out);
        fs::rename(&tmp_path, &full_path).await?;

        Self::write_file(&marker, key.as_bytes()).await?;
        fs::remove_dir_all(&dir).await?;

        tracing::debug!(
            "Completed multipart session {} into {} ({} parts, {} bytes)",
            upload_id,
            key,
            parts.len(),
            assembled.size
        );
        Ok(assembled)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let dir = self.check_session(key, upload_id).await?;
        fs::remove_dir_all(&dir).await?;
        tracing::debug!("Aborted multipart session {}", upload_id);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<StoredObject> {
        let full_path = self.get_full_path(key)?;

        let data = fs::read(&full_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("Object not found: {}", key))
            } else {
                AppError::Storage(format!("Failed to read object: {}", e))
            }
        })?;

        let content_type = mime_guess::from_path(&full_path)
            .first_or_octet_stream()
            .to_string();

        Ok(StoredObject {
            size: data.len() as u64,
            data: Bytes::from(data),
            content_type,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.get_full_path(key)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => {
                tracing::debug!("Deleted object {:?}", full_path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn presign(&self, key: &str, ttl: Duration, filename: Option<&str>) -> Result<String> {
        self.get_full_path(key)?;
        self.signer
            .presigned_url(key, ttl.as_secs() as i64, filename)
    }

    fn storage_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (LocalObjectStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), UrlSigner::new("k", "http://localhost"));
        (store, dir)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (store, _dir) = store();
        let key = store.put_direct(Bytes::from_static(b"hello"), ".TXT").await.unwrap();
        assert!(key.starts_with("objects/"));
        assert!(key.ends_with(".txt"));

        let obj = store.get(&key).await.unwrap();
        assert_eq!(obj.data.as_ref(), b"hello");
        assert_eq!(obj.size, 5);
        assert_eq!(obj.content_type, "text/plain");

        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(matches!(store.get(&key).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_multipart_assembles_in_given_order() {
        let (store, _dir) = store();
        let session = store.initiate_multipart("bin").await.unwrap();

        let e2 = store
            .upload_part(&session.key, &session.upload_id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let e1 = store
            .upload_part(&session.key, &session.upload_id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        let parts = vec![
            PartInfo { part_number: 1, etag: e1 },
            PartInfo { part_number: 2, etag: format!("\"{}\"", e2) },
        ];
        let assembled = store
            .complete_multipart(&session.key, &session.upload_id, &parts)
            .await
            .unwrap();
        assert_eq!(assembled.size, 11);
        assert_eq!(assembled.sha256, LocalObjectStore::etag(b"hello world"));

        let obj = store.get(&session.key).await.unwrap();
        assert_eq!(obj.data.as_ref(), b"hello world");

        // Replaying the same completion is accepted
        let replay = store
            .complete_multipart(&session.key, &session.upload_id, &parts)
            .await
            .unwrap();
        assert_eq!(replay, assembled);
    }

    #[tokio::test]
    async fn test_multipart_streams_parts_larger_than_the_copy_buffer() {
        let (store, dir) = store();
        let session = store.initiate_multipart("bin").await.unwrap();

        let first: Vec<u8> = (0..COPY_BUFFER * 2 + 17).map(|i| (i % 251) as u8).collect();
        let second = vec![7u8; COPY_BUFFER + 3];
        let e1 = store
            .upload_part(&session.key, &session.upload_id, 1, Bytes::from(first.clone()))
            .await
            .unwrap();
        let e2 = store
            .upload_part(&session.key, &session.upload_id, 2, Bytes::from(second.clone()))
            .await
            .unwrap();

        let parts = vec![
            PartInfo { part_number: 1, etag: e1 },
            PartInfo { part_number: 2, etag: e2 },
        ];
        let assembled = store
            .complete_multipart(&session.key, &session.upload_id, &parts)
            .await
            .unwrap();

        let mut whole = first;
        whole.extend_from_slice(&second);
        assert_eq!(assembled.size, whole.len() as u64);
        assert_eq!(assembled.sha256, LocalObjectStore::etag(&whole));
        assert_eq!(store.get(&session.key).await.unwrap().data.as_ref(), whole.as_slice());
        assert!(!dir.path().join(STAGING_DIR).join(&session.upload_id).exists());
    }

    #[tokio::test]
    async fn test_multipart_rejects_bad_etag_and_unknown_session() {
        let (store, _dir) = store();
        let session = store.initiate_multipart("").await.unwrap();
        store
            .upload_part(&session.key, &session.upload_id, 1, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let bad = vec![PartInfo { part_number: 1, etag: "deadbeef".to_string() }];
        assert!(matches!(
            store.complete_multipart(&session.key, &session.upload_id, &bad).await,
            Err(AppError::Storage(_))
        ));
        // A failed assembly leaves neither the object nor its temp file behind
        assert!(matches!(store.get(&session.key).await, Err(AppError::NotFound(_))));
        let tmp = store.get_full_path(&session.key).unwrap().with_extension("partial");
        assert!(!tmp.exists());

        let unknown = Uuid::new_v4().to_string();
        assert!(matches!(
            store.upload_part(&session.key, &unknown, 1, Bytes::from_static(b"x")).await,
            Err(AppError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_discards_session() {
        let (store, _dir) = store();
        let session = store.initiate_multipart("txt").await.unwrap();
        store.abort_multipart(&session.key, &session.upload_id).await.unwrap();
        assert!(store
            .upload_part(&session.key, &session.upload_id, 1, Bytes::from_static(b"x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (store, _dir) = store();
        assert!(matches!(
            store.get("objects/../secret").await,
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(store.get("/etc/passwd").await, Err(AppError::BadRequest(_))));
    }
}
