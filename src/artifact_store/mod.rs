//! Content-addressed artifact storage: typed buckets, SHA-256 integrity,
//! opaque ids. The only implementation shipped is [`LocalArtifactStore`], a
//! filesystem-backed store — the `signed_url` contract is optional and this
//! implementation always returns `None`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// The disjoint namespaces artifacts live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Raw,
    Annotated,
    Reports,
    Manifests,
}

impl Bucket {
    fn tag(&self) -> &'static str {
        match self {
            Bucket::Raw => "raw",
            Bucket::Annotated => "annotated",
            Bucket::Reports => "reports",
            Bucket::Manifests => "manifests",
        }
    }
}

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("stored content failed integrity check for {0}")]
    IntegrityMismatch(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Content-addressed blob store. Implementations must be safe under
/// concurrent `put`/`get`/`delete` — it is the one genuinely shared mutable
/// resource in the system.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(
        &self,
        bucket: Bucket,
        bytes: Vec<u8>,
        extension: &str,
    ) -> Result<String, ArtifactStoreError>;

    async fn get(&self, artifact_id: &str) -> Result<Vec<u8>, ArtifactStoreError>;

    async fn delete(&self, artifact_id: &str) -> Result<bool, ArtifactStoreError>;

    /// Optional self-contained signed URL. Returning `None` is a valid
    /// implementation.
    fn signed_url(&self, artifact_id: &str, ttl: Duration) -> Option<String>;
}

/// Filesystem-backed artifact store: one directory per bucket, ids of the
/// form `file-<bucket>-<12 hex>-<unix-ts>` — this exact format is this
/// implementation's own scheme, not a contract other code may parse.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: Bucket) -> PathBuf {
        self.root.join(bucket.tag())
    }

    /// Every id is globally unique and carries its own bucket tag, so `get`
    /// can search across bucket directories without an index.
    fn parse_bucket(artifact_id: &str) -> Option<Bucket> {
        let tag = artifact_id.strip_prefix("file-")?.split('-').next()?;
        match tag {
            "raw" => Some(Bucket::Raw),
            "annotated" => Some(Bucket::Annotated),
            "reports" => Some(Bucket::Reports),
            "manifests" => Some(Bucket::Manifests),
            _ => None,
        }
    }

    fn file_path(&self, bucket: Bucket, artifact_id: &str, extension: &str) -> PathBuf {
        self.bucket_dir(bucket).join(format!("{artifact_id}.{extension}"))
    }

    fn find_existing(&self, artifact_id: &str) -> Option<(Bucket, PathBuf)> {
        let bucket = Self::parse_bucket(artifact_id)?;
        let dir = self.bucket_dir(bucket);
        let entries = std::fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s == artifact_id)
                .unwrap_or(false)
            {
                return Some((bucket, path));
            }
        }
        None
    }
}

fn sidecar_digest_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".sha256");
    PathBuf::from(p)
}

#[async_trait::async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(
        &self,
        bucket: Bucket,
        bytes: Vec<u8>,
        extension: &str,
    ) -> Result<String, ArtifactStoreError> {
        let dir = self.bucket_dir(bucket);
        tokio::fs::create_dir_all(&dir).await?;

        let digest = hex::encode(Sha256::digest(&bytes));
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let artifact_id = format!(
            "file-{}-{}-{}",
            bucket.tag(),
            &unique[..12],
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );

        let path = self.file_path(bucket, &artifact_id, extension);
        tokio::fs::write(&path, &bytes).await?;
        tokio::fs::write(sidecar_digest_path(&path), digest).await?;

        Ok(artifact_id)
    }

    async fn get(&self, artifact_id: &str) -> Result<Vec<u8>, ArtifactStoreError> {
        let (_, path) = self
            .find_existing(artifact_id)
            .ok_or_else(|| ArtifactStoreError::NotFound(artifact_id.to_string()))?;
        let bytes = tokio::fs::read(&path).await?;

        let digest_path = sidecar_digest_path(&path);
        if let Ok(expected) = tokio::fs::read_to_string(&digest_path).await {
            let actual = hex::encode(Sha256::digest(&bytes));
            if actual != expected.trim() {
                return Err(ArtifactStoreError::IntegrityMismatch(artifact_id.to_string()));
            }
        }

        Ok(bytes)
    }

    async fn delete(&self, artifact_id: &str) -> Result<bool, ArtifactStoreError> {
        match self.find_existing(artifact_id) {
            Some((_, path)) => {
                tokio::fs::remove_file(&path).await?;
                let _ = tokio::fs::remove_file(sidecar_digest_path(&path)).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn signed_url(&self, _artifact_id: &str, _ttl: Duration) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let id = store.put(Bucket::Raw, b"hello".to_vec(), "bin").await.unwrap();
        let bytes = store.get(&id).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn get_missing_artifact_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let err = store.get("file-raw-deadbeefcafe-1").await.unwrap_err();
        assert!(matches!(err, ArtifactStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_blob_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let id = store.put(Bucket::Reports, b"report".to_vec(), "pdf").await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(store.get(&id).await.is_err());
        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn ids_are_unique_across_many_puts() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path());
        let mut ids = std::collections::HashSet::new();
        for _ in 0..20 {
            let id = store.put(Bucket::Raw, b"x".to_vec(), "bin").await.unwrap();
            assert!(ids.insert(id));
        }
    }

    #[test]
    fn signed_url_is_always_none_for_local_store() {
        let store = LocalArtifactStore::new("/tmp/unused");
        assert!(store.signed_url("file-raw-abc-1", Duration::from_secs(60)).is_none());
    }
}
