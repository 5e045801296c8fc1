//! Object storage capability boundary.
//!
//! Two interchangeable backends satisfy the same contract: [`S3Storage`] for
//! any S3-compatible store (R2, MinIO, AWS) and [`LocalStorage`] for demo
//! and test deployments. Backend selection happens in [`from_config`].

use async_trait::async_trait;
use chrono::Utc;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage configuration error: {0}")]
    Config(String),
}

/// Logical path for an uploaded source image. Partitioned by owning entity
/// so that resolution from an image id is deterministic.
fn image_path(image_id: &str, extension: &str) -> String {
    format!("images/{image_id}/original.{extension}")
}

/// Logical path for a per-detection segmentation mask.
fn mask_path(image_id: &str, detection_id: Uuid) -> String {
    let date = Utc::now().format("%Y%m%d");
    format!("masks/{date}/{image_id}/{detection_id}.png")
}

/// Logical path for a per-job visualization overlay.
fn visualization_path(image_id: &str, job_id: Uuid) -> String {
    let date = Utc::now().format("%Y%m%d");
    format!("visualizations/{date}/{image_id}/{job_id}.png")
}

fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Capability boundary for durable artifact bytes.
///
/// References returned by `upload` are retrievable URLs; `download` accepts
/// either such a URL or a bare object key.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Fetch object bytes by reference.
    async fn download(&self, reference: &str) -> Result<Vec<u8>, StorageError>;

    /// Persist bytes under a logical path, returning a retrievable URL.
    async fn upload(
        &self,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError>;

    /// Remove an object by reference.
    async fn delete(&self, reference: &str) -> Result<(), StorageError>;

    /// Resolve an uploaded image id to its downloadable reference. Fails
    /// with [`StorageError::NotFound`] when no such image was uploaded.
    async fn resolve_image_reference(&self, image_id: &str) -> Result<String, StorageError>;

    async fn upload_image(
        &self,
        data: &[u8],
        image_id: &str,
        extension: &str,
    ) -> Result<String, StorageError> {
        self.upload(
            &image_path(image_id, extension),
            data,
            content_type_for(extension),
        )
        .await
    }

    async fn upload_mask(
        &self,
        data: &[u8],
        image_id: &str,
        detection_id: Uuid,
    ) -> Result<String, StorageError> {
        self.upload(&mask_path(image_id, detection_id), data, "image/png")
            .await
    }

    async fn upload_visualization(
        &self,
        data: &[u8],
        image_id: &str,
        job_id: Uuid,
    ) -> Result<String, StorageError> {
        self.upload(&visualization_path(image_id, job_id), data, "image/png")
            .await
    }
}

/// Client for S3-compatible object storage.
pub struct S3Storage {
    bucket: Box<Bucket>,
    /// Base URL under which uploaded keys are publicly reachable
    public_url: String,
}

impl S3Storage {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_url: Option<&str>,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let public_url = public_url
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/{}", endpoint.trim_end_matches('/'), bucket_name));

        Ok(Self { bucket, public_url })
    }

    fn key_from_reference<'a>(&self, reference: &'a str) -> &'a str {
        reference
            .strip_prefix(&self.public_url)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(reference)
    }

    fn reference_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_url, key)
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn download(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let key = self.key_from_reference(reference);
        let response = self.bucket.get_object(key).await?;
        Ok(response.to_vec())
    }

    async fn upload(
        &self,
        path: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<String, StorageError> {
        self.bucket
            .put_object_with_content_type(path, data, content_type)
            .await?;
        Ok(self.reference_for(path))
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        let key = self.key_from_reference(reference);
        self.bucket.delete_object(key).await?;
        Ok(())
    }

    async fn resolve_image_reference(&self, image_id: &str) -> Result<String, StorageError> {
        let prefix = format!("images/{image_id}/");
        let pages = self.bucket.list(prefix, None).await?;
        let key = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| object.key)
            .next()
            .ok_or_else(|| StorageError::NotFound(image_id.to_string()))?;
        Ok(self.reference_for(&key))
    }
}

/// Filesystem-backed storage for demo deployments and tests.
pub struct LocalStorage {
    root: PathBuf,
    base_url: String,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    fn relative_path<'a>(&self, reference: &'a str) -> &'a str {
        reference
            .strip_prefix(&self.base_url)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(reference)
    }

    fn reference_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn download(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.root.join(self.relative_path(reference));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(reference.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn upload(
        &self,
        path: &str,
        data: &[u8],
        _content_type: &str,
    ) -> Result<String, StorageError> {
        let full = self.root.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, data).await?;
        Ok(self.reference_for(path))
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        let path = self.root.join(self.relative_path(reference));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(reference.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn resolve_image_reference(&self, image_id: &str) -> Result<String, StorageError> {
        let dir = self.root.join("images").join(image_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(image_id.to_string()));
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        match entries.next_entry().await? {
            Some(entry) => {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                Ok(self.reference_for(&format!("images/{image_id}/{name}")))
            }
            None => Err(StorageError::NotFound(image_id.to_string())),
        }
    }
}

/// Build the storage backend selected by configuration: S3 when a complete
/// credential set is present, local filesystem otherwise.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn ObjectStorage>, StorageError> {
    if config.has_s3() {
        tracing::info!(
            bucket = config.s3_bucket.as_deref().unwrap_or_default(),
            "using S3 storage backend"
        );
        let storage = S3Storage::new(
            config.s3_bucket.as_deref().unwrap_or_default(),
            config.s3_endpoint.as_deref().unwrap_or_default(),
            config.s3_access_key.as_deref().unwrap_or_default(),
            config.s3_secret_key.as_deref().unwrap_or_default(),
            config.s3_public_url.as_deref(),
        )?;
        Ok(Arc::new(storage))
    } else {
        tracing::info!(
            root = %config.local_storage_dir,
            "S3 not configured, using local storage backend"
        );
        Ok(Arc::new(LocalStorage::new(
            config.local_storage_dir.clone(),
            config.local_storage_url.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path(), "http://localhost:8000/storage");
        (dir, storage)
    }

    #[tokio::test]
    async fn upload_download_roundtrip() {
        let (_dir, storage) = local();

        let reference = storage
            .upload("images/img-1/original.png", b"png bytes", "image/png")
            .await
            .unwrap();
        assert_eq!(
            reference,
            "http://localhost:8000/storage/images/img-1/original.png"
        );

        let bytes = storage.download(&reference).await.unwrap();
        assert_eq!(bytes, b"png bytes");

        // bare path works too
        let bytes = storage.download("images/img-1/original.png").await.unwrap();
        assert_eq!(bytes, b"png bytes");
    }

    #[tokio::test]
    async fn download_missing_object_is_not_found() {
        let (_dir, storage) = local();
        let err = storage.download("images/nope/original.png").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn resolve_image_reference_finds_uploaded_image() {
        let (_dir, storage) = local();

        storage
            .upload_image(b"jpeg bytes", "img-42", "jpg")
            .await
            .unwrap();

        let reference = storage.resolve_image_reference("img-42").await.unwrap();
        assert!(reference.ends_with("images/img-42/original.jpg"));
        assert_eq!(storage.download(&reference).await.unwrap(), b"jpeg bytes");
    }

    #[tokio::test]
    async fn resolve_unknown_image_is_not_found() {
        let (_dir, storage) = local();
        let err = storage.resolve_image_reference("ghost").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn artifact_paths_are_deterministic_and_scoped() {
        let (_dir, storage) = local();
        let detection_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();

        let mask_ref = storage
            .upload_mask(b"mask", "img-1", detection_id)
            .await
            .unwrap();
        let vis_ref = storage
            .upload_visualization(b"vis", "img-1", job_id)
            .await
            .unwrap();

        assert!(mask_ref.contains("masks/"));
        assert!(mask_ref.contains("/img-1/"));
        assert!(mask_ref.ends_with(&format!("{detection_id}.png")));
        assert!(vis_ref.contains("visualizations/"));
        assert!(vis_ref.ends_with(&format!("{job_id}.png")));

        // same logical artifact maps to the same path on re-upload
        let again = storage
            .upload_mask(b"mask2", "img-1", detection_id)
            .await
            .unwrap();
        assert_eq!(mask_ref, again);
    }

    #[tokio::test]
    async fn delete_removes_object() {
        let (_dir, storage) = local();
        let reference = storage
            .upload("images/img-9/original.png", b"data", "image/png")
            .await
            .unwrap();

        storage.delete(&reference).await.unwrap();
        assert!(matches!(
            storage.download(&reference).await.unwrap_err(),
            StorageError::NotFound(_)
        ));
        assert!(matches!(
            storage.delete(&reference).await.unwrap_err(),
            StorageError::NotFound(_)
        ));
    }
}
