use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use krishi_db::DomainError;
use krishi_types::models::StoredMedia;

/// Content types accepted for uploaded images, with their file extension.
const IMAGE_TYPES: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/webp", "webp"),
];

pub fn image_extension(content_type: &str) -> Option<&'static str> {
    IMAGE_TYPES
        .iter()
        .find(|(mime, _)| *mime == content_type)
        .map(|(_, ext)| *ext)
}

/// Stores uploaded media and hands back a public url plus the id needed to
/// delete it later.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, folder: &str, extension: &str, bytes: &[u8]) -> Result<StoredMedia, DomainError>;

    async fn delete(&self, public_id: &str) -> Result<(), DomainError>;
}

/// Blob store backed by a local directory served under `public_url`.
pub struct LocalBlobStore {
    root: PathBuf,
    public_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn resolve(&self, public_id: &str) -> Result<PathBuf, DomainError> {
        let relative = Path::new(public_id);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(DomainError::bad_request("Invalid media id"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, folder: &str, extension: &str, bytes: &[u8]) -> Result<StoredMedia, DomainError> {
        let public_id = format!("{}/{}.{}", folder, Uuid::new_v4(), extension);
        let path = self.resolve(&public_id)?;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                error!("Failed to create upload directory {}: {}", dir.display(), e);
                DomainError::Internal(e.into())
            })?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            error!("Failed to write {}: {}", path.display(), e);
            DomainError::Internal(e.into())
        })?;

        debug!("Stored {} bytes as {}", bytes.len(), public_id);
        Ok(StoredMedia {
            url: format!("{}/{}", self.public_url, public_id),
            public_id,
        })
    }

    async fn delete(&self, public_id: &str) -> Result<(), DomainError> {
        let path = self.resolve(public_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DomainError::Internal(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (LocalBlobStore, PathBuf) {
        let root = std::env::temp_dir().join(format!("krishi-blobs-{}", Uuid::new_v4()));
        (LocalBlobStore::new(&root, "/uploads/"), root)
    }

    #[tokio::test]
    async fn put_then_delete() {
        let (blobs, root) = store();
        let media = blobs.put("avatars", "png", b"not really a png").await.unwrap();

        assert!(media.public_id.starts_with("avatars/"));
        assert_eq!(media.url, format!("/uploads/{}", media.public_id));
        assert!(root.join(&media.public_id).exists());

        blobs.delete(&media.public_id).await.unwrap();
        assert!(!root.join(&media.public_id).exists());
        // already gone
        blobs.delete(&media.public_id).await.unwrap();

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn traversal_ids_are_rejected() {
        let (blobs, _root) = store();
        assert!(blobs.delete("../etc/passwd").await.is_err());
        assert!(blobs.delete("/etc/passwd").await.is_err());
    }

    #[test]
    fn only_known_image_types_have_extensions() {
        assert_eq!(image_extension("image/png"), Some("png"));
        assert_eq!(image_extension("application/pdf"), None);
    }
}
