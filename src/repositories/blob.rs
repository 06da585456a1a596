use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use uuid::Uuid;

/// Filesystem storage for uploaded blobs, one directory per session.
#[derive(Clone, Debug)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Creates a new `BlobStore` rooted at `root`. Nothing is created on disk yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding blobs for `session_id`, created on demand.
    ///
    /// Session ids are server-issued UUIDs; anything else is refused so the id
    /// can never escape the root.
    pub async fn location_for(&self, session_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.dir_for(session_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Creates an empty blob file for a new upload.
    ///
    /// The on-disk name is random; only the (already validated) extension of the
    /// client's filename is kept. The blob is deleted when the returned guard is
    /// dropped, unless it is kept first.
    pub async fn create_blob(
        &self,
        session_id: &str,
        extension: &str,
    ) -> std::io::Result<(PendingBlob, File)> {
        let dir = self.location_for(session_id).await?;
        let path = dir.join(format!("{}.{}", Uuid::new_v4().simple(), extension));
        let file = File::create(&path).await?;
        let pending = PendingBlob {
            store: self.clone(),
            path,
            armed: true,
        };
        Ok((pending, file))
    }

    /// Opens a blob for streaming, returning its current length.
    pub async fn open(&self, path: &Path) -> std::io::Result<(File, u64)> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Deletes a blob. Failures are logged and swallowed.
    pub async fn delete(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!("🗑️ Blob deleted: {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("⚠️ Failed to delete blob {}: {}", path.display(), e),
        }
    }

    /// Removes a purged session's directory and anything left in it. Best effort.
    pub async fn remove_location(&self, session_id: &str) {
        let Ok(dir) = self.dir_for(session_id) else {
            return;
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => tracing::debug!("🗑️ Session directory removed: {}", session_id),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "⚠️ Failed to remove session directory {}: {}",
                session_id,
                e
            ),
        }
    }

    fn dir_for(&self, session_id: &str) -> std::io::Result<PathBuf> {
        let id = Uuid::parse_str(session_id).map_err(|_| {
            std::io::Error::new(ErrorKind::InvalidInput, "session id is not a UUID")
        })?;
        Ok(self.root.join(id.to_string()))
    }
}

/// A blob that is not yet owned by a session.
///
/// Dropping it deletes the file. An upload whose request future is dropped
/// mid-body therefore leaves nothing behind.
#[derive(Debug)]
pub struct PendingBlob {
    store: BlobStore,
    path: PathBuf,
    armed: bool,
}

impl PendingBlob {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hands the blob over to its new owner. Nothing is deleted.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }

    /// Deletes the blob now, before returning.
    pub async fn discard(mut self) {
        self.store.delete(&self.path).await;
        self.armed = false;
    }
}

impl Drop for PendingBlob {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        tracing::debug!("🧹 Abandoned upload, deleting {}", path.display());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move { store.delete(&path).await });
            }
            Err(_) => {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn temp_store() -> BlobStore {
        BlobStore::new(std::env::temp_dir().join(format!("sendo_blob_{}", Uuid::new_v4())))
    }

    #[tokio::test]
    async fn sessions_get_isolated_directories() {
        let store = temp_store();
        let a = store.location_for(&Uuid::new_v4().to_string()).await.unwrap();
        let b = store.location_for(&Uuid::new_v4().to_string()).await.unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(store.root()));
        assert!(a.is_dir());
        let _ = tokio::fs::remove_dir_all(store.root()).await;
    }

    #[tokio::test]
    async fn rejects_ids_that_are_not_uuids() {
        let store = temp_store();
        let err = store.location_for("../../etc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn blob_lifecycle() {
        let store = temp_store();
        let id = Uuid::new_v4().to_string();

        let (pending, mut file) = store.create_blob(&id, "epub").await.unwrap();
        file.write_all(b"hello").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        let path = pending.keep();

        assert_eq!(path.extension().unwrap(), "epub");
        let (_, len) = store.open(&path).await.unwrap();
        assert_eq!(len, 5);

        store.delete(&path).await;
        assert!(!path.exists());
        // deleting twice is silent
        store.delete(&path).await;

        store.remove_location(&id).await;
        assert!(!store.root().join(&id).exists());
        let _ = tokio::fs::remove_dir_all(store.root()).await;
    }

    async fn wait_until_gone(path: &Path) -> bool {
        for _ in 0..50 {
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn dropped_pending_blob_is_deleted() {
        let store = temp_store();
        let id = Uuid::new_v4().to_string();

        let (pending, mut file) = store.create_blob(&id, "pdf").await.unwrap();
        file.write_all(b"partial").await.unwrap();
        let path = pending.path().to_path_buf();
        assert!(path.exists());

        drop(pending);
        assert!(wait_until_gone(&path).await);
        let _ = tokio::fs::remove_dir_all(store.root()).await;
    }

    #[tokio::test]
    async fn kept_blob_survives_and_discard_is_immediate() {
        let store = temp_store();
        let id = Uuid::new_v4().to_string();

        let (kept, _) = store.create_blob(&id, "pdf").await.unwrap();
        let kept = kept.keep();
        let (discarded, _) = store.create_blob(&id, "pdf").await.unwrap();
        let discarded_path = discarded.path().to_path_buf();
        discarded.discard().await;

        assert!(!discarded_path.exists());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(kept.exists());
        let _ = tokio::fs::remove_dir_all(store.root()).await;
    }
}
