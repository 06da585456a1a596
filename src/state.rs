use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::repositories::{blob::BlobStore, session::SessionStore};

/// Caps the number of uploads and downloads touching the disk at once.
#[derive(Clone)]
pub struct TransferLimiter {
    semaphore: Arc<Semaphore>,
    slots: usize,
}

impl TransferLimiter {
    /// Creates a new `TransferLimiter` with `slots` concurrent transfers.
    pub fn new(slots: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(slots)),
            slots,
        }
    }

    /// Waits for a slot. The permit is owned so it can travel with a response body.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Internal("Transfer limiter closed".to_string()))
    }

    /// Returns the number of available permits.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Returns the number of transfers currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.slots.saturating_sub(self.available_permits())
    }
}

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The application's configuration.
    pub config: Arc<Config>,
    /// The session registry.
    pub sessions: SessionStore,
    /// Blob storage for uploaded files.
    pub blobs: BlobStore,
    /// Concurrency cap for disk transfers.
    pub transfers: TransferLimiter,
}

impl AppState {
    /// Creates a new `AppState` with an empty session registry.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    pub fn new(config: Config) -> Self {
        let blobs = BlobStore::new(config.upload_dir.clone());
        tracing::info!("✅ Blob store rooted at {}", blobs.root().display());

        let transfers = TransferLimiter::new(config.max_concurrent_transfers);
        tracing::info!(
            "✅ Transfer limiter initialized ({} slots)",
            config.max_concurrent_transfers
        );

        Self {
            config: Arc::new(config),
            sessions: SessionStore::new(),
            blobs,
            transfers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn limiter_tracks_in_flight_transfers() {
        let limiter = TransferLimiter::new(2);
        let first = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 1);
        let _second = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available_permits(), 0);
        drop(first);
        assert_eq!(limiter.in_flight(), 1);
    }
}
