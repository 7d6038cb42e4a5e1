//! Base image resolution.
//!
//! [`ImagePuller`] is cache-first: the local [`ImageStore`] is consulted
//! before the registry, and pulled images are stored for the next build.
//! [`StoreSource`] resolves from the store only, for offline builds.

use std::sync::Arc;

use async_trait::async_trait;
use stratum_core::error::{Result, StratumError};

use super::image::OciImage;
use super::reference::ImageReference;
use super::registry::{RegistryAuth, RegistryPuller};
use super::store::{ImageOrigin, ImageStore};

/// Resolves a base image reference to an image on disk.
#[async_trait]
pub trait BaseImageSource: Send + Sync {
    async fn resolve(&self, reference: &ImageReference) -> Result<OciImage>;
}

/// Store-first, registry-second image resolution.
pub struct ImagePuller {
    store: Arc<ImageStore>,
    puller: RegistryPuller,
}

impl ImagePuller {
    pub fn new(store: Arc<ImageStore>, auth: RegistryAuth) -> Self {
        Self {
            store,
            puller: RegistryPuller::with_auth(auth),
        }
    }

    /// Pull an image, using the local store if it has it.
    pub async fn pull(&self, reference: &str) -> Result<OciImage> {
        let parsed = ImageReference::parse(reference)?;
        self.resolve(&parsed).await
    }

    /// Pull from the registry even if the store has the image.
    pub async fn force_pull(&self, reference: &str) -> Result<OciImage> {
        let parsed = ImageReference::parse(reference)?;
        self.pull_and_store(&parsed).await
    }

    pub async fn is_cached(&self, reference: &str) -> bool {
        match ImageReference::parse(reference) {
            Ok(parsed) => self.store.get(&parsed.full_reference()).await.is_some(),
            Err(_) => false,
        }
    }

    async fn pull_and_store(&self, reference: &ImageReference) -> Result<OciImage> {
        let full_ref = reference.full_reference();
        let tmp_dir = self.store.store_dir().join("tmp").join(
            full_ref.replace(['/', ':', '@'], "_"),
        );
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir)?;
        }

        let pulled = self.puller.pull(reference, &tmp_dir).await;
        let stored = match pulled {
            Ok(digest) => {
                self.store
                    .put(&full_ref, &digest, &tmp_dir, ImageOrigin::Pulled)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = std::fs::remove_dir_all(&tmp_dir) {
            tracing::debug!(path = %tmp_dir.display(), error = %e, "Failed to clean pull directory");
        }
        let stored = stored?;

        let evicted = self.store.evict().await?;
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), references = ?evicted, "Evicted images from store");
        }

        OciImage::from_path(&stored.path)
    }
}

#[async_trait]
impl BaseImageSource for ImagePuller {
    async fn resolve(&self, reference: &ImageReference) -> Result<OciImage> {
        let full_ref = reference.full_reference();
        if let Some(stored) = self.store.get(&full_ref).await {
            tracing::info!(reference = %full_ref, digest = %stored.digest, "Using stored image");
            return OciImage::from_path(&stored.path);
        }
        self.pull_and_store(reference).await
    }
}

/// Resolves images from the local store only.
pub struct StoreSource {
    store: Arc<ImageStore>,
}

impl StoreSource {
    pub fn new(store: Arc<ImageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BaseImageSource for StoreSource {
    async fn resolve(&self, reference: &ImageReference) -> Result<OciImage> {
        let full_ref = reference.full_reference();
        match self.store.get(&full_ref).await {
            Some(stored) => OciImage::from_path(&stored.path),
            None => Err(StratumError::ImageNotFound {
                reference: full_ref,
                message: "not in the local image store (offline)".to_string(),
            }),
        }
    }
}
