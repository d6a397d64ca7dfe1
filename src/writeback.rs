use std::sync::Arc;
use std::time::Duration;

use crate::fetch::FetchedImage;
use crate::store::ObjectStore;

/// Runs after a successful fallback fetch. Invoked in a detached task, so an
/// implementation can never delay or fail the response.
#[async_trait::async_trait]
pub trait WriteBack: Send + Sync {
    async fn write_back(&self, key: &str, image: &FetchedImage);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWriteBack;

#[async_trait::async_trait]
impl WriteBack for NoopWriteBack {
    async fn write_back(&self, _key: &str, _image: &FetchedImage) {}
}

/// Copies fetched images into the primary store so the next request for the
/// same path is served without the fallback.
pub struct StoreWriteBack {
    store: Arc<ObjectStore>,
    cache_control: String,
    expiration: Duration,
}

impl StoreWriteBack {
    pub fn new(store: Arc<ObjectStore>, cache_control: impl Into<String>, expiration: Duration) -> Self {
        Self { store, cache_control: cache_control.into(), expiration }
    }
}

#[async_trait::async_trait]
impl WriteBack for StoreWriteBack {
    async fn write_back(&self, key: &str, image: &FetchedImage) {
        let result = async {
            self.store.put(
                key,
                &image.bytes,
                image.content_type.as_deref(),
                Some(&self.cache_control),
                self.expiration,
            )?;
            self.store.flush().await
        };
        match result.await {
            Ok(_) => tracing::debug!("Stored {} ({} bytes) in primary store", key, image.bytes.len()),
            Err(e) => tracing::warn!("Could not write {} back to primary store: {}", key, e),
        }
    }
}
