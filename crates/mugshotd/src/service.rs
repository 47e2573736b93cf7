use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use mugshot_core::{
    EmbeddingIndex, IdentityId, NewIdentity, RecognitionResult, SharedIndex, DEFAULT_MATCH_THRESHOLD,
};
use mugshot_store::{IdentityStore, StoreError};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("username is required")]
    MissingUsername,
    #[error("expected {expected} images, got {got}")]
    ImageCount { expected: usize, got: usize },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("identity store: {0}")]
    Store(#[from] StoreError),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl ServiceError {
    /// Errors caused by the request rather than the daemon.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::MissingUsername | Self::ImageCount { .. } => true,
            Self::Engine(EngineError::Pipeline(e)) => e.is_client_error(),
            _ => false,
        }
    }
}

/// The knobs the identity service needs from [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSettings {
    pub threshold: f64,
    pub enroll_images: usize,
    pub inference_timeout: Duration,
    pub store_timeout: Duration,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            threshold: config.similarity_threshold,
            enroll_images: config.enroll_images,
            inference_timeout: config.inference_timeout(),
            store_timeout: config.store_timeout(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            enroll_images: 5,
            inference_timeout: Duration::from_secs(30),
            store_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub identities: usize,
    pub embeddings: usize,
    pub threshold: f64,
    pub enroll_images: usize,
}

/// Enrollment, recognition and index maintenance over one store and one engine.
///
/// Recognition reads only the published index snapshot; the store is touched
/// by enrollment, listing and rebuilds.
pub struct IdentityService {
    store: Arc<dyn IdentityStore>,
    engine: EngineHandle,
    index: SharedIndex,
    rebuild_lock: Mutex<()>,
    settings: ServiceSettings,
}

impl IdentityService {
    /// Create a service with an empty index. Call [`rebuild_index`](Self::rebuild_index)
    /// before serving recognition traffic.
    pub fn new(store: Arc<dyn IdentityStore>, engine: EngineHandle, settings: ServiceSettings) -> Self {
        Self {
            store,
            engine,
            index: SharedIndex::default(),
            rebuild_lock: Mutex::new(()),
            settings,
        }
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Current index snapshot.
    pub fn index(&self) -> Arc<EmbeddingIndex> {
        self.index.snapshot()
    }

    /// Enroll `username` from exactly `enroll_images` raw images.
    ///
    /// Nothing is persisted unless every image yields a face. The index is
    /// rebuilt after the identity is stored.
    pub async fn enroll(&self, username: &str, images: Vec<Vec<u8>>) -> Result<IdentityId, ServiceError> {
        if username.trim().is_empty() {
            return Err(ServiceError::MissingUsername);
        }
        if images.len() != self.settings.enroll_images {
            return Err(ServiceError::ImageCount {
                expected: self.settings.enroll_images,
                got: images.len(),
            });
        }

        tracing::info!(user = username, images = images.len(), "enroll requested");
        let sample = bounded("enrollment inference", self.settings.inference_timeout, self.engine.enroll(images)).await?;

        let identity = NewIdentity {
            username: username.to_string(),
            embeddings: sample.embeddings,
            thumbnail: sample.thumbnail,
        };
        // Inserts are not cancellable; the store bounds its own lock waits.
        let id = self.store.insert(identity).await?;
        tracing::info!(user = username, id = %id, "identity enrolled");

        // The identity is already durable; a failed rebuild only delays its
        // visibility until the next successful one.
        if let Err(e) = self.rebuild_index().await {
            tracing::error!(error = %e, id = %id, "index rebuild after enrollment failed");
        }

        Ok(id)
    }

    /// Recognize every face in `image` against the current index snapshot.
    pub async fn recognize(&self, image: Vec<u8>) -> Result<Vec<RecognitionResult>, ServiceError> {
        let snapshot = self.index.snapshot();
        let results = bounded(
            "recognition inference",
            self.settings.inference_timeout,
            self.engine.recognize(image, snapshot, self.settings.threshold),
        )
        .await?;

        tracing::info!(
            faces = results.len(),
            matched = results.iter().filter(|r| r.is_match()).count(),
            "recognize complete"
        );
        Ok(results)
    }

    /// Usernames of all enrolled identities, in enrollment order.
    pub async fn list_identities(&self) -> Result<Vec<String>, ServiceError> {
        bounded("identity listing", self.settings.store_timeout, self.store.usernames()).await
    }

    /// Thumbnail of the latest identity enrolled as `username`.
    pub async fn thumbnail(&self, username: &str) -> Result<Option<String>, ServiceError> {
        bounded("thumbnail lookup", self.settings.store_timeout, self.store.thumbnail(username)).await
    }

    /// Rebuild the index from the whole store and publish it.
    ///
    /// Rebuilds are serialized, so the last published index reflects the
    /// most recent completed store read.
    pub async fn rebuild_index(&self) -> Result<Arc<EmbeddingIndex>, ServiceError> {
        let _guard = self.rebuild_lock.lock().await;

        let identities = bounded("index rebuild", self.settings.store_timeout, self.store.load_all()).await?;
        let index = EmbeddingIndex::build(&identities);
        tracing::info!(
            identities = index.identity_count(),
            embeddings = index.len(),
            "embedding index rebuilt"
        );

        self.index.publish(index);
        Ok(self.index.snapshot())
    }

    pub fn status(&self) -> Status {
        let index = self.index();
        Status {
            version: env!("CARGO_PKG_VERSION"),
            identities: index.identity_count(),
            embeddings: index.len(),
            threshold: self.settings.threshold,
            enroll_images: self.settings.enroll_images,
        }
    }
}

async fn bounded<T, E>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, ServiceError>
where
    ServiceError: From<E>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            tracing::warn!(operation, ?after, "operation timed out");
            Err(ServiceError::Timeout { operation, after })
        }
    }
}
