use anyhow::{Context, Result};
use mugshot_store::{EmbeddingCipher, IdentityStore, MemoryStore, SqliteStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;
mod service;

use config::Config;
use service::{IdentityService, ServiceSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        threshold = config.similarity_threshold,
        selection = %config.face_selection,
        "mugshotd starting"
    );

    let store = open_store(&config).await?;

    // Load models synchronously before accepting traffic (fail-fast)
    let pipeline = engine::load_pipeline(&config).context("loading face models")?;
    let engine = engine::spawn_engine(pipeline)?;

    let service = Arc::new(IdentityService::new(
        store,
        engine,
        ServiceSettings::from_config(&config),
    ));

    // The index is derived state; it must reflect the store before the first recognition.
    service
        .rebuild_index()
        .await
        .context("building the embedding index")?;

    let app = http::router(Arc::clone(&service), config.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    let status = service.status();
    tracing::info!(
        listen = %config.listen,
        identities = status.identities,
        embeddings = status.embeddings,
        "mugshotd ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("mugshotd shutting down");
    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<dyn IdentityStore>> {
    if config.ephemeral {
        tracing::warn!("ephemeral mode: identities are kept in memory and lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    }

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let cipher = config
        .embedding_key
        .as_deref()
        .map(EmbeddingCipher::from_passphrase)
        .transpose()?;
    let store = SqliteStore::open(&config.db_path, cipher)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?
        .with_busy_timeout(config.store_timeout())
        .await?;
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
