//! mugshot-store: persistence for enrolled identities.
//!
//! The identity store is the only authority on who is enrolled; the
//! embedding index in `mugshot-core` is rebuilt from it.

pub mod cipher;
mod codec;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use mugshot_core::{Identity, IdentityId, NewIdentity};
use thiserror::Error;

pub use cipher::EmbeddingCipher;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("corrupt embedding record: {0}")]
    Corrupt(String),
    #[error("embedding is encrypted but no embedding key is configured")]
    Sealed,
    #[error("embedding encryption: {0}")]
    Crypto(String),
}

/// Storage for enrolled identities.
///
/// Enumeration order is insertion order and must be stable across calls:
/// the embedding index breaks similarity ties by it.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Persist a new identity in one atomic write and return its id.
    ///
    /// Callers do not cancel inserts, so an implementation must bound its own
    /// waiting: on error nothing was written.
    async fn insert(&self, identity: NewIdentity) -> Result<IdentityId, StoreError>;

    /// Every identity with all of its embeddings.
    async fn load_all(&self) -> Result<Vec<Identity>, StoreError>;

    /// Usernames of all identities, duplicates included.
    async fn usernames(&self) -> Result<Vec<String>, StoreError>;

    /// Thumbnail of the most recently enrolled identity named `username`.
    async fn thumbnail(&self, username: &str) -> Result<Option<String>, StoreError>;
}

/// Reject identities the index could not use: no embeddings, or embeddings
/// of differing dimension.
pub(crate) fn validate(identity: &NewIdentity) -> Result<(), StoreError> {
    let Some(first) = identity.embeddings.first() else {
        return Err(StoreError::InvalidIdentity(format!(
            "{:?} has no embeddings",
            identity.username
        )));
    };

    let dim = first.dimension();
    if dim == 0 {
        return Err(StoreError::InvalidIdentity("zero-length embedding".into()));
    }
    if let Some(bad) = identity.embeddings.iter().find(|e| e.dimension() != dim) {
        return Err(StoreError::InvalidIdentity(format!(
            "mixed embedding dimensions ({dim} and {})",
            bad.dimension()
        )));
    }
    Ok(())
}
