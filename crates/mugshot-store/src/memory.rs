//! In-process identity store for tests and ephemeral daemons.

use crate::{validate, IdentityStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use mugshot_core::{Identity, IdentityId, NewIdentity};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct MemoryStore {
    identities: RwLock<Vec<Identity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn insert(&self, identity: NewIdentity) -> Result<IdentityId, StoreError> {
        validate(&identity)?;

        let id = IdentityId::new(Uuid::new_v4().to_string());
        let record = Identity {
            id: id.clone(),
            username: identity.username,
            embeddings: identity.embeddings,
            thumbnail: identity.thumbnail,
            created_at: Utc::now().to_rfc3339(),
        };
        self.identities.write().await.push(record);
        tracing::debug!(id = %id, "identity stored in memory");
        Ok(id)
    }

    async fn load_all(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.identities.read().await.clone())
    }

    async fn usernames(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .identities
            .read()
            .await
            .iter()
            .map(|i| i.username.clone())
            .collect())
    }

    async fn thumbnail(&self, username: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .identities
            .read()
            .await
            .iter()
            .rev()
            .find(|i| i.username == username)
            .and_then(|i| i.thumbnail.clone()))
    }
}
