//! SQLite-backed identity store.

use crate::cipher::EmbeddingCipher;
use crate::codec::{decode_vector, encode_vector};
use crate::{validate, IdentityStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use mugshot_core::{Embedding, Identity, IdentityId, NewIdentity};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_rusqlite::Connection;
use uuid::Uuid;

/// How long a write waits on another connection's lock before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS identities (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    username    TEXT NOT NULL,
    thumbnail   TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    identity_id   TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    ordinal       INTEGER NOT NULL,
    dim           INTEGER NOT NULL,
    model_version TEXT,
    sealed        INTEGER NOT NULL DEFAULT 0,
    data          BLOB NOT NULL,
    PRIMARY KEY (identity_id, ordinal)
);
"#;

struct IdentityRow {
    id: String,
    username: String,
    thumbnail: Option<String>,
    created_at: String,
}

struct EmbeddingRow {
    identity_id: String,
    dim: i64,
    model_version: Option<String>,
    sealed: bool,
    data: Vec<u8>,
}

/// Identity store in a single SQLite database file.
pub struct SqliteStore {
    conn: Connection,
    cipher: Option<EmbeddingCipher>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// With a cipher, newly written embeddings are sealed; existing sealed
    /// rows can only be read back with the same key.
    pub async fn open(path: impl AsRef<Path>, cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        tracing::info!(path = %path.display(), sealed = cipher.is_some(), "opening identity store");
        let conn = Connection::open(path).await?;
        Self::init(conn, cipher).await
    }

    pub async fn open_in_memory(cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn, cipher).await
    }

    async fn init(conn: Connection, cipher: Option<EmbeddingCipher>) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn, cipher })
    }

    /// Bound how long statements wait for locks held by other connections.
    ///
    /// A write that runs out of time fails inside its transaction and is
    /// rolled back.
    pub async fn with_busy_timeout(self, timeout: Duration) -> Result<Self, StoreError> {
        self.conn
            .call(move |conn| {
                conn.busy_timeout(timeout)?;
                Ok(())
            })
            .await?;
        Ok(self)
    }

    fn encode(&self, embedding: &Embedding) -> Result<(bool, Vec<u8>), StoreError> {
        let bytes = encode_vector(&embedding.values);
        match &self.cipher {
            Some(cipher) => Ok((true, cipher.seal(&bytes)?)),
            None => Ok((false, bytes)),
        }
    }

    fn decode(&self, row: EmbeddingRow) -> Result<Embedding, StoreError> {
        let dim = usize::try_from(row.dim)
            .map_err(|_| StoreError::Corrupt(format!("negative dimension {}", row.dim)))?;
        let bytes = if row.sealed {
            self.cipher.as_ref().ok_or(StoreError::Sealed)?.open(&row.data)?
        } else {
            row.data
        };
        Ok(Embedding {
            values: decode_vector(&bytes, dim)?,
            model_version: row.model_version,
        })
    }
}

#[async_trait]
impl IdentityStore for SqliteStore {
    async fn insert(&self, identity: NewIdentity) -> Result<IdentityId, StoreError> {
        validate(&identity)?;

        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        let rows = identity
            .embeddings
            .iter()
            .map(|e| -> Result<_, StoreError> {
                let (sealed, data) = self.encode(e)?;
                Ok((e.dimension() as i64, e.model_version.clone(), sealed, data))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        let NewIdentity { username, thumbnail, .. } = identity;

        let row_id = id.clone();
        let count = rows.len();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO identities (id, username, thumbnail, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![row_id, username, thumbnail, created_at],
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO embeddings (identity_id, ordinal, dim, model_version, sealed, data)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )?;
                    for (ordinal, (dim, model_version, sealed, data)) in rows.iter().enumerate() {
                        stmt.execute(params![row_id, ordinal as i64, dim, model_version, sealed, data])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        tracing::info!(id = %id, embeddings = count, "identity stored");
        Ok(IdentityId::new(id))
    }

    async fn load_all(&self) -> Result<Vec<Identity>, StoreError> {
        let (identity_rows, embedding_rows) = self
            .conn
            .call(|conn| {
                let identities = conn
                    .prepare("SELECT id, username, thumbnail, created_at FROM identities ORDER BY seq")?
                    .query_map([], |row| {
                        Ok(IdentityRow {
                            id: row.get(0)?,
                            username: row.get(1)?,
                            thumbnail: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let embeddings = conn
                    .prepare(
                        "SELECT e.identity_id, e.dim, e.model_version, e.sealed, e.data
                         FROM embeddings e JOIN identities i ON i.id = e.identity_id
                         ORDER BY i.seq, e.ordinal",
                    )?
                    .query_map([], |row| {
                        Ok(EmbeddingRow {
                            identity_id: row.get(0)?,
                            dim: row.get(1)?,
                            model_version: row.get(2)?,
                            sealed: row.get(3)?,
                            data: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                Ok((identities, embeddings))
            })
            .await?;

        let mut by_identity: HashMap<String, Vec<Embedding>> = HashMap::new();
        for row in embedding_rows {
            let owner = row.identity_id.clone();
            by_identity.entry(owner).or_default().push(self.decode(row)?);
        }

        Ok(identity_rows
            .into_iter()
            .map(|row| Identity {
                embeddings: by_identity.remove(&row.id).unwrap_or_default(),
                id: IdentityId::new(row.id),
                username: row.username,
                thumbnail: row.thumbnail,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn usernames(&self) -> Result<Vec<String>, StoreError> {
        let names = self
            .conn
            .call(|conn| {
                let names = conn
                    .prepare("SELECT username FROM identities ORDER BY seq")?
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await?;
        Ok(names)
    }

    async fn thumbnail(&self, username: &str) -> Result<Option<String>, StoreError> {
        let username = username.to_string();
        let thumbnail = self
            .conn
            .call(move |conn| {
                let thumbnail = conn
                    .query_row(
                        "SELECT thumbnail FROM identities WHERE username = ?1 ORDER BY seq DESC LIMIT 1",
                        params![username],
                        |row| row.get::<_, Option<String>>(0),
                    )
                    .optional()?;
                Ok(thumbnail.flatten())
            })
            .await?;
        Ok(thumbnail)
    }
}
