//! SQLite-backed gallery of enrolled faces.

use chrono::{DateTime, Utc};
use rollcall_core::{Embedding, FaceModel, Identity};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("face model {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}

pub struct GalleryStore {
    conn: Connection,
}

impl GalleryStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;
        tracing::debug!(path = %path.display(), models = store.count()?, "gallery opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS face_models (
                id            TEXT PRIMARY KEY,
                identity      TEXT NOT NULL,
                label         TEXT NOT NULL,
                embedding     BLOB NOT NULL,
                model_version TEXT,
                created_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_face_models_identity ON face_models(identity);
            "#,
        )?;
        Ok(())
    }

    pub fn insert(&self, model: &FaceModel) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO face_models (id, identity, label, embedding, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                model.id,
                model.identity.as_str(),
                model.label,
                model.embedding.to_le_bytes(),
                model.embedding.model_version,
                model.created_at.to_rfc3339(),
            ],
        )?;
        tracing::info!(id = %model.id, identity = %model.identity, label = %model.label, "face model stored");
        Ok(())
    }

    /// Every enrolled model, oldest first. This is the gallery a detector matches against.
    pub fn list(&self) -> Result<Vec<FaceModel>, StoreError> {
        self.query(
            "SELECT id, identity, label, embedding, model_version, created_at
             FROM face_models ORDER BY created_at, id",
            [],
        )
    }

    pub fn list_for(&self, identity: &Identity) -> Result<Vec<FaceModel>, StoreError> {
        self.query(
            "SELECT id, identity, label, embedding, model_version, created_at
             FROM face_models WHERE identity = ?1 ORDER BY created_at, id",
            [identity.as_str()],
        )
    }

    /// Remove one model by id. Returns whether a row was deleted.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM face_models WHERE id = ?1", [id])?;
        if deleted > 0 {
            tracing::info!(id, "face model removed");
        }
        Ok(deleted > 0)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM face_models", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<FaceModel>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RawModel::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawModel::into_model).collect()
    }
}

/// A row as stored, before validation.
struct RawModel {
    id: String,
    identity: String,
    label: String,
    embedding: Vec<u8>,
    model_version: Option<String>,
    created_at: String,
}

impl RawModel {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            identity: row.get(1)?,
            label: row.get(2)?,
            embedding: row.get(3)?,
            model_version: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_model(self) -> Result<FaceModel, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let identity = Identity::new(&self.identity).map_err(|e| corrupt(e.to_string()))?;
        let embedding = Embedding::from_le_bytes(&self.embedding, self.model_version.clone())
            .ok_or_else(|| corrupt(format!("embedding blob of {} bytes", self.embedding.len())))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt(format!("created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(FaceModel {
            id: self.id,
            identity,
            label: self.label,
            embedding,
            created_at,
        })
    }
}
