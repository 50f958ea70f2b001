//! # Checkpoint
//!
//! Resume state of the crawl and the stores it is persisted to. Every save writes a complete
//! snapshot, so a crash between saves loses at most the page in flight.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io failed for {path}: {error}")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("checkpoint could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checkpoint query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Where the crawl is and what it has already emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCursor {
    pub partition_key: String,
    /// Next page to fetch in `partition_key`. Only moves forward within a partition.
    pub page_index: u32,
    #[serde(default)]
    pub emitted_ids: BTreeSet<String>,
    #[serde(default)]
    pub completed_partitions: BTreeSet<String>,
}

impl PartitionCursor {
    pub fn start(partition_key: &str) -> Self {
        Self {
            partition_key: partition_key.to_owned(),
            page_index: 0,
            emitted_ids: BTreeSet::new(),
            completed_partitions: BTreeSet::new(),
        }
    }

    /// Make `partition_key` current. The page index is kept when it already is, so a resumed
    /// crawl continues from the saved page.
    pub fn enter_partition(&mut self, partition_key: &str) {
        if self.partition_key != partition_key {
            self.partition_key = partition_key.to_owned();
            self.page_index = 0;
        }
    }

    pub fn advance_page(&mut self) {
        self.page_index += 1;
    }

    pub fn complete_partition(&mut self) {
        self.completed_partitions
            .insert(self.partition_key.clone());
    }

    pub fn is_completed(&self, partition_key: &str) -> bool {
        self.completed_partitions.contains(partition_key)
    }

    pub fn mark_emitted(&mut self, id: &str) {
        self.emitted_ids.insert(id.to_owned());
    }

    pub fn has_emitted(&self, id: &str) -> bool {
        self.emitted_ids.contains(id)
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<PartitionCursor>, CheckpointError>;
    async fn save(&self, cursor: &PartitionCursor) -> Result<(), CheckpointError>;
    /// Forget the stored cursor. Only ever called on explicit operator request.
    async fn reset(&self) -> Result<(), CheckpointError>;
}

/// A JSON snapshot on the local filesystem.
///
/// Saves write a temporary sibling, fsync it and rename it over the target, so readers only
/// ever see a complete snapshot.
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Directory holding the snapshot; its entry for the renamed file must be synced too.
    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn io_error(&self, error: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            error,
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<PartitionCursor>, CheckpointError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn save(&self, cursor: &PartitionCursor) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(cursor)?;
        let temp_path = self.temp_path();

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&bytes).await.map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        let dir = tokio::fs::File::open(self.parent_dir())
            .await
            .map_err(|e| self.io_error(e))?;
        dir.sync_all().await.map_err(|e| self.io_error(e))
    }

    async fn reset(&self) -> Result<(), CheckpointError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

/// One JSONB row per crawl name in `crawl_checkpoints`.
pub struct PgCheckpointStore {
    pool: PgPool,
    name: String,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool, name: &str) -> Self {
        Self {
            pool,
            name: name.to_owned(),
        }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self) -> Result<Option<PartitionCursor>, CheckpointError> {
        let cursor: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT cursor FROM crawl_checkpoints WHERE name = $1")
                .bind(&self.name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(cursor.map(serde_json::from_value).transpose()?)
    }

    async fn save(&self, cursor: &PartitionCursor) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
INSERT INTO crawl_checkpoints (name, cursor, updated_at)
VALUES ($1, $2, NOW())
ON CONFLICT (name) DO UPDATE
SET cursor = EXCLUDED.cursor, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.name)
        .bind(serde_json::to_value(cursor)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset(&self) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM crawl_checkpoints WHERE name = $1")
            .bind(&self.name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
