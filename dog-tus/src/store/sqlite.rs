use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::warn;

use super::UploadStore;
use crate::{TaskId, TusError, TusResult, UploadId, UploadRecord};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS uploads (
        id TEXT PRIMARY KEY,
        record TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        upload_id TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_upload ON tasks(upload_id)",
];

/// Store backed by an SQLite database
#[derive(Debug, Clone)]
pub struct SqliteUploadStore {
    pool: SqlitePool,
}

impl SqliteUploadStore {
    /// Connect to `url` (e.g. `sqlite://uploads.db`), creating the file and tables if needed
    pub async fn connect(url: &str) -> TusResult<Self> {
        let options: SqliteConnectOptions = url.parse().map_err(TusError::storage)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options.create_if_missing(true))
            .await
            .map_err(TusError::storage)?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> TusResult<Self> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await.map_err(TusError::storage)?;
        }
        Ok(Self { pool })
    }
}

#[async_trait]
impl UploadStore for SqliteUploadStore {
    async fn save(&self, record: &UploadRecord) -> TusResult<()> {
        let raw = serde_json::to_string(record)?;
        sqlx::query(
            "INSERT INTO uploads (id, record, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at",
        )
        .bind(record.id.as_str())
        .bind(raw)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(TusError::storage)?;
        Ok(())
    }

    async fn load(&self, id: &UploadId) -> TusResult<UploadRecord> {
        let row = sqlx::query("SELECT record FROM uploads WHERE id = ?")
            .bind(id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => TusError::NotFound(id.to_string()),
                other => TusError::storage(other),
            })?;
        let raw: String = row.try_get("record").map_err(TusError::storage)?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn remove(&self, id: &UploadId) -> bool {
        let result: Result<(), sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM tasks WHERE upload_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM uploads WHERE id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
            tx.commit().await
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(upload_id = %id, error = %e, "Failed to remove upload record");
                false
            }
        }
    }

    async fn contains(&self, id: &UploadId) -> TusResult<bool> {
        let row = sqlx::query("SELECT 1 FROM uploads WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(TusError::storage)?;
        Ok(row.is_some())
    }

    async fn list_ids(&self) -> TusResult<HashSet<UploadId>> {
        let rows = sqlx::query("SELECT id FROM uploads")
            .fetch_all(&self.pool)
            .await
            .map_err(TusError::storage)?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("id")
                    .map(UploadId::from_string)
                    .map_err(TusError::storage)
            })
            .collect()
    }

    async fn map_task(&self, task: &TaskId, upload: &UploadId) -> TusResult<()> {
        sqlx::query(
            "INSERT INTO tasks (task_id, upload_id) VALUES (?, ?)
             ON CONFLICT(task_id) DO UPDATE SET upload_id = excluded.upload_id",
        )
        .bind(task.as_str())
        .bind(upload.as_str())
        .execute(&self.pool)
        .await
        .map_err(TusError::storage)?;
        Ok(())
    }

    async fn lookup_upload(&self, task: &TaskId) -> TusResult<Option<UploadId>> {
        let row = sqlx::query("SELECT upload_id FROM tasks WHERE task_id = ?")
            .bind(task.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(TusError::storage)?;
        row.map(|row| {
            row.try_get::<String, _>("upload_id")
                .map(UploadId::from_string)
                .map_err(TusError::storage)
        })
        .transpose()
    }

    async fn unmap_task(&self, task: &TaskId) -> TusResult<()> {
        sqlx::query("DELETE FROM tasks WHERE task_id = ?")
            .bind(task.as_str())
            .execute(&self.pool)
            .await
            .map_err(TusError::storage)?;
        Ok(())
    }

    async fn tasks_for(&self, upload: &UploadId) -> TusResult<Vec<TaskId>> {
        let rows = sqlx::query("SELECT task_id FROM tasks WHERE upload_id = ?")
            .bind(upload.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(TusError::storage)?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("task_id")
                    .map(TaskId::from_string)
                    .map_err(TusError::storage)
            })
            .collect()
    }
}
