//! FileRecord persistence.
//!
//! The upload core treats persistence as a capability ([`FileRecordStore`]);
//! [`SqliteFileRecords`] backs it with the `files` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::FileRecord;

pub type DbResult<T> = Result<T, sqlx::Error>;

#[async_trait]
pub trait FileRecordStore: Send + Sync {
    async fn create(&self, record: &FileRecord) -> DbResult<()>;

    /// Fetch a record, including soft-deleted ones.
    async fn get(&self, id: Uuid) -> DbResult<Option<FileRecord>>;

    /// Live (not soft-deleted) records with this hash, oldest first.
    async fn find_by_hash(&self, content_hash: &str) -> DbResult<Vec<FileRecord>>;

    /// Mark a live record deleted. Returns false if it was absent or already deleted.
    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> DbResult<bool>;

    /// Bump the access counter of a live record.
    async fn record_access(&self, id: Uuid, at: DateTime<Utc>) -> DbResult<()>;

    /// Set or clear the suspension flag. Returns false if the record is absent.
    async fn set_suspension(&self, id: Uuid, reason: Option<&str>) -> DbResult<bool>;

    /// Live records of `context` with id greater than `after`, ordered by id.
    async fn list_by_context(
        &self,
        context: &str,
        after: Option<Uuid>,
        limit: usize,
    ) -> DbResult<Vec<FileRecord>>;

    /// Records soft-deleted before `cutoff`.
    async fn list_deleted_before(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<FileRecord>>;

    /// Remove the row for good.
    async fn hard_delete(&self, id: Uuid) -> DbResult<bool>;

    /// Rows (live or soft-deleted) pointing at `storage_path`.
    async fn count_references(&self, storage_path: &str) -> DbResult<i64>;
}

const SELECT_COLUMNS: &str = "SELECT id, filename, original_name, storage_path, mime_type, \
     file_size, context, uploader, upload_source, metadata, is_public, content_hash, \
     access_count, is_suspended, suspension_reason, created_at, deleted_at, last_accessed_at \
     FROM files";

/// [`FileRecordStore`] on SQLite.
#[derive(Clone)]
pub struct SqliteFileRecords {
    db: Arc<SqlitePool>,
}

impl SqliteFileRecords {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FileRecordStore for SqliteFileRecords {
    async fn create(&self, record: &FileRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO files (
                id, filename, original_name, storage_path, mime_type, file_size,
                context, uploader, upload_source, metadata, is_public, content_hash,
                access_count, is_suspended, suspension_reason, created_at,
                deleted_at, last_accessed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(&record.filename)
        .bind(&record.original_name)
        .bind(&record.storage_path)
        .bind(&record.mime_type)
        .bind(record.file_size)
        .bind(&record.context)
        .bind(&record.uploader)
        .bind(&record.upload_source)
        .bind(&record.metadata)
        .bind(record.is_public)
        .bind(&record.content_hash)
        .bind(record.access_count)
        .bind(record.is_suspended)
        .bind(&record.suspension_reason)
        .bind(record.created_at)
        .bind(record.deleted_at)
        .bind(record.last_accessed_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DbResult<Option<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&*self.db)
            .await
    }

    async fn find_by_hash(&self, content_hash: &str) -> DbResult<Vec<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "{SELECT_COLUMNS} WHERE content_hash = ? AND deleted_at IS NULL ORDER BY created_at ASC"
        ))
        .bind(content_hash)
        .fetch_all(&*self.db)
        .await
    }

    async fn soft_delete(&self, id: Uuid, at: DateTime<Utc>) -> DbResult<bool> {
        let result =
            sqlx::query("UPDATE files SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
                .bind(at)
                .bind(id)
                .execute(&*self.db)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_access(&self, id: Uuid, at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            "UPDATE files SET access_count = access_count + 1, last_accessed_at = ?
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(at)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn set_suspension(&self, id: Uuid, reason: Option<&str>) -> DbResult<bool> {
        let result =
            sqlx::query("UPDATE files SET is_suspended = ?, suspension_reason = ? WHERE id = ?")
                .bind(reason.is_some())
                .bind(reason)
                .bind(id)
                .execute(&*self.db)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_context(
        &self,
        context: &str,
        after: Option<Uuid>,
        limit: usize,
    ) -> DbResult<Vec<FileRecord>> {
        let rows = match after {
            Some(cursor) => {
                sqlx::query_as::<_, FileRecord>(&format!(
                    "{SELECT_COLUMNS} WHERE context = ? AND deleted_at IS NULL AND id > ? \
                     ORDER BY id ASC LIMIT ?"
                ))
                .bind(context)
                .bind(cursor)
                .bind(limit as i64)
                .fetch_all(&*self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, FileRecord>(&format!(
                    "{SELECT_COLUMNS} WHERE context = ? AND deleted_at IS NULL \
                     ORDER BY id ASC LIMIT ?"
                ))
                .bind(context)
                .bind(limit as i64)
                .fetch_all(&*self.db)
                .await?
            }
        };
        Ok(rows)
    }

    async fn list_deleted_before(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<FileRecord>> {
        // Both sides are UTC RFC 3339 text as written by sqlx, which sorts chronologically.
        sqlx::query_as::<_, FileRecord>(&format!(
            "{SELECT_COLUMNS} WHERE deleted_at IS NOT NULL AND deleted_at < ? \
             ORDER BY deleted_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await
    }

    async fn hard_delete(&self, id: Uuid) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_references(&self, storage_path: &str) -> DbResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files WHERE storage_path = ?")
            .bind(storage_path)
            .fetch_one(&*self.db)
            .await
    }
}
