//! Postgres-backed `JobStore`.
//!
//! Query style: generic `Executor` parameters, `#[derive(sqlx::FromRow)]`
//! row structs, and `RETURNING` clauses instead of read-after-write round
//! trips. Schema is documented in `schema.sql` at the repo root; this type
//! assumes the schema already exists and takes an already-connected pool —
//! migrations and bootstrap are the caller's job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use super::JobStore;
use crate::domain::{File, FileKind, Job, JobStatus, StatusPatch, Thumbnail};
use crate::error::StoreError;

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Queued => "queued",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}

fn parse_status(s: &str) -> JobStatus {
    match s {
        "pending" => JobStatus::Pending,
        "queued" => JobStatus::Queued,
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        _ => JobStatus::Failed,
    }
}

fn parse_kind(s: &str) -> FileKind {
    match s {
        "video" => FileKind::Video,
        _ => FileKind::Image,
    }
}

fn kind_str(kind: FileKind) -> &'static str {
    match kind {
        FileKind::Image => "image",
        FileKind::Video => "video",
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    user_id: String,
    file_id: Uuid,
    status: String,
    progress: i16,
    thumbnail_sizes: serde_json::Value,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ThumbnailRow {
    thumbnail_id: Uuid,
    job_id: Uuid,
    file_id: Uuid,
    size: String,
    width: i32,
    height: i32,
    stored_name: String,
    storage_path: String,
    url_path: String,
}

impl From<ThumbnailRow> for Thumbnail {
    fn from(r: ThumbnailRow) -> Self {
        Thumbnail {
            thumbnail_id: r.thumbnail_id,
            job_id: r.job_id,
            file_id: r.file_id,
            size: r.size,
            width: r.width as u32,
            height: r.height as u32,
            stored_name: r.stored_name,
            storage_path: r.storage_path,
            url_path: r.url_path,
        }
    }
}

#[derive(sqlx::FromRow)]
struct FileRow {
    file_id: Uuid,
    user_id: String,
    display_name: String,
    stored_name: String,
    mime: String,
    byte_size: i64,
    storage_path: String,
    kind: String,
    created_at: DateTime<Utc>,
}

impl From<FileRow> for File {
    fn from(r: FileRow) -> Self {
        File {
            file_id: r.file_id,
            user_id: r.user_id,
            display_name: r.display_name,
            stored_name: r.stored_name,
            mime: r.mime,
            byte_size: r.byte_size as u64,
            storage_path: r.storage_path,
            kind: parse_kind(&r.kind),
            created_at: r.created_at,
        }
    }
}

async fn fetch_thumbnails<'e, E>(executor: E, job_id: Uuid) -> Result<Vec<Thumbnail>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<ThumbnailRow> = sqlx::query_as(
        r#"
        SELECT thumbnail_id, job_id, file_id, size, width, height,
               stored_name, storage_path, url_path
        FROM thumbnails
        WHERE job_id = $1
        ORDER BY thumbnail_id ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(Thumbnail::from).collect())
}

async fn row_to_job(pool: &PgPool, row: JobRow) -> Result<Job, StoreError> {
    let thumbnails = fetch_thumbnails(pool, row.job_id).await?;
    let thumbnail_sizes: Vec<String> =
        serde_json::from_value(row.thumbnail_sizes).unwrap_or_default();
    Ok(Job {
        job_id: row.job_id,
        user_id: row.user_id,
        file_id: row.file_id,
        status: parse_status(&row.status),
        progress: row.progress as u8,
        thumbnail_sizes,
        thumbnails,
        error: row.error,
        started_at: row.started_at,
        completed_at: row.completed_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(
        &self,
        user_id: &str,
        file_id: Uuid,
        thumbnail_sizes: Vec<String>,
    ) -> Result<Uuid, StoreError> {
        let job_id = Uuid::new_v4();
        let sizes = serde_json::to_value(&thumbnail_sizes).unwrap();
        sqlx::query(
            r#"
            INSERT INTO jobs (job_id, user_id, file_id, status, progress, thumbnail_sizes,
                               created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, NOW(), NOW())
            "#,
        )
        .bind(job_id)
        .bind(user_id)
        .bind(file_id)
        .bind(sizes)
        .execute(&self.pool)
        .await?;
        Ok(job_id)
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        new_status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: JobRow = sqlx::query_as(
            "SELECT job_id, user_id, file_id, status, progress, thumbnail_sizes, error, \
             started_at, completed_at, created_at, updated_at FROM jobs WHERE job_id = $1 FOR UPDATE",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound(job_id))?;

        let from = parse_status(&current.status);
        if !from.can_transition_to(new_status) {
            return Err(StoreError::InvalidTransition {
                job_id,
                from,
                to: new_status,
            });
        }

        // An explicit `started_at` always wins, even if the job was already
        // `processing` from a stalled attempt — re-entering processing
        // restamps the clock rather than keeping the stale value from the
        // attempt that never reached a terminal state.
        let started_at = if new_status == JobStatus::Processing {
            Some(patch.started_at.unwrap_or_else(|| current.started_at.unwrap_or_else(Utc::now)))
        } else {
            current.started_at
        };
        let completed_at = if new_status.is_terminal() {
            Some(patch.completed_at.unwrap_or_else(Utc::now))
        } else {
            current.completed_at
        };

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                progress = COALESCE($3, progress),
                error = $4,
                started_at = $5,
                completed_at = $6,
                updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(status_str(new_status))
        .bind(patch.progress.map(|p| p as i16))
        .bind(&patch.error)
        .bind(started_at)
        .bind(completed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.get_job(job_id).await
    }

    async fn append_thumbnail(&self, job_id: Uuid, thumbnail: Thumbnail) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO thumbnails
                (thumbnail_id, job_id, file_id, size, width, height, stored_name, storage_path, url_path)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(thumbnail.thumbnail_id)
        .bind(job_id)
        .bind(thumbnail.file_id)
        .bind(&thumbnail.size)
        .bind(thumbnail.width as i32)
        .bind(thumbnail.height as i32)
        .bind(&thumbnail.stored_name)
        .bind(&thumbnail.storage_path)
        .bind(&thumbnail.url_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let row: JobRow = sqlx::query_as(
            "SELECT job_id, user_id, file_id, status, progress, thumbnail_sizes, error, \
             started_at, completed_at, created_at, updated_at FROM jobs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(job_id))?;
        row_to_job(&self.pool, row).await
    }

    async fn list_jobs_by_user(&self, user_id: &str) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT job_id, user_id, file_id, status, progress, thumbnail_sizes, error, \
             started_at, completed_at, created_at, updated_at FROM jobs \
             WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(row_to_job(&self.pool, row).await?);
        }
        Ok(jobs)
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', progress = 0, error = NULL,
                started_at = NULL, completed_at = NULL, updated_at = NOW()
            WHERE job_id = $1 AND status = 'failed'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let job = self.get_job(job_id).await?;
            return Err(StoreError::InvalidTransition {
                job_id,
                from: job.status,
                to: JobStatus::Pending,
            });
        }
        self.get_job(job_id).await
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        // ON DELETE CASCADE (schema.sql) takes care of owned thumbnails.
        let deleted = sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id));
        }
        Ok(())
    }

    async fn get_file(&self, file_id: Uuid) -> Result<File, StoreError> {
        let row: FileRow = sqlx::query_as(
            "SELECT file_id, user_id, display_name, stored_name, mime, byte_size, \
             storage_path, kind, created_at FROM files WHERE file_id = $1",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(file_id))?;
        Ok(row.into())
    }

    async fn create_file(&self, file: File) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO files (file_id, user_id, display_name, stored_name, mime, byte_size,
                                storage_path, kind, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(file.file_id)
        .bind(&file.user_id)
        .bind(&file.display_name)
        .bind(&file.stored_name)
        .bind(&file.mime)
        .bind(file.byte_size as i64)
        .bind(&file.storage_path)
        .bind(kind_str(file.kind))
        .bind(file.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
