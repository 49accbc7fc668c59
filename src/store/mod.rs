//! Job Store: durable CRUD over File/Job/Thumbnail that enforces the job
//! status DAG and the thumbnails/error consistency invariants.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{File, Job, JobStatus, StatusPatch, Thumbnail};
use crate::error::StoreError;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(
        &self,
        user_id: &str,
        file_id: Uuid,
        thumbnail_sizes: Vec<String>,
    ) -> Result<Uuid, StoreError>;

    async fn set_status(
        &self,
        job_id: Uuid,
        new_status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job, StoreError>;

    async fn append_thumbnail(
        &self,
        job_id: Uuid,
        thumbnail: Thumbnail,
    ) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError>;

    async fn list_jobs_by_user(&self, user_id: &str) -> Result<Vec<Job>, StoreError>;

    /// Only valid when the job's current status is `failed`; fails with
    /// `InvalidTransition` otherwise.
    async fn reset_for_retry(&self, job_id: Uuid) -> Result<Job, StoreError>;

    /// Cascades to owned thumbnails.
    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn get_file(&self, file_id: Uuid) -> Result<File, StoreError>;

    async fn create_file(&self, file: File) -> Result<(), StoreError>;
}
