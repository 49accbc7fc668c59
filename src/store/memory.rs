//! In-memory `JobStore`, used by worker/queue tests so the job lifecycle
//! invariants can be checked deterministically without a live Postgres
//! instance.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::JobStore;
use crate::domain::{File, Job, JobStatus, StatusPatch, Thumbnail};
use crate::error::StoreError;

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    files: Mutex<HashMap<Uuid, File>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        user_id: &str,
        file_id: Uuid,
        thumbnail_sizes: Vec<String>,
    ) -> Result<Uuid, StoreError> {
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        let job = Job {
            job_id,
            user_id: user_id.to_string(),
            file_id,
            status: JobStatus::Pending,
            progress: 0,
            thumbnail_sizes,
            thumbnails: Vec::new(),
            error: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().unwrap().insert(job_id, job);
        Ok(job_id)
    }

    async fn set_status(
        &self,
        job_id: Uuid,
        new_status: JobStatus,
        patch: StatusPatch,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;

        if !job.status.can_transition_to(new_status) {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: job.status,
                to: new_status,
            });
        }

        job.status = new_status;
        if let Some(progress) = patch.progress {
            job.progress = progress;
        }
        job.error = patch.error;
        if new_status == JobStatus::Processing {
            // An explicit `started_at` always wins, even if the job was
            // already `processing` from a stalled attempt — re-entering
            // processing restamps the clock rather than keeping the stale
            // value from the attempt that never reached a terminal state.
            job.started_at = Some(patch.started_at.unwrap_or_else(|| job.started_at.unwrap_or_else(Utc::now)));
        }
        if new_status.is_terminal() {
            job.completed_at = patch.completed_at.or(Some(Utc::now()));
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn append_thumbnail(&self, job_id: Uuid, thumbnail: Thumbnail) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        job.thumbnails.push(thumbnail);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn list_jobs_by_user(&self, user_id: &str) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn reset_for_retry(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status != JobStatus::Failed {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: job.status,
                to: JobStatus::Pending,
            });
        }
        job.status = JobStatus::Pending;
        job.progress = 0;
        job.error = None;
        job.started_at = None;
        job.completed_at = None;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.jobs
            .lock()
            .unwrap()
            .remove(&job_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn get_file(&self, file_id: Uuid) -> Result<File, StoreError> {
        self.files
            .lock()
            .unwrap()
            .get(&file_id)
            .cloned()
            .ok_or(StoreError::NotFound(file_id))
    }

    async fn create_file(&self, file: File) -> Result<(), StoreError> {
        self.files.lock().unwrap().insert(file.file_id, file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FileKind;

    fn sample_file() -> File {
        File {
            file_id: Uuid::new_v4(),
            user_id: "user-1".into(),
            display_name: "cat.jpg".into(),
            stored_name: "abc.jpg".into(),
            mime: "image/jpeg".into(),
            byte_size: 1024,
            storage_path: "/uploads/abc.jpg".into(),
            kind: FileKind::Image,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_job_starts_pending_with_zero_progress() {
        let store = InMemoryJobStore::new();
        let file = sample_file();
        store.create_file(file.clone()).await.unwrap();
        let job_id = store
            .create_job("user-1", file.file_id, vec!["128x128".into()])
            .await
            .unwrap();

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.thumbnails.is_empty());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let store = InMemoryJobStore::new();
        let file = sample_file();
        store.create_file(file.clone()).await.unwrap();
        let job_id = store
            .create_job("user-1", file.file_id, vec!["128x128".into()])
            .await
            .unwrap();

        let err = store
            .set_status(job_id, JobStatus::Completed, StatusPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn reset_for_retry_requires_failed_status() {
        let store = InMemoryJobStore::new();
        let file = sample_file();
        store.create_file(file.clone()).await.unwrap();
        let job_id = store
            .create_job("user-1", file.file_id, vec!["128x128".into()])
            .await
            .unwrap();

        let err = store.reset_for_retry(job_id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store
            .set_status(job_id, JobStatus::Processing, StatusPatch::default())
            .await
            .unwrap();
        store
            .set_status(
                job_id,
                JobStatus::Failed,
                StatusPatch {
                    error: Some("boom".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = store.reset_for_retry(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.error.is_none());
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn delete_job_removes_it() {
        let store = InMemoryJobStore::new();
        let file = sample_file();
        store.create_file(file.clone()).await.unwrap();
        let job_id = store
            .create_job("user-1", file.file_id, vec!["128x128".into()])
            .await
            .unwrap();

        store.delete_job(job_id).await.unwrap();
        assert!(matches!(
            store.get_job(job_id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
