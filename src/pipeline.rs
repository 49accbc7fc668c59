//! Pipeline facade: the one boundary-facing surface a caller outside the
//! core (the upload boundary) needs. Bundles the Job Store, Queue, and Event
//! Bus behind a single `enqueue_job` entry point so callers never touch the
//! store, queue, or bus directly.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::domain::{FileKind, JobStatus};
use crate::error::PipelineError;
use crate::events::EventBus;
use crate::queue::{EnqueueOptions, Envelope, Queue};
use crate::store::JobStore;

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn Queue>,
    bus: Arc<EventBus>,
    config: Config,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn Queue>,
        bus: Arc<EventBus>,
        config: Config,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `enqueue_job(userId, fileId, kind, filePath, outputDir) -> jobId`.
    /// The caller has already persisted the `File` record; `filePath` must
    /// exist and be readable, `outputDir` need not.
    pub async fn enqueue_job(
        &self,
        user_id: &str,
        file_id: Uuid,
        kind: FileKind,
        file_path: &str,
        output_dir: &str,
    ) -> Result<Uuid, PipelineError> {
        let size_label = self.config.thumbnail_size_label();
        let job_id = self
            .store
            .create_job(user_id, file_id, vec![size_label.clone()])
            .await?;

        let envelope = Envelope {
            job_id,
            file_id,
            user_id: user_id.to_string(),
            file_path: file_path.to_string(),
            kind,
            thumbnail_sizes: vec![size_label],
            output_dir: output_dir.to_string(),
        };

        if let Err(e) = self
            .queue
            .enqueue(job_id, envelope, EnqueueOptions::default())
            .await
        {
            let _ = self
                .store
                .set_status(
                    job_id,
                    JobStatus::Failed,
                    crate::domain::StatusPatch {
                        error: Some(e.to_string()),
                        completed_at: Some(chrono::Utc::now()),
                        ..Default::default()
                    },
                )
                .await;
            return Err(e.into());
        }

        self.store
            .set_status(job_id, JobStatus::Queued, Default::default())
            .await?;

        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::InMemoryQueue;
    use crate::store::memory::InMemoryJobStore;
    use std::time::Duration;

    fn test_pipeline() -> (Pipeline, Arc<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        let bus = Arc::new(EventBus::new(64));
        let queue = InMemoryQueue::new(Arc::clone(&bus), 3, Duration::from_millis(10), Duration::from_secs(30));
        let config = Config::default();
        let pipeline = Pipeline::new(store.clone(), queue, bus, config);
        (pipeline, store)
    }

    #[tokio::test]
    async fn enqueue_job_lands_in_pending_then_queued() {
        let (pipeline, store) = test_pipeline();
        let file_id = Uuid::new_v4();
        let job_id = pipeline
            .enqueue_job("user-1", file_id, FileKind::Image, "/uploads/a.jpg", "/uploads/thumbnails")
            .await
            .unwrap();

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.thumbnail_sizes, vec!["128x128".to_string()]);
    }

    #[tokio::test]
    async fn each_enqueue_gets_a_distinct_job_id() {
        let (pipeline, _store) = test_pipeline();
        let file_id = Uuid::new_v4();
        let first = pipeline
            .enqueue_job("user-1", file_id, FileKind::Image, "/uploads/a.jpg", "/uploads/thumbnails")
            .await
            .unwrap();
        let second = pipeline
            .enqueue_job("user-1", file_id, FileKind::Image, "/uploads/a.jpg", "/uploads/thumbnails")
            .await
            .unwrap();
        assert_ne!(first, second);
    }
}
