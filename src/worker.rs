//! Worker: bounded-concurrency reservation loop that turns a queue envelope
//! into a processed thumbnail and reconciles the outcome with the Job Store
//! and Event Bus.
//!
//! The reservation-and-refill loop keeps up to N tasks in flight, pulling
//! more work as each one finishes, via `tokio::task::JoinSet` rather than
//! claiming a batch up front, since `reserve` already hands back one entry
//! at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinSet;

use crate::config::Config;
use crate::domain::{JobStatus, StatusPatch, Thumbnail};
use crate::error::PipelineError;
use crate::events::{Event, EventBus};
use crate::processor::{self, ProcessorParams};
use crate::queue::{Queue, QueueEntry};
use crate::store::JobStore;

pub struct Worker {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn Queue>,
    bus: Arc<EventBus>,
    config: Config,
    shutting_down: Arc<AtomicBool>,
}

impl Worker {
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
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signals the reservation loop to stop pulling new work. Call `run` to
    /// observe the drain-then-abort shutdown sequence finish.
    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Runs up to `config.worker_concurrency` jobs at a time until shutdown
    /// is requested and in-flight work has drained or hit the deadline.
    pub async fn run(&self) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut in_flight: std::collections::HashMap<tokio::task::Id, QueueEntry> =
            std::collections::HashMap::new();

        loop {
            while tasks.len() < self.config.worker_concurrency
                && !self.shutting_down.load(Ordering::SeqCst)
            {
                let Some((entry, envelope)) = self.queue.reserve().await else {
                    self.shutting_down.store(true, Ordering::SeqCst);
                    break;
                };

                let store = Arc::clone(&self.store);
                let queue = Arc::clone(&self.queue);
                let bus = Arc::clone(&self.bus);
                let config = self.config.clone();
                let handle = tasks.spawn(async move {
                    run_one_job(store, queue, bus, config, entry, envelope).await;
                });
                in_flight.insert(handle.id(), entry);
            }

            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            if let Some(res) = tasks.join_next_with_id().await {
                match res {
                    Ok((id, ())) => {
                        in_flight.remove(&id);
                    }
                    Err(e) => {
                        in_flight.remove(&e.id());
                        tracing::error!(error = %e, "job task panicked");
                    }
                }
            }
        }

        let drain = tokio::time::timeout(self.config.shutdown_drain, async {
            while let Some(res) = tasks.join_next_with_id().await {
                match res {
                    Ok((id, ())) => {
                        in_flight.remove(&id);
                    }
                    Err(e) => {
                        in_flight.remove(&e.id());
                        tracing::error!(error = %e, "job task panicked during drain");
                    }
                }
            }
        })
        .await;

        if drain.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "shutdown drain deadline reached, nacking and aborting remaining jobs"
            );
            tasks.abort_all();
            for (_, entry) in in_flight.drain() {
                if let Err(e) = self.queue.nack(entry, "", true).await {
                    tracing::error!(job_id = %entry.job_id, error = %e, "failed to nack in-flight job during shutdown");
                }
            }
        }
    }
}

async fn run_one_job(
    store: Arc<dyn JobStore>,
    queue: Arc<dyn Queue>,
    bus: Arc<EventBus>,
    config: Config,
    entry: QueueEntry,
    envelope: crate::queue::Envelope,
) {
    let job_id = entry.job_id;

    if entry.attempt > 1 {
        // The prior attempt normally left the record `failed` (fail_job
        // always writes it before nacking); reset it back to `pending`
        // before re-entering `processing`. A prior attempt that stalled or
        // was aborted mid-flight (worker crash, shutdown drain deadline)
        // never got that far and is still sitting at `processing` — that's
        // not an error, it's recognized below by the `processing ->
        // processing` edge the next `set_status` call is allowed to take.
        match store.get_job(job_id).await {
            Ok(job) if job.status == JobStatus::Failed => {
                if let Err(e) = store.reset_for_retry(job_id).await {
                    tracing::error!(%job_id, error = %e, "failed to reset job before retry");
                }
            }
            Ok(job) if job.status == JobStatus::Processing => {
                tracing::warn!(%job_id, "resuming an attempt stalled at processing");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(%job_id, error = %e, "failed to load job before retry"),
        }
    }

    let started_at = chrono::Utc::now();
    let set_processing = store
        .set_status(
            job_id,
            JobStatus::Processing,
            StatusPatch {
                progress: Some(10),
                started_at: Some(started_at),
                ..Default::default()
            },
        )
        .await;

    if let Err(e) = set_processing {
        tracing::error!(%job_id, error = %e, "failed to mark job processing");
        let _ = queue.nack(entry, &e.to_string(), true).await;
        return;
    }

    bus.publish(Event::Progress {
        job_id,
        progress: 10,
    });

    let result = tokio::time::timeout(
        config.job_timeout,
        execute(&store, &queue, &bus, &config, entry, &envelope),
    )
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => fail_job(&store, &queue, &bus, job_id, entry, e).await,
        Err(_) => {
            fail_job(
                &store,
                &queue,
                &bus,
                job_id,
                entry,
                PipelineError::Timeout(config.job_timeout),
            )
            .await
        }
    }
}

async fn execute(
    store: &Arc<dyn JobStore>,
    queue: &Arc<dyn Queue>,
    bus: &Arc<EventBus>,
    config: &Config,
    entry: QueueEntry,
    envelope: &crate::queue::Envelope,
) -> Result<(), PipelineError> {
    let output_dir = std::path::Path::new(&envelope.output_dir);
    tokio::fs::create_dir_all(output_dir).await?;

    let params = ProcessorParams {
        thumbnail_size: config.thumbnail_size,
        jpeg_quality: config.thumbnail_quality,
        video_capture_time: &config.video_capture_time,
    };

    let job_id = envelope.job_id;
    let queue_for_progress = Arc::clone(queue);
    let bus_for_progress = Arc::clone(bus);
    let progress_cb = move |percent: u8| {
        let queue = Arc::clone(&queue_for_progress);
        let bus = Arc::clone(&bus_for_progress);
        bus.publish(Event::Progress {
            job_id,
            progress: percent,
        });
        tokio::spawn(async move {
            let _ = queue.update_progress(entry, percent).await;
        });
    };

    let processed = processor::process(
        std::path::Path::new(&envelope.file_path),
        envelope.kind,
        output_dir,
        &params,
        config.video_extraction_timeout,
        &config.ffmpeg_binary,
        &progress_cb,
    )
    .await?;

    let size_label = config.thumbnail_size_label();
    let stored_name = processed
        .thumbnail_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let url_path = format!("/uploads/thumbnails/{stored_name}");

    let thumbnail = Thumbnail {
        thumbnail_id: uuid::Uuid::new_v4(),
        job_id,
        file_id: envelope.file_id,
        size: size_label,
        width: processed.width,
        height: processed.height,
        stored_name,
        storage_path: processed.thumbnail_path.display().to_string(),
        url_path: url_path.clone(),
    };

    store.append_thumbnail(job_id, thumbnail).await?;

    let completed_at = chrono::Utc::now();
    store
        .set_status(
            job_id,
            JobStatus::Completed,
            StatusPatch {
                progress: Some(100),
                completed_at: Some(completed_at),
                ..Default::default()
            },
        )
        .await?;

    queue.ack(entry).await?;
    bus.publish(Event::completed(job_id, vec![url_path]));
    Ok(())
}

async fn fail_job(
    store: &Arc<dyn JobStore>,
    queue: &Arc<dyn Queue>,
    bus: &Arc<EventBus>,
    job_id: uuid::Uuid,
    entry: QueueEntry,
    error: PipelineError,
) {
    let retryable = error.is_transient();
    tracing::warn!(%job_id, attempt = entry.attempt, error = %error, retryable, "job failed");
    let message = error.to_string();

    let completed_at = chrono::Utc::now();
    if let Err(e) = store
        .set_status(
            job_id,
            JobStatus::Failed,
            StatusPatch {
                error: Some(message.clone()),
                completed_at: Some(completed_at),
                ..Default::default()
            },
        )
        .await
    {
        tracing::error!(%job_id, error = %e, "failed to record job failure");
    }

    if let Err(e) = queue.nack(entry, &message, retryable).await {
        tracing::error!(%job_id, error = %e, "failed to nack job");
    }

    bus.publish(Event::failed(job_id, message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::InMemoryQueue;
    use crate::queue::{EnqueueOptions, Envelope};
    use crate::store::memory::InMemoryJobStore;
    use std::time::Duration as StdDuration;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.worker_concurrency = 1;
        cfg.job_timeout = StdDuration::from_secs(5);
        cfg.video_extraction_timeout = StdDuration::from_secs(2);
        cfg.shutdown_drain = StdDuration::from_millis(200);
        cfg.output_dir = dir.to_path_buf();
        cfg
    }

    #[tokio::test]
    async fn happy_image_job_completes_and_publishes_events() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.jpg");
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            640,
            480,
            image::Rgb([128, 64, 32]),
        ));
        img.save(&input).unwrap();

        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let bus = Arc::new(EventBus::new(64));
        let queue = InMemoryQueue::new(
            Arc::clone(&bus),
            3,
            StdDuration::from_millis(10),
            StdDuration::from_secs(30),
        );
        let config = test_config(dir.path());

        let file = crate::domain::File {
            file_id: uuid::Uuid::new_v4(),
            user_id: "user-1".into(),
            display_name: "input.jpg".into(),
            stored_name: "input.jpg".into(),
            mime: "image/jpeg".into(),
            byte_size: 100,
            storage_path: input.display().to_string(),
            kind: crate::domain::FileKind::Image,
            created_at: chrono::Utc::now(),
        };
        store.create_file(file.clone()).await.unwrap();
        let job_id = store
            .create_job("user-1", file.file_id, vec!["128x128".into()])
            .await
            .unwrap();

        let envelope = Envelope {
            job_id,
            file_id: file.file_id,
            user_id: "user-1".into(),
            file_path: input.display().to_string(),
            kind: crate::domain::FileKind::Image,
            thumbnail_sizes: vec!["128x128".into()],
            output_dir: dir.path().display().to_string(),
        };
        queue
            .enqueue(job_id, envelope, EnqueueOptions::default())
            .await
            .unwrap();

        let mut rx = bus.subscribe();
        let worker = Worker::new(store.clone(), queue.clone(), bus.clone(), config);
        let worker_handle = tokio::spawn(async move { worker.run().await });

        let mut topics = Vec::new();
        loop {
            let event = tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for job completion event")
                .unwrap();
            let topic = event.topic();
            topics.push(topic);
            if topic == crate::events::Topic::Completed || topic == crate::events::Topic::Failed {
                break;
            }
        }
        assert!(topics.contains(&crate::events::Topic::Active));
        assert_eq!(topics.last(), Some(&crate::events::Topic::Completed));

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.thumbnails.len(), 1);

        worker_handle.abort();
    }
}
