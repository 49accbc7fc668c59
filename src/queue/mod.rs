//! Queue: durable FIFO of pending job identifiers with retry/backoff,
//! delayed scheduling, and lifecycle-event emission.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::FileKind;
use crate::error::QueueError;

/// The processing envelope carried through the queue for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub job_id: Uuid,
    pub file_id: Uuid,
    pub user_id: String,
    pub file_path: String,
    pub kind: FileKind,
    pub thumbnail_sizes: Vec<String>,
    pub output_dir: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Used only as a tie-break for same-timestamp insertions: ordering is
    /// globally FIFO, priority tie-breaks only.
    pub priority: i64,
    pub delay: Option<Duration>,
}

/// A reservation handle returned by `reserve`. The caller must call exactly
/// one of `ack`/`nack` for a given entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanKind {
    Completed,
    Failed,
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(
        &self,
        job_id: Uuid,
        payload: Envelope,
        options: EnqueueOptions,
    ) -> Result<(), QueueError>;

    /// Blocks until an entry is available or the queue is paused/shut down.
    /// Returns `None` when the queue will not yield any more entries (used
    /// to unwind the worker's reservation loop on shutdown).
    async fn reserve(&self) -> Option<(QueueEntry, Envelope)>;

    async fn ack(&self, entry: QueueEntry) -> Result<(), QueueError>;

    /// `retryable = false` forces the entry terminal regardless of attempts
    /// remaining: input errors and invariant violations never benefit from
    /// a retry.
    async fn nack(&self, entry: QueueEntry, error: &str, retryable: bool) -> Result<(), QueueError>;

    /// Refreshes the stall timer and emits a `progress` lifecycle event.
    async fn update_progress(&self, entry: QueueEntry, percent: u8) -> Result<(), QueueError>;

    /// Best-effort removal of a waiting entry.
    async fn remove(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn pause(&self);

    async fn resume(&self);

    /// Drops terminal entries of `kind` older than `older_than`.
    async fn clean(&self, older_than: Duration, kind: CleanKind);
}
