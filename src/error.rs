//! Error taxonomy shared across the pipeline components.
//!
//! Each enum here maps onto the failure classes spec'd for its component:
//! store errors are programmer errors (logged, never retried), queue and
//! processor errors are classified by the worker into retry/terminal.

use crate::domain::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(uuid::Uuid),

    #[error("illegal transition for job {job_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        job_id: uuid::Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job store backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue entry for job {0} not found")]
    NotFound(uuid::Uuid),

    #[error("job {0} is already enqueued")]
    AlreadyEnqueued(uuid::Uuid),

    #[error("entry already acked or nacked")]
    AlreadyAcked,

    #[error("queue backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Failure taxonomy surfaced by the Media Processor.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("input file missing: {0}")]
    InputMissing(String),

    #[error("unsupported file kind: {0:?}")]
    UnsupportedKind(crate::domain::FileKind),

    #[error("failed to probe image format: {0}")]
    ProbeFailed(String),

    #[error("failed to encode thumbnail: {0}")]
    EncodeFailed(String),

    #[error("thumbnail output was empty")]
    EmptyOutput,

    #[error("video frame extraction failed: {0}")]
    VideoExtractionFailed(String),

    #[error("video frame extraction timed out after {0:?}")]
    VideoExtractionTimeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessorError {
    /// Whether a retry of this job could plausibly succeed.
    ///
    /// Input errors are a property of the uploaded file and will never
    /// resolve themselves; everything else is treated as transient.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            ProcessorError::InputMissing(_) | ProcessorError::UnsupportedKind(_)
        )
    }
}

/// Top-level error surfaced by the worker's per-job execution and by the
/// `Pipeline` facade's inbound operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error("job timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Processor(e) => e.is_transient(),
            PipelineError::Timeout(_) => true,
            PipelineError::Io(_) => true,
            PipelineError::Store(_) => false,
            PipelineError::Queue(_) => false,
        }
    }
}
