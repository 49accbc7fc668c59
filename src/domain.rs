//! Core data model: File, Job, Thumbnail and the job status DAG.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Video,
}

/// Lifecycle state of a `Job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether `self -> next` is a legal edge in the status DAG.
    ///
    /// `pending -> failed` and `queued -> failed` are allowed for
    /// pre-processing failures (e.g. the worker can't create the output
    /// directory before ever reaching `processing`). `processing ->
    /// processing` is allowed so a stalled or aborted attempt (the job
    /// record never reached `failed`) can be resumed in place on retry,
    /// without a detour through `pending`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Processing)
                | (Pending, Failed)
                | (Queued, Processing)
                | (Queued, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Immutable upload record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub file_id: Uuid,
    pub user_id: String,
    pub display_name: String,
    pub stored_name: String,
    pub mime: String,
    pub byte_size: u64,
    pub storage_path: String,
    pub kind: FileKind,
    pub created_at: DateTime<Utc>,
}

/// Immutable thumbnail artifact record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thumbnail {
    pub thumbnail_id: Uuid,
    pub job_id: Uuid,
    pub file_id: Uuid,
    pub size: String,
    pub width: u32,
    pub height: u32,
    pub stored_name: String,
    pub storage_path: String,
    pub url_path: String,
}

/// The lifecycle entity tracked end to end by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub user_id: String,
    pub file_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
    pub thumbnail_sizes: Vec<String>,
    pub thumbnails: Vec<Thumbnail>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Invariant 3: thumbnails non-empty iff completed.
    pub fn thumbnails_consistent(&self) -> bool {
        !self.thumbnails.is_empty() == (self.status == JobStatus::Completed)
    }

    /// Invariant 4: error non-empty iff failed.
    pub fn error_consistent(&self) -> bool {
        match self.status {
            JobStatus::Failed => self.error.as_deref().is_some_and(|e| !e.is_empty()),
            _ => self.error.is_none(),
        }
    }
}

/// Patch applied by `JobStore::set_status`.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub progress: Option<u8>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_can_reach_queued_processing_or_failed() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn processing_can_reach_terminal_states_or_itself() {
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Processing.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }
}
