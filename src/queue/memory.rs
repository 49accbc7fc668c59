//! In-process `Queue`, used by worker tests so queue/worker invariants can
//! be checked deterministically without a live Postgres.
//!
//! State machine: `waiting -> active -> {completed, delayed -> waiting,
//! failed, stalled -> waiting}`. Stall
//! detection and delayed-requeue are both implemented with a "lease
//! version" per entry: a reservation spawns a timer that only acts if the
//! entry's version hasn't moved by the time it fires, so a concurrent
//! ack/nack/progress update silently invalidates any in-flight timer
//! without needing to cancel the task explicitly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{CleanKind, EnqueueOptions, Envelope, Queue, QueueEntry};
use crate::error::QueueError;
use crate::events::{Event, EventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

struct EntryRecord {
    entry_id: Uuid,
    payload: Envelope,
    attempt: u32,
    state: EntryState,
    priority: i64,
    inserted_at: Instant,
    lease_version: u64,
    finished_at: Option<Instant>,
}

struct Inner {
    entries: HashMap<Uuid, EntryRecord>,
    waiting: VecDeque<Uuid>,
    paused: bool,
    shut_down: bool,
}

pub struct InMemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    bus: Arc<EventBus>,
    max_attempts: u32,
    backoff_base: Duration,
    stall_window: Duration,
    self_weak: std::sync::Weak<InMemoryQueue>,
}

impl InMemoryQueue {
    pub fn new(
        bus: Arc<EventBus>,
        max_attempts: u32,
        backoff_base: Duration,
        stall_window: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                waiting: VecDeque::new(),
                paused: false,
                shut_down: false,
            }),
            notify: Notify::new(),
            bus,
            max_attempts,
            backoff_base,
            stall_window,
            self_weak: self_weak.clone(),
        })
    }

    pub async fn shutdown(&self) {
        self.inner.lock().await.shut_down = true;
        self.notify.notify_waiters();
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.pow(attempt.saturating_sub(1))
    }

    fn spawn_stall_checker(&self, job_id: Uuid, version: u64) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let window = self.stall_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            this.handle_timer(job_id, version, true).await;
        });
    }

    fn spawn_delay_requeue(&self, job_id: Uuid, version: u64, delay: Duration) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.handle_timer(job_id, version, false).await;
        });
    }

    /// Shared handler for both stall timers and delayed-requeue timers: acts
    /// only if the entry hasn't moved on since the timer was armed.
    async fn handle_timer(&self, job_id: Uuid, version: u64, is_stall_check: bool) {
        let mut inner = self.inner.lock().await;
        let Some(rec) = inner.entries.get_mut(&job_id) else {
            return;
        };
        if rec.lease_version != version {
            return;
        }
        if is_stall_check {
            if rec.state != EntryState::Active {
                return;
            }
            tracing::warn!(job_id = %job_id, attempt = rec.attempt, "queue entry stalled");
            self.requeue_or_fail(&mut inner, job_id);
        } else {
            if rec.state != EntryState::Delayed {
                return;
            }
            rec.state = EntryState::Waiting;
            inner.waiting.push_back(job_id);
            drop(inner);
            self.notify.notify_waiters();
        }
    }

    /// Counts the stall/nack as a spent attempt; reschedules with backoff if
    /// attempts remain, otherwise marks the entry terminally failed.
    fn requeue_or_fail(&self, inner: &mut Inner, job_id: Uuid) {
        let rec = inner.entries.get_mut(&job_id).unwrap();
        if rec.attempt < self.max_attempts {
            rec.state = EntryState::Waiting;
            rec.lease_version += 1;
            inner.waiting.push_back(job_id);
        } else {
            rec.state = EntryState::Failed;
            rec.finished_at = Some(Instant::now());
        }
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(
        &self,
        job_id: Uuid,
        payload: Envelope,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.entries.get(&job_id) {
            if matches!(
                existing.state,
                EntryState::Waiting | EntryState::Active | EntryState::Delayed
            ) {
                return Err(QueueError::AlreadyEnqueued(job_id));
            }
        }

        let entry_id = Uuid::new_v4();
        let record = EntryRecord {
            entry_id,
            payload,
            attempt: 0,
            state: EntryState::Waiting,
            priority: options.priority,
            inserted_at: Instant::now(),
            lease_version: 0,
            finished_at: None,
        };
        inner.entries.insert(job_id, record);

        match options.delay {
            None => {
                inner.waiting.push_back(job_id);
                drop(inner);
                self.notify.notify_waiters();
            }
            Some(delay) => {
                let rec = inner.entries.get_mut(&job_id).unwrap();
                rec.state = EntryState::Delayed;
                let version = rec.lease_version;
                drop(inner);
                self.spawn_delay_requeue(job_id, version, delay);
            }
        }
        Ok(())
    }

    async fn reserve(&self) -> Option<(QueueEntry, Envelope)> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.shut_down {
                    return None;
                }
                if !inner.paused {
                    // Global FIFO with priority as a tie-break only: scan
                    // the waiting set for the highest-priority, then
                    // earliest-inserted entry instead of a plain pop_front
                    // so priority only matters among jobs inserted at the
                    // same instant.
                    if let Some(pos) = self.pick_next(&inner) {
                        let job_id = inner.waiting.remove(pos).unwrap();
                        let rec = inner.entries.get_mut(&job_id).unwrap();
                        rec.state = EntryState::Active;
                        rec.attempt += 1;
                        rec.lease_version += 1;
                        let entry = QueueEntry {
                            id: rec.entry_id,
                            job_id,
                            attempt: rec.attempt,
                        };
                        let payload = rec.payload.clone();
                        let version = rec.lease_version;
                        drop(inner);
                        self.bus.publish(Event::Active { job_id });
                        self.spawn_stall_checker(job_id, version);
                        return Some((entry, payload));
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    async fn ack(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let rec = inner
            .entries
            .get_mut(&entry.job_id)
            .ok_or(QueueError::NotFound(entry.job_id))?;
        if rec.state != EntryState::Active || rec.entry_id != entry.id {
            return Err(QueueError::AlreadyAcked);
        }
        rec.state = EntryState::Completed;
        rec.lease_version += 1;
        rec.finished_at = Some(Instant::now());
        Ok(())
    }

    async fn nack(&self, entry: QueueEntry, error: &str, retryable: bool) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let rec = inner
            .entries
            .get_mut(&entry.job_id)
            .ok_or(QueueError::NotFound(entry.job_id))?;
        if rec.state != EntryState::Active || rec.entry_id != entry.id {
            return Err(QueueError::AlreadyAcked);
        }
        tracing::warn!(job_id = %entry.job_id, attempt = rec.attempt, %error, retryable, "job nacked");

        if retryable && rec.attempt < self.max_attempts {
            let delay = self.backoff_for(rec.attempt);
            rec.state = EntryState::Delayed;
            rec.lease_version += 1;
            let version = rec.lease_version;
            drop(inner);
            self.spawn_delay_requeue(entry.job_id, version, delay);
        } else {
            rec.state = EntryState::Failed;
            rec.finished_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn update_progress(&self, entry: QueueEntry, percent: u8) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let rec = inner
            .entries
            .get_mut(&entry.job_id)
            .ok_or(QueueError::NotFound(entry.job_id))?;
        if rec.state != EntryState::Active || rec.entry_id != entry.id {
            return Err(QueueError::AlreadyAcked);
        }
        // Renew the stall lease and re-arm the checker under the new version.
        rec.lease_version += 1;
        let version = rec.lease_version;
        drop(inner);
        self.spawn_stall_checker(entry.job_id, version);
        self.bus.publish(Event::Progress {
            job_id: entry.job_id,
            progress: percent,
        });
        Ok(())
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.entries.get(&job_id).map(|r| r.state) {
            Some(EntryState::Waiting) => {
                inner.waiting.retain(|id| *id != job_id);
                inner.entries.remove(&job_id);
                Ok(())
            }
            Some(_) => Ok(()), // best-effort: only waiting entries are removable
            None => Err(QueueError::NotFound(job_id)),
        }
    }

    async fn pause(&self) {
        self.inner.lock().await.paused = true;
    }

    async fn resume(&self) {
        let mut inner = self.inner.lock().await;
        inner.paused = false;
        drop(inner);
        self.notify.notify_waiters();
    }

    async fn clean(&self, older_than: Duration, kind: CleanKind) {
        let mut inner = self.inner.lock().await;
        let target = match kind {
            CleanKind::Completed => EntryState::Completed,
            CleanKind::Failed => EntryState::Failed,
        };
        let now = Instant::now();
        inner.entries.retain(|_, rec| {
            !(rec.state == target
                && rec
                    .finished_at
                    .is_some_and(|t| now.duration_since(t) >= older_than))
        });
    }
}

impl InMemoryQueue {
    fn pick_next(&self, inner: &Inner) -> Option<usize> {
        if inner.waiting.is_empty() {
            return None;
        }
        let mut best: Option<usize> = None;
        for (idx, job_id) in inner.waiting.iter().enumerate() {
            let rec = &inner.entries[job_id];
            best = Some(match best {
                None => idx,
                Some(b) => {
                    let b_rec = &inner.entries[&inner.waiting[b]];
                    if rec.priority > b_rec.priority
                        || (rec.priority == b_rec.priority && rec.inserted_at < b_rec.inserted_at)
                    {
                        idx
                    } else {
                        b
                    }
                }
            });
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FileKind;

    fn envelope(job_id: Uuid) -> Envelope {
        Envelope {
            job_id,
            file_id: Uuid::new_v4(),
            user_id: "user-1".into(),
            file_path: "/uploads/a.jpg".into(),
            kind: FileKind::Image,
            thumbnail_sizes: vec!["128x128".into()],
            output_dir: "/uploads/thumbnails".into(),
        }
    }

    #[tokio::test]
    async fn fifo_order_at_concurrency_one() {
        let bus = Arc::new(EventBus::new(64));
        let queue = InMemoryQueue::new(bus, 3, Duration::from_millis(10), Duration::from_secs(5));

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue
            .enqueue(a, envelope(a), EnqueueOptions::default())
            .await
            .unwrap();
        queue
            .enqueue(b, envelope(b), EnqueueOptions::default())
            .await
            .unwrap();

        let (first, _) = queue.reserve().await.unwrap();
        assert_eq!(first.job_id, a);
        queue.ack(first).await.unwrap();

        let (second, _) = queue.reserve().await.unwrap();
        assert_eq!(second.job_id, b);
    }

    #[tokio::test]
    async fn duplicate_enqueue_rejected_while_live() {
        let bus = Arc::new(EventBus::new(64));
        let queue = InMemoryQueue::new(bus, 3, Duration::from_millis(10), Duration::from_secs(5));
        let job_id = Uuid::new_v4();
        queue
            .enqueue(job_id, envelope(job_id), EnqueueOptions::default())
            .await
            .unwrap();
        let err = queue
            .enqueue(job_id, envelope(job_id), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::AlreadyEnqueued(_)));
    }

    #[tokio::test]
    async fn nack_with_attempts_remaining_reschedules() {
        let bus = Arc::new(EventBus::new(64));
        let queue =
            InMemoryQueue::new(bus, 2, Duration::from_millis(5), Duration::from_secs(5));
        let job_id = Uuid::new_v4();
        queue
            .enqueue(job_id, envelope(job_id), EnqueueOptions::default())
            .await
            .unwrap();

        let (entry, _) = queue.reserve().await.unwrap();
        assert_eq!(entry.attempt, 1);
        queue.nack(entry, "transient", true).await.unwrap();

        let (retry_entry, _) = queue.reserve().await.unwrap();
        assert_eq!(retry_entry.job_id, job_id);
        assert_eq!(retry_entry.attempt, 2);
    }

    #[tokio::test]
    async fn nack_after_max_attempts_is_terminal() {
        let bus = Arc::new(EventBus::new(64));
        let queue =
            InMemoryQueue::new(bus, 1, Duration::from_millis(5), Duration::from_secs(5));
        let job_id = Uuid::new_v4();
        queue
            .enqueue(job_id, envelope(job_id), EnqueueOptions::default())
            .await
            .unwrap();

        let (entry, _) = queue.reserve().await.unwrap();
        queue.nack(entry, "fatal", true).await.unwrap();

        // No more attempts: a fresh reserve must not hand this job back out.
        let second = tokio::time::timeout(Duration::from_millis(50), queue.reserve()).await;
        assert!(second.is_err(), "expected reserve to keep blocking");
    }

    #[tokio::test]
    async fn double_ack_is_rejected() {
        let bus = Arc::new(EventBus::new(64));
        let queue = InMemoryQueue::new(bus, 3, Duration::from_millis(10), Duration::from_secs(5));
        let job_id = Uuid::new_v4();
        queue
            .enqueue(job_id, envelope(job_id), EnqueueOptions::default())
            .await
            .unwrap();
        let (entry, _) = queue.reserve().await.unwrap();
        queue.ack(entry).await.unwrap();
        let err = queue.ack(entry).await.unwrap_err();
        assert!(matches!(err, QueueError::AlreadyAcked));
    }

    #[tokio::test]
    async fn stalled_entry_is_requeued_and_counts_an_attempt() {
        let bus = Arc::new(EventBus::new(64));
        let queue = InMemoryQueue::new(
            bus,
            3,
            Duration::from_millis(5),
            Duration::from_millis(20),
        );
        let job_id = Uuid::new_v4();
        queue
            .enqueue(job_id, envelope(job_id), EnqueueOptions::default())
            .await
            .unwrap();

        let (entry, _) = queue.reserve().await.unwrap();
        assert_eq!(entry.attempt, 1);

        // Never ack/nack/progress: let the stall window elapse.
        let (retried, _) = queue.reserve().await.unwrap();
        assert_eq!(retried.job_id, job_id);
        assert_eq!(retried.attempt, 2);
    }
}
