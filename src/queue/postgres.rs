//! Postgres-backed `Queue`.
//!
//! The reservation query is a `SELECT ... FOR UPDATE SKIP LOCKED` CTE
//! ordered by insertion time, folded into an `UPDATE ... RETURNING` that
//! atomically flips the claimed row to `active` and stamps a lease. Schema
//! is documented in `schema.sql`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use super::{CleanKind, EnqueueOptions, Envelope, Queue, QueueEntry};
use crate::error::QueueError;
use crate::events::{Event, EventBus};

pub struct PostgresQueue {
    pool: PgPool,
    bus: Arc<EventBus>,
    max_attempts: u32,
    backoff_base_ms: u64,
    stall_window: Duration,
    poll_interval: Duration,
}

impl PostgresQueue {
    pub fn new(
        pool: PgPool,
        bus: Arc<EventBus>,
        max_attempts: u32,
        backoff_base_ms: u64,
        stall_window: Duration,
    ) -> Self {
        Self {
            pool,
            bus,
            max_attempts,
            backoff_base_ms,
            stall_window,
            poll_interval: Duration::from_millis(200),
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms * 2u64.pow(attempt.saturating_sub(1)))
    }
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: Uuid,
    job_id: Uuid,
    payload: serde_json::Value,
    attempt: i32,
}

#[async_trait]
impl Queue for PostgresQueue {
    async fn enqueue(
        &self,
        job_id: Uuid,
        payload: Envelope,
        options: EnqueueOptions,
    ) -> Result<(), QueueError> {
        let entry_id = Uuid::new_v4();
        let payload_json = serde_json::to_value(&payload).unwrap();
        let available_at = Utc::now()
            + chrono::Duration::from_std(options.delay.unwrap_or_default()).unwrap_or_default();
        let state = if options.delay.is_some() {
            "delayed"
        } else {
            "waiting"
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_queue (id, job_id, payload, state, priority, attempt, available_at, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, NOW())
            ON CONFLICT (job_id) WHERE state IN ('waiting', 'active', 'delayed') DO NOTHING
            "#,
        )
        .bind(entry_id)
        .bind(job_id)
        .bind(payload_json)
        .bind(state)
        .bind(options.priority)
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(QueueError::AlreadyEnqueued(job_id));
        }
        Ok(())
    }

    async fn reserve(&self) -> Option<(QueueEntry, Envelope)> {
        loop {
            let claim_result: Result<Option<ClaimedRow>, sqlx::Error> = sqlx::query_as(
                r#"
                WITH claimed AS (
                    SELECT id
                    FROM job_queue
                    WHERE state = 'waiting' AND available_at <= NOW()
                      AND NOT (SELECT paused FROM queue_state WHERE id = 1)
                    ORDER BY priority DESC, available_at ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE job_queue q
                SET state = 'active',
                    attempt = q.attempt + 1,
                    lease_until = NOW() + ($1::text || ' milliseconds')::interval
                FROM claimed
                WHERE q.id = claimed.id
                RETURNING q.id, q.job_id, q.payload, q.attempt
                "#,
            )
            .bind(self.stall_window.as_millis().to_string())
            .fetch_optional(&self.pool)
            .await;

            let claimed = match claim_result {
                Ok(row) => row,
                Err(e) => {
                    tracing::error!(error = %e, "queue claim failed, backing off");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            if let Some(row) = claimed {
                let payload: Envelope = serde_json::from_value(row.payload).ok()?;
                let entry = QueueEntry {
                    id: row.id,
                    job_id: row.job_id,
                    attempt: row.attempt as u32,
                };
                self.bus.publish(Event::Active {
                    job_id: row.job_id,
                });
                return Some((entry, payload));
            }

            // Also reclaim entries whose lease has expired (stalled workers).
            let _ = self.reclaim_stalled().await;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE job_queue SET state = 'completed' WHERE id = $1 AND job_id = $2 AND state = 'active'",
        )
        .bind(entry.id)
        .bind(entry.job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::AlreadyAcked);
        }
        Ok(())
    }

    async fn nack(&self, entry: QueueEntry, error: &str, retryable: bool) -> Result<(), QueueError> {
        tracing::warn!(job_id = %entry.job_id, attempt = entry.attempt, %error, retryable, "job nacked");
        if retryable && entry.attempt < self.max_attempts {
            let delay = self.backoff_for(entry.attempt);
            let result = sqlx::query(
                r#"
                UPDATE job_queue
                SET state = 'delayed',
                    available_at = NOW() + ($3::text || ' milliseconds')::interval,
                    last_error = $4
                WHERE id = $1 AND job_id = $2 AND state = 'active'
                "#,
            )
            .bind(entry.id)
            .bind(entry.job_id)
            .bind(delay.as_millis().to_string())
            .bind(error)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(QueueError::AlreadyAcked);
            }
            self.requeue_delayed_when_due(entry.job_id, delay);
        } else {
            let result = sqlx::query(
                "UPDATE job_queue SET state = 'failed', last_error = $3 WHERE id = $1 AND job_id = $2 AND state = 'active'",
            )
            .bind(entry.id)
            .bind(entry.job_id)
            .bind(error)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(QueueError::AlreadyAcked);
            }
        }
        Ok(())
    }

    async fn update_progress(&self, entry: QueueEntry, percent: u8) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET lease_until = NOW() + ($3::text || ' milliseconds')::interval
            WHERE id = $1 AND job_id = $2 AND state = 'active'
            "#,
        )
        .bind(entry.id)
        .bind(entry.job_id)
        .bind(self.stall_window.as_millis().to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::AlreadyAcked);
        }
        self.bus.publish(Event::Progress {
            job_id: entry.job_id,
            progress: percent,
        });
        Ok(())
    }

    async fn remove(&self, job_id: Uuid) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE job_id = $1 AND state = 'waiting'")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(job_id));
        }
        Ok(())
    }

    async fn pause(&self) {
        let _ = sqlx::query("UPDATE queue_state SET paused = TRUE WHERE id = 1")
            .execute(&self.pool)
            .await;
    }

    async fn resume(&self) {
        let _ = sqlx::query("UPDATE queue_state SET paused = FALSE WHERE id = 1")
            .execute(&self.pool)
            .await;
    }

    async fn clean(&self, older_than: Duration, kind: CleanKind) {
        let state = match kind {
            CleanKind::Completed => "completed",
            CleanKind::Failed => "failed",
        };
        let _ = sqlx::query(
            "DELETE FROM job_queue WHERE state = $1 AND available_at < NOW() - ($2::text || ' milliseconds')::interval",
        )
        .bind(state)
        .bind(older_than.as_millis().to_string())
        .execute(&self.pool)
        .await;
    }
}

impl PostgresQueue {
    async fn reclaim_stalled(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE job_queue SET state = 'waiting', available_at = NOW() \
             WHERE state = 'active' AND lease_until < NOW() AND attempt < $1",
        )
        .bind(self.max_attempts as i32)
        .execute(&self.pool)
        .await?;
        let failed = sqlx::query(
            "UPDATE job_queue SET state = 'failed', last_error = 'stalled' \
             WHERE state = 'active' AND lease_until < NOW() AND attempt >= $1",
        )
        .bind(self.max_attempts as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() + failed.rows_affected())
    }

    /// Best-effort nudge so a delayed entry is picked up promptly once its
    /// backoff elapses, instead of waiting for the next poll tick to notice
    /// `available_at <= NOW()` on its own (which still happens regardless).
    fn requeue_delayed_when_due(&self, job_id: Uuid, delay: Duration) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sqlx::query(
                "UPDATE job_queue SET state = 'waiting' WHERE job_id = $1 AND state = 'delayed'",
            )
            .bind(job_id)
            .execute(&pool)
            .await;
        });
    }
}
