//! Event Bus: topic-keyed publish/subscribe decoupled from the queue
//! implementation, a thin wrapper over `tokio::sync::broadcast`.
//!
//! Delivery is at-least-once, best-effort: `tokio::sync::broadcast` drops
//! the oldest message for lagging subscribers rather than blocking the
//! publisher, so publishing is non-blocking by contract and may drop under
//! backpressure.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Active,
    Progress,
    Completed,
    Failed,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Active => "job-active",
            Topic::Progress => "job-progress",
            Topic::Completed => "job-completed",
            Topic::Failed => "job-failed",
        }
    }
}

/// Tagged event payloads: a union discriminated by topic instead of a
/// loosely-typed JSON object per event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic")]
pub enum Event {
    #[serde(rename = "job-active")]
    Active { job_id: Uuid },

    #[serde(rename = "job-progress")]
    Progress { job_id: Uuid, progress: u8 },

    #[serde(rename = "job-completed")]
    Completed {
        job_id: Uuid,
        progress: u8,
        status: &'static str,
        returnvalue: CompletedPayload,
    },

    #[serde(rename = "job-failed")]
    Failed {
        job_id: Uuid,
        progress: u8,
        status: &'static str,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedPayload {
    pub thumbnails: Vec<String>,
}

impl Event {
    pub fn job_id(&self) -> Uuid {
        match self {
            Event::Active { job_id }
            | Event::Progress { job_id, .. }
            | Event::Completed { job_id, .. }
            | Event::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            Event::Active { .. } => Topic::Active,
            Event::Progress { .. } => Topic::Progress,
            Event::Completed { .. } => Topic::Completed,
            Event::Failed { .. } => Topic::Failed,
        }
    }

    pub fn completed(job_id: Uuid, thumbnail_urls: Vec<String>) -> Self {
        Event::Completed {
            job_id,
            progress: 100,
            status: "completed",
            returnvalue: CompletedPayload {
                thumbnails: thumbnail_urls,
            },
        }
    }

    pub fn failed(job_id: Uuid, error: impl Into<String>) -> Self {
        Event::Failed {
            job_id,
            progress: 0,
            status: "failed",
            error: error.into(),
        }
    }
}

/// Publish/subscribe bus carrying per-job lifecycle events. One bus instance
/// is shared by the queue and the worker for the lifetime of the process.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish never rejects: if there are no subscribers, or a lagging
    /// subscriber drops behind, the message is simply not delivered to it.
    /// The Job Store, not the bus, remains the source of truth.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let job_id = Uuid::new_v4();

        bus.publish(Event::Active { job_id });
        bus.publish(Event::Progress {
            job_id,
            progress: 40,
        });
        bus.publish(Event::completed(job_id, vec!["/uploads/thumbnails/a.jpg".into()]));

        assert_eq!(rx.recv().await.unwrap().topic(), Topic::Active);
        assert_eq!(rx.recv().await.unwrap().topic(), Topic::Progress);
        assert_eq!(rx.recv().await.unwrap().topic(), Topic::Completed);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.publish(Event::Active {
            job_id: Uuid::new_v4(),
        });
    }
}
