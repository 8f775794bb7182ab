//! Fire-and-forget telemetry stream.
//!
//! The orchestrator publishes one event per job lifecycle edge over a
//! `tokio::sync::broadcast` channel. Rendering is out of scope here;
//! subscribers (dashboards, log shippers) attach at their own risk -
//! publishing with no receivers is not an error, and a lagged receiver
//! skips ahead rather than stalling the publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Error, Result};

/// Broadcast channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Job lifecycle edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Finished,
    Failed,
}

/// One telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub status: EventStatus,
    pub workflow_id: String,
    pub job_id: String,
    pub kind: String,
    /// Wall time of the work, present on terminal events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn started(workflow_id: &str, job_id: &str, kind: &str) -> Self {
        Self {
            status: EventStatus::Started,
            workflow_id: workflow_id.to_string(),
            job_id: job_id.to_string(),
            kind: kind.to_string(),
            duration_ms: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn finished(workflow_id: &str, job_id: &str, kind: &str, duration_ms: u64) -> Self {
        Self {
            status: EventStatus::Finished,
            workflow_id: workflow_id.to_string(),
            job_id: job_id.to_string(),
            kind: kind.to_string(),
            duration_ms: Some(duration_ms),
            error: None,
            at: Utc::now(),
        }
    }

    pub fn failed(
        workflow_id: &str,
        job_id: &str,
        kind: &str,
        duration_ms: u64,
        error: &str,
    ) -> Self {
        Self {
            status: EventStatus::Failed,
            workflow_id: workflow_id.to_string(),
            job_id: job_id.to_string(),
            kind: kind.to_string(),
            duration_ms: Some(duration_ms),
            error: Some(error.to_string()),
            at: Utc::now(),
        }
    }
}

/// In-process event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: JobEvent) {
        // If there are no receivers, send returns Err but that's fine -
        // it just means nobody is listening yet.
        match self.tx.send(event) {
            Ok(count) => debug!("Published job event to {} receiver(s)", count),
            Err(_) => debug!("Published job event but no active receivers"),
        }
    }

    /// Create a new receiver that will get future published events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver wrapping `tokio::sync::broadcast::Receiver`.
pub struct EventReceiver {
    rx: broadcast::Receiver<JobEvent>,
}

impl EventReceiver {
    /// Wait for the next event.
    ///
    /// Returns `Err` if the bus has been dropped.
    pub async fn recv(&mut self) -> Result<JobEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event receiver lagged by {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Internal(
                        "Event broadcast channel closed".to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(JobEvent::started("w1", "fetch-1", "fetch"));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.status, EventStatus::Started);
        assert_eq!(event.workflow_id, "w1");
        assert_eq!(event.job_id, "fetch-1");
        assert_eq!(event.duration_ms, None);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(JobEvent::finished("w1", "fetch-1", "fetch", 12));

        assert_eq!(rx1.recv().await.unwrap().duration_ms, Some(12));
        assert_eq!(rx2.recv().await.unwrap().duration_ms, Some(12));
    }

    #[tokio::test]
    async fn test_publish_with_no_receivers_is_ok() {
        let bus = EventBus::new();
        bus.publish(JobEvent::failed("w1", "fetch-1", "fetch", 3, "boom"));
    }

    #[test]
    fn test_failed_event_serializes_error() {
        let event = JobEvent::failed("w1", "fetch-1", "fetch", 3, "boom");
        let raw = serde_json::to_string(&event).unwrap();
        assert!(raw.contains("\"failed\""));
        assert!(raw.contains("boom"));

        let started = JobEvent::started("w1", "fetch-1", "fetch");
        let raw = serde_json::to_string(&started).unwrap();
        // absent optional fields are omitted entirely
        assert!(!raw.contains("duration_ms"));
        assert!(!raw.contains("error"));
    }
}
