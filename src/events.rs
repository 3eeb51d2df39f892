//! Engine events and the in-process event bus.
//!
//! Events are the only mechanism by which engine state leaves the engine:
//! UIs subscribe to the bus, and the history store persists the lifecycle
//! subset durably. Internally the bus is a `tokio::sync::broadcast` channel
//! with a bounded buffer; a subscriber that falls behind skips the oldest
//! entries rather than blocking the engine. Only `ITEM_PROGRESS` and `LOG`
//! are transient; every other event is persisted atomically with the state
//! change it describes and can be replayed via
//! [`HistoryStore::recent_events`](crate::history::HistoryStore::recent_events).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::history::{JobCounters, JobId, JobStatus};

/// Default buffer size for the broadcast channel.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Severity attached to `LOG` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal operational notice.
    Info,
    /// Something degraded but the run continues.
    Warning,
    /// A failure worth surfacing prominently.
    Error,
}

/// Typed event payloads. The serialized `type` tag uses the wire names
/// consumed by remote subscribers (`JOB_ADDED`, `ITEM_PROGRESS`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// A job entered the queue.
    JobAdded {
        /// Source URL as submitted.
        url: String,
        /// Tentative engine classification from URL-only resolution.
        engine: String,
        /// Destination root for the job.
        output_folder: String,
    },
    /// A worker picked the job up.
    JobStarted {
        /// Source URL.
        url: String,
        /// Final engine classification.
        engine: String,
    },
    /// An adapter began transferring one item.
    ItemStart {
        /// Canonical item identifier within the job.
        item_key: String,
        /// Direct URL of the media file.
        url: String,
        /// Expected size when known (Content-Length / HEAD probe).
        bytes_total: Option<u64>,
    },
    /// Throttled transfer progress for one item.
    ItemProgress {
        /// Canonical item identifier within the job.
        item_key: String,
        /// Bytes transferred so far.
        bytes_done: u64,
        /// Expected size when known.
        bytes_total: Option<u64>,
        /// Smoothed transfer speed in bytes/second.
        speed_bps: Option<f64>,
        /// Estimated seconds to completion.
        eta_s: Option<u64>,
    },
    /// An item finished successfully.
    ItemDone {
        /// Canonical item identifier within the job.
        item_key: String,
        /// Final destination path.
        file_path: String,
        /// Size on disk.
        bytes_total: u64,
    },
    /// An item was filtered out before (or instead of) transfer.
    ItemSkip {
        /// Canonical item identifier within the job.
        item_key: String,
        /// Human-readable reason (filter name, already-completed, ...).
        reason: String,
    },
    /// An item failed permanently.
    ItemFail {
        /// Canonical item identifier within the job.
        item_key: String,
        /// Human-readable error referencing the item.
        error: String,
    },
    /// Counters snapshot after any item reached a terminal state.
    JobProgress {
        /// Current counters.
        counters: JobCounters,
    },
    /// The job reached a terminal state.
    JobDone {
        /// Final status (COMPLETED, FAILED, or CANCELLED).
        status: JobStatus,
        /// Final counters.
        counters: JobCounters,
    },
    /// An unrecoverable fatal occurred (always followed by `JobDone`).
    JobError {
        /// Human-readable error referencing the job.
        error: String,
    },
    /// The job was cancelled.
    JobCancelled,
    /// Free-form diagnostic line.
    Log {
        /// The message text.
        message: String,
        /// Severity.
        level: LogLevel,
    },
}

impl EventKind {
    /// Returns the wire name, which is also the persisted `type` column.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::JobAdded { .. } => "JOB_ADDED",
            Self::JobStarted { .. } => "JOB_STARTED",
            Self::ItemStart { .. } => "ITEM_START",
            Self::ItemProgress { .. } => "ITEM_PROGRESS",
            Self::ItemDone { .. } => "ITEM_DONE",
            Self::ItemSkip { .. } => "ITEM_SKIP",
            Self::ItemFail { .. } => "ITEM_FAIL",
            Self::JobProgress { .. } => "JOB_PROGRESS",
            Self::JobDone { .. } => "JOB_DONE",
            Self::JobError { .. } => "JOB_ERROR",
            Self::JobCancelled => "JOB_CANCELLED",
            Self::Log { .. } => "LOG",
        }
    }

    /// True for high-volume events a lagging subscriber may miss.
    ///
    /// Everything else is persisted and replayable, so skipping on lag never
    /// loses lifecycle information.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ItemProgress { .. } | Self::Log { .. })
    }
}

/// One event instance on the bus, keyed by job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// The job this event belongs to.
    pub job_id: JobId,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// The typed payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl JobEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn now(job_id: JobId, kind: EventKind) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// In-process fan-out of engine events.
///
/// Cloning the bus is cheap; every clone publishes into the same channel.
/// Publishing never blocks: with no subscribers the event is dropped, and a
/// slow subscriber skips the oldest buffered entries instead of exerting
/// backpressure on the engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus with the given per-subscriber buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    pub fn publish(&self, event: JobEvent) {
        // A send error only means nobody is listening right now.
        if self.tx.send(event).is_err() {
            debug!("event published with no subscribers");
        }
    }

    /// Opens a new subscription starting at the current position.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of currently attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A subscriber handle over the bus. Dropping it unsubscribes.
pub struct EventStream {
    rx: broadcast::Receiver<JobEvent>,
}

impl EventStream {
    /// Receives the next event.
    ///
    /// Returns `None` once the bus is closed (engine shut down). When the
    /// subscriber has lagged behind the buffer, the skipped count is logged
    /// and reception continues from the oldest retained event.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; skipping oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when no event is ready.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; skipping oldest events");
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_event(job_id: JobId) -> JobEvent {
        JobEvent::now(
            job_id,
            EventKind::JobAdded {
                url: "https://example.site/user/alice".to_string(),
                engine: "generic".to_string(),
                output_folder: "/tmp/out".to_string(),
            },
        )
    }

    // ==================== Wire format ====================

    #[test]
    fn test_event_kind_type_names_match_wire_contract() {
        let kind = EventKind::ItemProgress {
            item_key: "a".to_string(),
            bytes_done: 10,
            bytes_total: Some(100),
            speed_bps: None,
            eta_s: None,
        };
        assert_eq!(kind.type_name(), "ITEM_PROGRESS");

        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "ITEM_PROGRESS");
        assert_eq!(json["bytes_done"], 10);
    }

    #[test]
    fn test_job_event_serializes_flat() {
        let event = sample_event(7);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["job_id"], 7);
        assert_eq!(json["type"], "JOB_ADDED");
        assert_eq!(json["url"], "https://example.site/user/alice");
    }

    #[test]
    fn test_job_cancelled_unit_variant_roundtrip() {
        let kind = EventKind::JobCancelled;
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#"{"type":"JOB_CANCELLED"}"#);
        let back: EventKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn test_transient_classification() {
        assert!(
            EventKind::Log {
                message: "x".to_string(),
                level: LogLevel::Info
            }
            .is_transient()
        );
        assert!(!EventKind::JobCancelled.is_transient());
    }

    // ==================== Bus behaviour ====================

    #[tokio::test]
    async fn test_bus_fans_out_to_all_subscribers() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(sample_event(1));

        assert_eq!(first.recv().await.unwrap().job_id, 1);
        assert_eq!(second.recv().await.unwrap().job_id, 1);
    }

    #[tokio::test]
    async fn test_bus_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.publish(sample_event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_bus_preserves_publish_order_per_subscriber() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();

        for job_id in 1..=5 {
            bus.publish(sample_event(job_id));
        }
        for expected in 1..=5 {
            assert_eq!(sub.recv().await.unwrap().job_id, expected);
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_oldest_but_continues() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        // Overflow the buffer: oldest entries are evicted.
        for job_id in 1..=10 {
            bus.publish(sample_event(job_id));
        }

        // The subscriber resumes from the oldest retained event.
        let first_seen = sub.recv().await.unwrap().job_id;
        assert!(first_seen >= 9, "expected to skip evicted events, got {first_seen}");
        let second_seen = sub.recv().await.unwrap().job_id;
        assert_eq!(second_seen, first_seen + 1);
    }

    #[tokio::test]
    async fn test_try_recv_returns_none_when_empty() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        assert!(sub.try_recv().is_none());

        bus.publish(sample_event(3));
        assert_eq!(sub.try_recv().unwrap().job_id, 3);
    }
}
