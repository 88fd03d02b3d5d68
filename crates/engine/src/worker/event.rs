//! Worker events
//!
//! Workers never call into the coordinator. They enqueue [`WorkerEvent`]s on
//! an unbounded channel owned by the engine; the coordinating thread drains
//! it. Events from one worker arrive in emission order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::reliability::EmergencyReason;

/// Unique worker id, independent of the identity string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Generate a new time-ordered id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEventKind {
    /// Human-readable log line
    Log { text: String },

    /// Progress report
    Progress { percent: u8, status: String },

    /// Current pacing delay in seconds; `0` once the wait is over
    Delay { secs: u64 },

    /// Rate-limit hits are approaching the emergency threshold
    RateLimitWarning { consecutive: u32, threshold: u32 },

    /// The batch must stop
    Emergency { reason: EmergencyReason },

    /// The job body failed; at most one per worker, always before `Finished`
    Error { message: String },

    /// Terminal event, emitted exactly once
    Finished,
}

/// An event from one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    /// Worker that emitted the event
    pub worker_id: WorkerId,

    /// The worker's identity
    pub identity: Arc<str>,

    /// When the event was emitted
    pub at: DateTime<Utc>,

    /// Payload
    pub kind: WorkerEventKind,
}

impl WorkerEvent {
    /// Whether this is the worker's terminal event
    pub fn is_finished(&self) -> bool {
        matches!(self.kind, WorkerEventKind::Finished)
    }
}

/// Sending half handed to a worker when it starts
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    worker_id: WorkerId,
    identity: Arc<str>,
    tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSink {
    pub(crate) fn new(
        worker_id: WorkerId,
        identity: Arc<str>,
        tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            worker_id,
            identity,
            tx,
        }
    }

    /// Enqueue an event; a dropped engine just discards it
    pub(crate) fn emit(&self, kind: WorkerEventKind) {
        let event = WorkerEvent {
            worker_id: self.worker_id,
            identity: self.identity.clone(),
            at: Utc::now(),
            kind,
        };
        if self.tx.send(event).is_err() {
            trace!(worker_id = %self.worker_id, "Event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(WorkerId::new(), Arc::from("acct-1"), tx);

        sink.emit(WorkerEventKind::Log {
            text: "first".into(),
        });
        sink.emit(WorkerEventKind::Progress {
            percent: 50,
            status: "half".into(),
        });
        sink.emit(WorkerEventKind::Finished);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.identity.as_ref(), "acct-1");
        assert!(matches!(first.kind, WorkerEventKind::Log { .. }));
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            WorkerEventKind::Progress { percent: 50, .. }
        ));
        assert!(rx.recv().await.unwrap().is_finished());
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::new(WorkerId::new(), Arc::from("acct-2"), tx);
        sink.emit(WorkerEventKind::Finished);
    }

    #[test]
    fn test_event_serialization() {
        let event = WorkerEvent {
            worker_id: WorkerId::new(),
            identity: Arc::from("acct-3"),
            at: Utc::now(),
            kind: WorkerEventKind::Delay { secs: 4 },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"]["type"], "delay");
        assert_eq!(json["kind"]["secs"], 4);
    }

    #[test]
    fn test_worker_ids_are_unique() {
        assert_ne!(WorkerId::new(), WorkerId::new());
    }
}
