//! Lifecycle events and the sinks that consume them.

use crate::{
    models::object::ObjectRef,
    transfer::{error::BatchError, progress::BatchState},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifies one item of a batch in events and results.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ItemRef {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub transaction_id: String,
    /// The granted object the item addressed.
    pub object: ObjectRef,
}

/// One item that reached a terminal state, with the bytes it moved.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedItem {
    pub item: ItemRef,
    pub bytes: u64,
}

/// Per-batch lifecycle. A sink sees at most one `Started`, any number of
/// `InProgress`, then exactly one of `Completed`, `Cancelled` or `Error`.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Started {
        state: BatchState,
    },
    InProgress {
        state: BatchState,
        completed: Vec<CompletedItem>,
    },
    Completed {
        state: BatchState,
    },
    Cancelled {
        state: BatchState,
        cancelled: Vec<ItemRef>,
    },
    Error {
        state: BatchState,
        #[serde(serialize_with = "serialize_error")]
        error: Arc<BatchError>,
    },
}

fn serialize_error<S: serde::Serializer>(err: &Arc<BatchError>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&err.to_string())
}

impl LifecycleEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::Completed { .. }
                | LifecycleEvent::Cancelled { .. }
                | LifecycleEvent::Error { .. }
        )
    }

    pub fn state(&self) -> &BatchState {
        match self {
            LifecycleEvent::Started { state }
            | LifecycleEvent::InProgress { state, .. }
            | LifecycleEvent::Completed { state }
            | LifecycleEvent::Cancelled { state, .. }
            | LifecycleEvent::Error { state, .. } => state,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Started { .. } => "started",
            LifecycleEvent::InProgress { .. } => "in_progress",
            LifecycleEvent::Completed { .. } => "completed",
            LifecycleEvent::Cancelled { .. } => "cancelled",
            LifecycleEvent::Error { .. } => "error",
        }
    }
}

/// Consumer of lifecycle events.
///
/// Called from worker tasks; implementations must return promptly. Delivery
/// is fire-and-forget and never affects the outcome of a batch.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: LifecycleEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn on_event(&self, event: LifecycleEvent) {
        (**self).on_event(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: LifecycleEvent) {}
}

/// Forwards events to an unbounded channel; a closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink(mpsc::UnboundedSender<LifecycleEvent>);

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: LifecycleEvent) {
        let _ = self.0.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_event(LifecycleEvent::Completed {
            state: BatchState::new(0, None),
        });
    }

    #[test]
    fn events_serialize_with_their_tag() {
        let event = LifecycleEvent::Error {
            state: BatchState::new(2, None),
            error: Arc::new(BatchError::NoWorkers),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "error");
        assert!(value["error"].as_str().unwrap().contains("worker"));
        assert!(event.is_terminal());
    }
}
