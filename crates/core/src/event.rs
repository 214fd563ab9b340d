//! Progress events: what a running turn reports while it works.
//!
//! A turn publishes events as it moves through its stages. Subscribers (the
//! SSE endpoint, the CLI renderer) receive them without ever slowing the turn
//! down: publishing never blocks, and a lagging or absent subscriber only
//! loses events.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted during a turn, serialized with a `type` tag for SSE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// The turn was accepted and runs detached from the request.
    JobAccepted { job_id: String },

    /// A pipeline stage started.
    StageStarted { stage: String },

    /// A stage context was assembled.
    ContextReady { stage: String, estimated_tokens: usize },

    /// A planned step started executing on the given tier.
    StepStarted {
        index: usize,
        description: String,
        tier: String,
    },

    /// A planned step finished.
    StepFinished {
        index: usize,
        outcome: String,
        note: String,
    },

    /// A raw completion delta (bypass modes only).
    Chunk { content: String },

    /// The turn completed and was committed.
    Done { turn_number: u32, reply: String },

    /// The turn failed before it could commit.
    Error { message: String },

    /// Keep-alive while the turn is idle.
    Ping,
}

impl ProgressEvent {
    /// Event name used as the SSE `event:` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobAccepted { .. } => "job_accepted",
            Self::StageStarted { .. } => "stage_started",
            Self::ContextReady { .. } => "context_ready",
            Self::StepStarted { .. } => "step_started",
            Self::StepFinished { .. } => "step_finished",
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
        }
    }

    /// Whether this event ends the turn's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

/// A broadcast-based event bus for progress events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<ProgressEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: ProgressEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ProgressEvent>> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(ProgressEvent::StepStarted {
            index: 0,
            description: "read pantry".into(),
            tier: "low".into(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            ProgressEvent::StepStarted { index, tier, .. } => {
                assert_eq!(*index, 0);
                assert_eq!(tier, "low");
            }
            _ => panic!("Expected StepStarted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(ProgressEvent::Error {
            message: "no subscribers".into(),
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(ProgressEvent::Done {
            turn_number: 3,
            reply: "ok".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["turn_number"], 3);
        assert_eq!(ProgressEvent::Ping.event_type(), "ping");
        assert!(ProgressEvent::Error { message: String::new() }.is_terminal());
        assert!(!ProgressEvent::Ping.is_terminal());
    }
}
