//! Listener types for handshake notifications.

use crate::types::Subscription;
use serde::{Deserialize, Serialize};

/// Configuration for a listener.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Max buffered events before dropping the listener.
    /// Default: 1000
    pub buffer_size: usize,

    /// Only deliver events for these topics (None = all topics).
    pub topics: Option<Vec<String>>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            topics: None,
        }
    }
}

impl ListenerConfig {
    /// Listen to events for specific topics.
    pub fn topics(topics: Vec<String>) -> Self {
        Self {
            topics: Some(topics),
            ..Default::default()
        }
    }
}

/// Events delivered to listeners.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberEvent {
    /// The hub verified a subscription.
    Verified { subscription: Subscription },

    /// The hub confirmed an unsubscribe.
    Unsubscribed { subscription: Subscription },

    /// Listener was dropped.
    Dropped { reason: DropReason },
}

impl SubscriberEvent {
    /// Topic the event is about, if any.
    pub fn topic(&self) -> Option<&str> {
        match self {
            SubscriberEvent::Verified { subscription }
            | SubscriberEvent::Unsubscribed { subscription } => Some(&subscription.topic),
            SubscriberEvent::Dropped { .. } => None,
        }
    }
}

/// Why a listener was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly removed.
    Unlistened,
}

/// Unique identifier for a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Handle to receive events.
pub struct ListenerHandle {
    pub id: ListenerId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<SubscriberEvent>,
}

impl ListenerHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<SubscriberEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<SubscriberEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<SubscriberEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
