//! Listener registry and event broadcasting.

use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{DropReason, ListenerConfig, ListenerHandle, ListenerId, SubscriberEvent};

/// Internal listener state.
struct Listener {
    config: ListenerConfig,
    sender: Sender<SubscriberEvent>,
}

impl Listener {
    /// Try to send an event. Returns false if the buffer is full or the
    /// receiver is gone (listener will be dropped).
    fn try_send(&self, event: SubscriberEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    fn wants(&self, event: &SubscriberEvent) -> bool {
        match (&self.config.topics, event.topic()) {
            (Some(topics), Some(topic)) => topics.iter().any(|t| t == topic),
            _ => true,
        }
    }
}

/// Registered listeners, keyed by id.
pub struct ListenerManager {
    listeners: RwLock<HashMap<ListenerId, Listener>>,
    /// Counter for generating listener ids.
    next_id: AtomicU64,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener.
    pub fn listen(&self, config: ListenerConfig) -> ListenerHandle {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);

        self.listeners
            .write()
            .insert(id, Listener { config, sender });

        ListenerHandle { id, receiver }
    }

    /// Remove a listener.
    pub fn unlisten(&self, id: ListenerId) {
        if let Some(listener) = self.listeners.write().remove(&id) {
            // Best effort
            let _ = listener.sender.try_send(SubscriberEvent::Dropped {
                reason: DropReason::Unlistened,
            });
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver an event to every interested listener. Never blocks; drops
    /// listeners that fail to receive.
    pub fn broadcast(&self, event: SubscriberEvent) {
        let mut to_remove = Vec::new();

        {
            let listeners = self.listeners.read();
            for (id, listener) in listeners.iter() {
                if listener.wants(&event) && !listener.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut listeners = self.listeners.write();
            for id in to_remove {
                if let Some(listener) = listeners.remove(&id) {
                    tracing::warn!(listener = id.0, "dropping listener with full buffer");
                    let _ = listener.sender.try_send(SubscriberEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for ListenerManager {
    fn default() -> Self {
        Self::new()
    }
}
