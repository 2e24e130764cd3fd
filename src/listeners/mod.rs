//! Notification fan-out for handshake outcomes.
//!
//! Application code that wants to know when a subscription goes live
//! registers a listener and receives [`SubscriberEvent`]s over a bounded
//! channel:
//! - `Verified` once per successful verification
//! - `Unsubscribed` when a hub confirms an unsubscribe synchronously
//!
//! Listeners may filter by topic. A listener whose buffer fills up is
//! dropped rather than blocking the handshake.
//!
//! # Example
//!
//! ```ignore
//! let listeners = ListenerManager::new();
//! let handle = listeners.listen(ListenerConfig::topics(vec![feed_url]));
//!
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         SubscriberEvent::Verified { subscription } => start_polling(&subscription),
//!         SubscriberEvent::Dropped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::ListenerManager;
pub use types::{DropReason, ListenerConfig, ListenerHandle, ListenerId, SubscriberEvent};
