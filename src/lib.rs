//! # WebSub Subscriber
//!
//! The subscriber side of the PubSubHubbub (WebSub) protocol: subscribe to a
//! topic through a hub, answer the hub's verification callback and track the
//! lease of every subscription.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: records of one topic on one hub, with the token of
//!   the handshake in flight, a verified flag and a lease expiry
//! - **Manager**: sends (un)subscribe requests and interprets 202/204
//! - **Verification handler**: answers the hub's GET callback
//! - **Listeners**: receive an event when a subscription becomes verified
//!
//! ## Example
//!
//! ```ignore
//! use websub_subscriber::{FileStore, FileStoreConfig, SubscriberConfig, SubscriptionManager};
//!
//! let store = Arc::new(FileStore::open_or_create(FileStoreConfig {
//!     path: "./subscriptions".into(),
//!     ..Default::default()
//! })?);
//! let manager = SubscriptionManager::with_http(store, SubscriberConfig::default())?;
//!
//! // Ask the hub; it will call https://me.example/websub/{id}
//! let sub = manager.subscribe(
//!     "https://blog.example/feed",
//!     "https://hub.example/",
//!     "https://me.example/websub",
//!     None,
//! )?;
//!
//! // In the web layer, for GET /websub/{id}
//! let handler = manager.verification_handler();
//! let response = handler.handle(&CallbackRequest::from_url(Method::GET, &full_url)?);
//! ```

pub mod callback;
pub mod config;
pub mod error;
pub mod hub;
pub mod listeners;
pub mod manager;
pub mod store;
pub mod token;
pub mod types;

// Re-exports
pub use callback::{CallbackRequest, CallbackResponse, VerificationHandler};
pub use config::SubscriberConfig;
pub use error::{Result, SubscriberError};
pub use hub::{Form, HttpHubSender, HubRequest, HubResponse, HubSender, VERIFY_MODES};
pub use listeners::{
    DropReason, ListenerConfig, ListenerHandle, ListenerId, ListenerManager, SubscriberEvent,
};
pub use manager::SubscriptionManager;
pub use reqwest::{Method, StatusCode};
pub use store::{FileStore, FileStoreConfig, LogEntry, MemoryStore, SubscriptionLog, SubscriptionStore};
pub use token::generate_token;
pub use types::*;
