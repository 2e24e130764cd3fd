//! Subscriber configuration.

use crate::types::DEFAULT_LEASE_SECONDS;
use std::time::Duration;

/// Settings shared by the subscription manager and the callback handler.
#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    /// Lease requested when the caller does not pick one, and applied when a
    /// verification callback carries no usable `hub.lease_seconds`.
    /// Default: 2592000 (30 days)
    pub default_lease_seconds: u64,

    /// Upper bound on a single hub request, connect included.
    /// Default: 30s
    pub request_timeout: Duration,

    /// `User-Agent` sent to hubs.
    pub user_agent: String,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            default_lease_seconds: DEFAULT_LEASE_SECONDS,
            request_timeout: Duration::from_secs(30),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
