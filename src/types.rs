//! Core types for the subscriber.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lease requested from the hub when the caller does not pick one (30 days).
pub const DEFAULT_LEASE_SECONDS: u64 = 2_592_000;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Identifier of a subscription record, assigned by the store.
///
/// Its decimal form is the last path segment of the callback URL.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriptionId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(SubscriptionId)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// This timestamp moved forward by whole seconds (saturating).
    pub fn plus_seconds(self, seconds: u64) -> Self {
        let micros = i64::try_from(seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(MICROS_PER_SECOND);
        Timestamp(self.0.saturating_add(micros))
    }

    /// Whole seconds since the epoch.
    pub fn as_secs(self) -> i64 {
        self.0 / MICROS_PER_SECOND
    }

    /// Absolute distance to another timestamp, in seconds.
    pub fn abs_diff_secs(self, other: Timestamp) -> u64 {
        self.0.abs_diff(other.0) / MICROS_PER_SECOND as u64
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Handshake mode, sent as `hub.mode` and used as the verify token prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Subscribe,
    Unsubscribe,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Subscribe => "subscribe",
            Mode::Unsubscribe => "unsubscribe",
        }
    }

    /// Parse a `hub.mode` value. Unknown modes yield `None`.
    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "subscribe" => Some(Mode::Subscribe),
            "unsubscribe" => Some(Mode::Unsubscribe),
            _ => None,
        }
    }

    /// Whether a presented token was issued for this mode.
    ///
    /// `"unsubscribe…"` never passes as a subscribe token and vice versa.
    pub fn owns_token(self, token: &str) -> bool {
        token.starts_with(self.as_str())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscription to one topic on one hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub hub: String,
    /// Token of the handshake currently in flight, prefixed by its mode.
    pub verify_token: String,
    /// True only after a successful verification round.
    pub verified: bool,
    /// When the current lease is believed to end.
    pub lease_expires: Option<Timestamp>,
    pub created: Timestamp,
}

impl Subscription {
    /// Set the lease to end `lease_seconds` from now.
    pub fn set_expiration(&mut self, lease_seconds: u64) {
        self.lease_expires = Some(Timestamp::now().plus_seconds(lease_seconds));
    }

    /// Whether the lease ended at or before `now`. Records without a lease
    /// are never considered expired.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.lease_expires, Some(expires) if expires <= now)
    }

    /// Callback URL the hub should call for this record.
    pub fn callback_url(&self, base: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), self.id)
    }

    /// The mode the in-flight token belongs to.
    pub fn pending_mode(&self) -> Option<Mode> {
        if Mode::Unsubscribe.owns_token(&self.verify_token) {
            Some(Mode::Unsubscribe)
        } else if Mode::Subscribe.owns_token(&self.verify_token) {
            Some(Mode::Subscribe)
        } else {
            None
        }
    }
}

/// Input for creating a subscription record (the store assigns the id).
#[derive(Clone, Debug)]
pub struct NewSubscription {
    pub topic: String,
    pub hub: String,
    pub verify_token: String,
}

impl NewSubscription {
    pub fn new(topic: impl Into<String>, hub: impl Into<String>, verify_token: String) -> Self {
        Self {
            topic: topic.into(),
            hub: hub.into(),
            verify_token,
        }
    }

    /// Build the stored record.
    pub fn into_subscription(self, id: SubscriptionId) -> Subscription {
        Subscription {
            id,
            topic: self.topic,
            hub: self.hub,
            verify_token: self.verify_token,
            verified: false,
            lease_expires: None,
            created: Timestamp::now(),
        }
    }
}
