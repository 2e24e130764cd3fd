//! Inbound side of the handshake: the hub's verification callback.
//!
//! The web layer turns an incoming request into a [`CallbackRequest`] and
//! writes the returned [`CallbackResponse`] back verbatim. Every way a
//! subscribe verification can fail to match a record (unknown id, token
//! with the wrong prefix, topic mismatch, token mismatch) produces the same
//! 404. The specific cause is only logged.

use crate::config::SubscriberConfig;
use crate::error::{Result, SubscriberError};
use crate::listeners::{ListenerManager, SubscriberEvent};
use crate::store::SubscriptionStore;
use crate::types::{Mode, SubscriptionId};
use reqwest::{Method, StatusCode, Url};
use std::sync::Arc;

/// A callback request as seen by the handler.
#[derive(Clone, Debug)]
pub struct CallbackRequest {
    pub method: Method,
    /// Last path segment of the callback URL.
    pub subscription_id: String,
    /// Decoded query parameters, in order. Keys may repeat; the last wins.
    pub params: Vec<(String, String)>,
}

impl CallbackRequest {
    /// A GET request with already-decoded parameters.
    pub fn get<K, V>(subscription_id: impl Into<String>, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            method: Method::GET,
            subscription_id: subscription_id.into(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Split a full callback URL (`{base}/{id}?hub.mode=…`) into id and
    /// decoded query parameters.
    pub fn from_url(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| SubscriberError::BadRequest(format!("invalid callback url: {e}")))?;

        let subscription_id = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            method,
            subscription_id,
            params: url.query_pairs().into_owned().collect(),
        })
    }

    /// Value for `key`. When a key repeats, the last value wins.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, key: &str) -> Result<&str> {
        self.param(key)
            .ok_or_else(|| SubscriberError::BadRequest(format!("missing {key}")))
    }
}

/// What to send back to the hub.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl CallbackResponse {
    /// 200 echoing the challenge.
    pub fn challenge(challenge: &str) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: "text/plain",
            body: challenge.to_string(),
        }
    }

    /// Empty error response.
    pub fn error(status: StatusCode) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: String::new(),
        }
    }
}

/// Handles verification callbacks from hubs.
pub struct VerificationHandler<S> {
    store: Arc<S>,
    listeners: Arc<ListenerManager>,
    config: SubscriberConfig,
}

impl<S: SubscriptionStore> VerificationHandler<S> {
    pub fn new(store: Arc<S>, listeners: Arc<ListenerManager>, config: SubscriberConfig) -> Self {
        Self {
            store,
            listeners,
            config,
        }
    }

    /// Answer a callback. Never panics on malformed input.
    pub fn handle(&self, request: &CallbackRequest) -> CallbackResponse {
        match self.verify(request) {
            Ok(challenge) => CallbackResponse::challenge(challenge),
            Err(e) => {
                let status = e.status_code();
                if status.is_server_error() {
                    tracing::error!(
                        subscription_id = %request.subscription_id,
                        error = %e,
                        "verification callback failed"
                    );
                }
                CallbackResponse::error(status)
            }
        }
    }

    /// Validate a callback and apply it. Returns the challenge to echo.
    pub fn verify<'r>(&self, request: &'r CallbackRequest) -> Result<&'r str> {
        if request.method != Method::GET {
            tracing::debug!(method = %request.method, "rejecting non-GET callback");
            return Err(SubscriberError::MethodNotAllowed(request.method.to_string()));
        }

        let mode = request.required("hub.mode")?;
        let topic = request.required("hub.topic")?;
        let challenge = request.required("hub.challenge")?;
        let verify_token = request.param("hub.verify_token").unwrap_or("");

        match Mode::from_param(mode) {
            Some(Mode::Subscribe) => {
                let lease_seconds = request
                    .param("hub.lease_seconds")
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(self.config.default_lease_seconds);
                self.confirm_subscribe(&request.subscription_id, topic, verify_token, lease_seconds)?;
            }
            Some(Mode::Unsubscribe) => {
                self.confirm_unsubscribe(&request.subscription_id, topic, verify_token)?;
            }
            None => {
                tracing::debug!(mode, "rejecting callback with unsupported mode");
                return Err(SubscriberError::BadRequest(format!(
                    "unsupported hub.mode {mode}"
                )));
            }
        }

        Ok(challenge)
    }

    /// Mark the matching record verified and refresh its lease, atomically.
    fn confirm_subscribe(
        &self,
        raw_id: &str,
        topic: &str,
        verify_token: &str,
        lease_seconds: u64,
    ) -> Result<()> {
        let id = self.matchable(raw_id, Mode::Subscribe, verify_token)?;

        let mut newly_verified = false;
        let updated = self.store.update(id, &mut |sub| {
            if sub.topic != topic || sub.verify_token != verify_token {
                return false;
            }
            newly_verified = !sub.verified;
            sub.verified = true;
            sub.set_expiration(lease_seconds);
            true
        })?;

        let Some(subscription) = updated else {
            self.log_mismatch(id, topic, verify_token);
            return Err(SubscriberError::NotFound);
        };

        if newly_verified {
            tracing::info!(
                subscription_id = %id,
                topic,
                lease_seconds,
                "subscription verified"
            );
            self.listeners
                .broadcast(SubscriberEvent::Verified { subscription });
        } else {
            tracing::debug!(subscription_id = %id, lease_seconds, "verification replayed, lease refreshed");
        }

        Ok(())
    }

    /// Confirm a pending unsubscribe. Read-only: nothing is changed.
    fn confirm_unsubscribe(&self, raw_id: &str, topic: &str, verify_token: &str) -> Result<()> {
        let id = self.matchable(raw_id, Mode::Unsubscribe, verify_token)?;

        if self.store.find_verifiable(id, topic, verify_token)?.is_none() {
            self.log_mismatch(id, topic, verify_token);
            return Err(SubscriberError::NotFound);
        }

        tracing::info!(subscription_id = %id, topic, "unsubscribe confirmed");
        Ok(())
    }

    /// Checks that need no store access: token prefix and id syntax.
    fn matchable(&self, raw_id: &str, mode: Mode, verify_token: &str) -> Result<SubscriptionId> {
        if !mode.owns_token(verify_token) {
            tracing::debug!(subscription_id = raw_id, %mode, "callback token has wrong prefix");
            return Err(SubscriberError::NotFound);
        }

        raw_id.parse().map_err(|_| {
            tracing::debug!(subscription_id = raw_id, "callback id is not a subscription id");
            SubscriberError::NotFound
        })
    }

    /// Logs why a callback found no record. The caller answers 404 either way.
    fn log_mismatch(&self, id: SubscriptionId, topic: &str, verify_token: &str) {
        let cause = match self.store.get(id) {
            Ok(None) => "unknown id",
            Ok(Some(sub)) if sub.topic != topic => "topic mismatch",
            Ok(Some(sub)) if sub.verify_token != verify_token => "token mismatch",
            Ok(Some(_)) => "record changed concurrently",
            Err(e) => {
                tracing::warn!(subscription_id = %id, error = %e, "store lookup failed while diagnosing callback");
                "store error"
            }
        };
        tracing::debug!(subscription_id = %id, topic, cause, "no subscription matches callback");
    }
}
