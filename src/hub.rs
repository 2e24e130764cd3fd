//! Outbound requests to the hub.
//!
//! The manager never talks HTTP directly: it hands a form to a
//! [`HubSender`]. [`HttpHubSender`] is the production implementation; tests
//! substitute a recording double.

use crate::config::SubscriberConfig;
use crate::error::Result;
use crate::types::Mode;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::sync::Arc;

/// Verification modes offered to the hub, in order of preference.
pub const VERIFY_MODES: [&str; 2] = ["async", "sync"];

/// Form fields, in the order they are sent. Keys may repeat.
pub type Form = Vec<(&'static str, String)>;

/// A (un)subscribe request, before form encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubRequest {
    pub mode: Mode,
    pub topic: String,
    pub callback: String,
    pub verify_token: String,
    /// Omitted from the form when `None`.
    pub lease_seconds: Option<u64>,
}

impl HubRequest {
    /// Encode as `hub.*` form fields. `hub.verify` appears once per mode.
    pub fn to_form(&self) -> Form {
        let mut form: Form = vec![
            ("hub.mode", self.mode.as_str().to_string()),
            ("hub.topic", self.topic.clone()),
            ("hub.callback", self.callback.clone()),
        ];
        form.extend(VERIFY_MODES.iter().map(|mode| ("hub.verify", mode.to_string())));
        form.push(("hub.verify_token", self.verify_token.clone()));
        if let Some(lease_seconds) = self.lease_seconds {
            form.push(("hub.lease_seconds", lease_seconds.to_string()));
        }
        form
    }
}

/// What the hub answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubResponse {
    pub status: StatusCode,
    pub body: String,
}

impl HubResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Sends one form-encoded POST to a hub.
///
/// Implementations must not retry and must return within a bounded time.
pub trait HubSender: Send + Sync {
    fn send(&self, url: &str, form: &[(&'static str, String)]) -> Result<HubResponse>;
}

impl<T: HubSender + ?Sized> HubSender for Arc<T> {
    fn send(&self, url: &str, form: &[(&'static str, String)]) -> Result<HubResponse> {
        (**self).send(url, form)
    }
}

/// [`HubSender`] backed by a blocking `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpHubSender {
    client: Client,
}

impl HttpHubSender {
    /// Build a client with the configured timeout and user agent.
    pub fn new(config: &SubscriberConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;

        Ok(Self { client })
    }

    /// Use a pre-configured HTTP client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl HubSender for HttpHubSender {
    fn send(&self, url: &str, form: &[(&'static str, String)]) -> Result<HubResponse> {
        let response = self.client.post(url).form(form).send()?;
        let status = response.status();
        let body = response.text()?;

        tracing::debug!(hub = url, status = status.as_u16(), "hub responded");
        Ok(HubResponse { status, body })
    }
}
