//! Outbound side of the handshake.
//!
//! [`SubscriptionManager::subscribe`] persists a pending record, asks the hub
//! for a subscription and interprets the synchronous answer:
//!
//! | hub status | outcome |
//! |---|---|
//! | 204 | verified now, lease starts |
//! | 202 | pending, provisional lease; the hub calls back later |
//! | other | [`SubscriberError::Protocol`], record not reported as subscribed |
//!
//! Exactly one request is sent per call. Retrying is left to the caller.

use crate::callback::VerificationHandler;
use crate::config::SubscriberConfig;
use crate::error::{Result, SubscriberError};
use crate::hub::{HttpHubSender, HubRequest, HubSender};
use crate::listeners::{ListenerManager, SubscriberEvent};
use crate::store::SubscriptionStore;
use crate::token::generate_token;
use crate::types::{Mode, NewSubscription, Subscription, SubscriptionId, Timestamp};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

/// Issues (un)subscribe requests and records their outcome.
pub struct SubscriptionManager<S, H = HttpHubSender> {
    store: Arc<S>,
    sender: H,
    listeners: Arc<ListenerManager>,
    config: SubscriberConfig,
}

impl<S: SubscriptionStore> SubscriptionManager<S, HttpHubSender> {
    /// Manager talking to hubs over HTTP.
    pub fn with_http(store: Arc<S>, config: SubscriberConfig) -> Result<Self> {
        let sender = HttpHubSender::new(&config)?;
        Ok(Self::new(store, sender, Arc::new(ListenerManager::new()), config))
    }
}

impl<S: SubscriptionStore, H: HubSender> SubscriptionManager<S, H> {
    pub fn new(
        store: Arc<S>,
        sender: H,
        listeners: Arc<ListenerManager>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            store,
            sender,
            listeners,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn listeners(&self) -> &Arc<ListenerManager> {
        &self.listeners
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Callback handler sharing this manager's store, listeners and config.
    pub fn verification_handler(&self) -> VerificationHandler<S> {
        VerificationHandler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.listeners),
            self.config.clone(),
        )
    }

    /// Subscribe to `topic` through `hub`.
    ///
    /// The hub is told to call `{callback_base}/{id}`. `lease_seconds`
    /// defaults to [`SubscriberConfig::default_lease_seconds`]. An existing
    /// record for the same topic and hub is reused and goes back to pending
    /// with a new token.
    pub fn subscribe(
        &self,
        topic: &str,
        hub: &str,
        callback_base: &str,
        lease_seconds: Option<u64>,
    ) -> Result<Subscription> {
        let lease_seconds = lease_seconds.unwrap_or(self.config.default_lease_seconds);
        let token = generate_token(Mode::Subscribe);
        let (pending, created) = self.prepare(topic, hub, &token)?;

        let request = HubRequest {
            mode: Mode::Subscribe,
            topic: topic.to_string(),
            callback: pending.callback_url(callback_base),
            verify_token: token.clone(),
            lease_seconds: Some(lease_seconds),
        };

        let response = match self.sender.send(hub, &request.to_form()) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(topic, hub, error = %e, "subscribe request failed");
                self.abandon(&pending, created, &token)?;
                return Err(e);
            }
        };

        match response.status {
            StatusCode::NO_CONTENT => self.accept(&pending, &token, lease_seconds, true),
            StatusCode::ACCEPTED => self.accept(&pending, &token, lease_seconds, false),
            status => {
                tracing::warn!(
                    subscription_id = %pending.id,
                    topic,
                    hub,
                    status = status.as_u16(),
                    "hub rejected subscribe request"
                );
                self.abandon(&pending, created, &token)?;
                Err(SubscriberError::subscribing(topic, hub, response.body))
            }
        }
    }

    /// Ask the hub to end a subscription.
    ///
    /// On 204 the record becomes unverified with no lease and listeners get
    /// [`SubscriberEvent::Unsubscribed`]. On 202 the unsubscribe token is
    /// stored and the record is otherwise untouched until the hub confirms.
    pub fn unsubscribe(&self, id: SubscriptionId, callback_base: &str) -> Result<Subscription> {
        let current = self.store.get(id)?.ok_or(SubscriberError::NotFound)?;
        let previous_token = current.verify_token.clone();
        let token = generate_token(Mode::Unsubscribe);

        let pending = self
            .store
            .update(id, &mut |sub| {
                sub.verify_token = token.clone();
                true
            })?
            .ok_or(SubscriberError::NotFound)?;

        let request = HubRequest {
            mode: Mode::Unsubscribe,
            topic: pending.topic.clone(),
            callback: pending.callback_url(callback_base),
            verify_token: token.clone(),
            lease_seconds: None,
        };

        let response = match self.sender.send(&pending.hub, &request.to_form()) {
            Ok(response) => response,
            Err(e) => {
                self.restore_token(id, &token, previous_token)?;
                return Err(e);
            }
        };

        match response.status {
            StatusCode::NO_CONTENT => {
                let done = self
                    .store
                    .update(id, &mut |sub| {
                        if sub.verify_token != token {
                            return false;
                        }
                        sub.verified = false;
                        sub.lease_expires = None;
                        true
                    })?
                    .ok_or_else(|| self.superseded(&pending))?;

                tracing::info!(subscription_id = %id, topic = %done.topic, "unsubscribed");
                self.listeners.broadcast(SubscriberEvent::Unsubscribed {
                    subscription: done.clone(),
                });
                Ok(done)
            }
            StatusCode::ACCEPTED => {
                tracing::info!(subscription_id = %id, topic = %pending.topic, "unsubscribe pending");
                Ok(pending)
            }
            status => {
                tracing::warn!(
                    subscription_id = %id,
                    hub = %pending.hub,
                    status = status.as_u16(),
                    "hub rejected unsubscribe request"
                );
                self.restore_token(id, &token, previous_token)?;
                Err(SubscriberError::unsubscribing(
                    &pending.topic,
                    &pending.hub,
                    response.body,
                ))
            }
        }
    }

    /// Re-subscribe an existing record with the default lease.
    pub fn renew(&self, id: SubscriptionId, callback_base: &str) -> Result<Subscription> {
        let current = self.store.get(id)?.ok_or(SubscriberError::NotFound)?;
        self.subscribe(&current.topic, &current.hub, callback_base, None)
    }

    /// Records whose lease ends within `window` from now (already expired
    /// ones included). Input for a renewal scheduler.
    pub fn expiring_within(&self, window: Duration) -> Result<Vec<Subscription>> {
        let deadline = Timestamp::now().plus_seconds(window.as_secs());
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|sub| matches!(sub.lease_expires, Some(expires) if expires <= deadline))
            .collect())
    }

    /// Load or create the record for `{topic, hub}` and reset it to pending
    /// with `token`. Returns the record and whether it was created.
    fn prepare(&self, topic: &str, hub: &str, token: &str) -> Result<(Subscription, bool)> {
        let (sub, created) = self
            .store
            .insert_or_reset(NewSubscription::new(topic, hub, token.to_string()))?;

        if created {
            tracing::debug!(subscription_id = %sub.id, topic, hub, "created pending subscription");
        } else {
            tracing::debug!(subscription_id = %sub.id, topic, hub, "resubscribing");
        }
        Ok((sub, created))
    }

    /// Record a 202/204 answer. Only applies while `token` is still the one
    /// in flight; otherwise a newer request owns the record and the answer
    /// is reported as [`SubscriberError::Superseded`].
    fn accept(
        &self,
        pending: &Subscription,
        token: &str,
        lease_seconds: u64,
        verified_now: bool,
    ) -> Result<Subscription> {
        let id = pending.id;
        let mut newly_verified = false;
        let accepted = self
            .store
            .update(id, &mut |sub| {
                if sub.verify_token != token {
                    return false;
                }
                if verified_now {
                    newly_verified = !sub.verified;
                    sub.verified = true;
                    sub.set_expiration(lease_seconds);
                } else if !sub.verified {
                    // A callback that already verified this token set the
                    // authoritative lease.
                    sub.set_expiration(lease_seconds);
                }
                true
            })?
            .ok_or_else(|| self.superseded(pending))?;

        tracing::info!(
            subscription_id = %id,
            topic = %accepted.topic,
            hub = %accepted.hub,
            verified = accepted.verified,
            "subscribe request accepted"
        );

        if newly_verified {
            self.listeners.broadcast(SubscriberEvent::Verified {
                subscription: accepted.clone(),
            });
        }
        Ok(accepted)
    }

    /// Undo a failed subscribe so it is never reported as subscribed.
    fn abandon(&self, pending: &Subscription, created: bool, token: &str) -> Result<()> {
        if created {
            self.store.remove(pending.id)?;
        } else {
            self.store.update(pending.id, &mut |sub| {
                if sub.verify_token != token {
                    return false;
                }
                sub.verified = false;
                true
            })?;
        }
        Ok(())
    }

    fn superseded(&self, pending: &Subscription) -> SubscriberError {
        tracing::warn!(
            subscription_id = %pending.id,
            topic = %pending.topic,
            hub = %pending.hub,
            "hub answer arrived after a newer request took over the record"
        );
        SubscriberError::Superseded {
            topic: pending.topic.clone(),
            hub: pending.hub.clone(),
        }
    }

    fn restore_token(&self, id: SubscriptionId, token: &str, previous: String) -> Result<()> {
        self.store.update(id, &mut |sub| {
            if sub.verify_token != token {
                return false;
            }
            sub.verify_token = previous.clone();
            true
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::HubResponse;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;

    /// Hub double: records requests, replays queued responses.
    #[derive(Default)]
    struct MockHub {
        requests: Mutex<Vec<(String, Vec<(&'static str, String)>)>>,
        responses: Mutex<Vec<Result<HubResponse>>>,
    }

    impl MockHub {
        fn respond(&self, status: StatusCode, body: &str) {
            self.responses.lock().push(Ok(HubResponse::new(status, body)));
        }

        fn fail(&self, message: &str) {
            self.responses
                .lock()
                .push(Err(SubscriberError::Transport(message.to_string())));
        }

        fn field(&self, index: usize, key: &str) -> Vec<String> {
            self.requests.lock()[index]
                .1
                .iter()
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .collect()
        }
    }

    impl HubSender for MockHub {
        fn send(&self, url: &str, form: &[(&'static str, String)]) -> Result<HubResponse> {
            self.requests.lock().push((url.to_string(), form.to_vec()));
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(SubscriberError::Transport("no response queued".into())))
        }
    }

    fn manager() -> (SubscriptionManager<MemoryStore, Arc<MockHub>>, Arc<MockHub>) {
        let hub = Arc::new(MockHub::default());
        let manager = SubscriptionManager::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&hub),
            Arc::new(ListenerManager::new()),
            SubscriberConfig::default(),
        );
        (manager, hub)
    }

    fn assert_lease_near(sub: &Subscription, seconds: u64) {
        let expected = Timestamp::now().plus_seconds(seconds);
        let actual = sub.lease_expires.expect("lease set");
        assert!(
            actual.abs_diff_secs(expected) < 5,
            "lease more than 5 seconds off"
        );
    }

    #[test]
    fn test_sync_verify() {
        let (manager, hub) = manager();
        hub.respond(StatusCode::NO_CONTENT, "");

        let sub = manager
            .subscribe("topic", "hub", "callback", Some(2000))
            .unwrap();
        assert_eq!(sub.hub, "hub");
        assert_eq!(sub.topic, "topic");
        assert!(sub.verified);
        assert_lease_near(&sub, 2000);

        assert_eq!(hub.requests.lock().len(), 1);
        assert_eq!(hub.requests.lock()[0].0, "hub");
        assert_eq!(hub.field(0, "hub.mode"), vec!["subscribe"]);
        assert_eq!(hub.field(0, "hub.topic"), vec!["topic"]);
        assert_eq!(hub.field(0, "hub.callback"), vec![format!("callback/{}", sub.id)]);
        assert_eq!(hub.field(0, "hub.verify"), vec!["async", "sync"]);
        assert_eq!(hub.field(0, "hub.verify_token"), vec![sub.verify_token.clone()]);
        assert_eq!(hub.field(0, "hub.lease_seconds"), vec!["2000"]);

        assert_eq!(manager.store().get(sub.id).unwrap().unwrap(), sub);
    }

    #[test]
    fn test_async_verify() {
        let (manager, hub) = manager();
        hub.respond(StatusCode::ACCEPTED, "");

        let sub = manager
            .subscribe("topic", "hub", "callback", Some(2000))
            .unwrap();
        assert!(!sub.verified);
        assert!(sub.verify_token.starts_with("subscribe"));
        assert_lease_near(&sub, 2000);
        assert_eq!(hub.field(0, "hub.verify_token"), vec![sub.verify_token.clone()]);
    }

    #[test]
    fn test_lease_seconds_default() {
        let (manager, hub) = manager();
        hub.respond(StatusCode::ACCEPTED, "");

        let sub = manager.subscribe("topic", "hub", "callback", None).unwrap();
        assert_lease_near(&sub, 2_592_000);
        assert_eq!(hub.field(0, "hub.lease_seconds"), vec!["2592000"]);
    }

    #[test]
    fn test_error_status_removes_new_record() {
        let (manager, hub) = manager();
        hub.respond(StatusCode::INTERNAL_SERVER_ERROR, "error data");

        let err = manager
            .subscribe("topic", "hub", "callback", None)
            .unwrap_err();
        assert_eq!(err.to_string(), "error subscribing to topic on hub:\nerror data");
        assert!(manager.store().is_empty().unwrap());
    }

    #[test]
    fn test_transport_error_propagates() {
        let (manager, hub) = manager();
        hub.fail("timed out");

        let err = manager
            .subscribe("topic", "hub", "callback", None)
            .unwrap_err();
        assert!(matches!(err, SubscriberError::Transport(_)));
        assert!(manager.store().is_empty().unwrap());
        assert_eq!(hub.requests.lock().len(), 1);
    }

    #[test]
    fn test_resubscribe_resets_to_pending() {
        let (manager, hub) = manager();
        hub.respond(StatusCode::NO_CONTENT, "");
        let first = manager.subscribe("topic", "hub", "callback", None).unwrap();
        assert!(first.verified);

        hub.respond(StatusCode::ACCEPTED, "");
        let second = manager.subscribe("topic", "hub", "callback", None).unwrap();
        assert_eq!(second.id, first.id);
        assert!(!second.verified);
        assert_ne!(second.verify_token, first.verify_token);
        assert_eq!(manager.store().len().unwrap(), 1);
    }

    #[test]
    fn test_failed_resubscribe_keeps_record_unverified() {
        let (manager, hub) = manager();
        hub.respond(StatusCode::NO_CONTENT, "");
        let first = manager.subscribe("topic", "hub", "callback", None).unwrap();

        hub.respond(StatusCode::BAD_REQUEST, "nope");
        assert!(manager.subscribe("topic", "hub", "callback", None).is_err());

        let stored = manager.store().get(first.id).unwrap().unwrap();
        assert!(!stored.verified);
    }

    #[test]
    fn test_sync_verify_emits_event() {
        let (manager, hub) = manager();
        let handle = manager.listeners().listen(Default::default());
        hub.respond(StatusCode::NO_CONTENT, "");

        let sub = manager.subscribe("topic", "hub", "callback", None).unwrap();
        match handle.try_recv().unwrap() {
            SubscriberEvent::Verified { subscription } => assert_eq!(subscription.id, sub.id),
            event => panic!("Expected Verified event, got {:?}", event),
        }
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_sync() {
        let (manager, hub) = manager();
        let handle = manager.listeners().listen(Default::default());
        hub.respond(StatusCode::NO_CONTENT, "");
        let sub = manager.subscribe("topic", "hub", "callback", None).unwrap();
        let _ = handle.try_recv();

        hub.respond(StatusCode::NO_CONTENT, "");
        let done = manager.unsubscribe(sub.id, "callback").unwrap();
        assert!(!done.verified);
        assert!(done.lease_expires.is_none());
        assert!(done.verify_token.starts_with("unsubscribe"));

        assert_eq!(hub.field(1, "hub.mode"), vec!["unsubscribe"]);
        assert_eq!(hub.field(1, "hub.verify_token"), vec![done.verify_token.clone()]);
        assert!(hub.field(1, "hub.lease_seconds").is_empty());
        assert!(matches!(
            handle.try_recv(),
            Ok(SubscriberEvent::Unsubscribed { .. })
        ));
    }

    #[test]
    fn test_unsubscribe_error_restores_token() {
        let (manager, hub) = manager();
        hub.respond(StatusCode::NO_CONTENT, "");
        let sub = manager.subscribe("topic", "hub", "callback", None).unwrap();

        hub.respond(StatusCode::NOT_FOUND, "unknown topic");
        let err = manager.unsubscribe(sub.id, "callback").unwrap_err();
        assert_eq!(
            err.to_string(),
            "error unsubscribing from topic on hub:\nunknown topic"
        );

        let stored = manager.store().get(sub.id).unwrap().unwrap();
        assert_eq!(stored.verify_token, sub.verify_token);
        assert!(stored.verified);
    }

    #[test]
    fn test_unsubscribe_async_keeps_state_until_confirmed() {
        let (manager, hub) = manager();
        let handle = manager.listeners().listen(Default::default());
        hub.respond(StatusCode::NO_CONTENT, "");
        let sub = manager
            .subscribe("topic", "hub", "callback", Some(2000))
            .unwrap();
        let _ = handle.try_recv();

        hub.respond(StatusCode::ACCEPTED, "");
        let pending = manager.unsubscribe(sub.id, "callback").unwrap();
        assert!(pending.verify_token.starts_with("unsubscribe"));
        assert!(pending.verified);
        assert_eq!(pending.lease_expires, sub.lease_expires);
        assert_eq!(hub.field(1, "hub.verify_token"), vec![pending.verify_token.clone()]);

        assert_eq!(manager.store().get(sub.id).unwrap().unwrap(), pending);
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_transport_error_restores_token() {
        let (manager, hub) = manager();
        hub.respond(StatusCode::NO_CONTENT, "");
        let sub = manager.subscribe("topic", "hub", "callback", None).unwrap();

        hub.fail("connection refused");
        let err = manager.unsubscribe(sub.id, "callback").unwrap_err();
        assert!(matches!(err, SubscriberError::Transport(_)));

        let stored = manager.store().get(sub.id).unwrap().unwrap();
        assert_eq!(stored.verify_token, sub.verify_token);
        assert!(stored.verified);
        assert_eq!(stored.lease_expires, sub.lease_expires);
    }

    /// Hub during whose answer a newer subscribe takes the record over.
    struct OvertakenHub {
        store: Arc<MemoryStore>,
    }

    impl HubSender for OvertakenHub {
        fn send(&self, url: &str, form: &[(&'static str, String)]) -> Result<HubResponse> {
            let topic = form
                .iter()
                .find(|(k, _)| *k == "hub.topic")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            self.store.insert_or_reset(NewSubscription::new(
                topic,
                url,
                generate_token(Mode::Subscribe),
            ))?;
            Ok(HubResponse::new(StatusCode::ACCEPTED, ""))
        }
    }

    #[test]
    fn test_answer_for_replaced_token_is_superseded() {
        let store = Arc::new(MemoryStore::new());
        let manager = SubscriptionManager::new(
            Arc::clone(&store),
            OvertakenHub {
                store: Arc::clone(&store),
            },
            Arc::new(ListenerManager::new()),
            SubscriberConfig::default(),
        );

        let err = manager.subscribe("topic", "hub", "callback", None).unwrap_err();
        assert!(matches!(err, SubscriberError::Superseded { .. }));
        assert_eq!(
            err.to_string(),
            "request for topic on hub was superseded by a newer one"
        );

        // The newer request owns the record; nothing was rolled back
        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert!(!all[0].verified);
        assert!(all[0].lease_expires.is_none());
    }

    #[test]
    fn test_unsubscribe_unknown_id() {
        let (manager, hub) = manager();
        let err = manager.unsubscribe(SubscriptionId(9), "callback").unwrap_err();
        assert!(matches!(err, SubscriberError::NotFound));
        assert!(hub.requests.lock().is_empty());
    }

    #[test]
    fn test_renew_and_expiring() {
        let (manager, hub) = manager();
        hub.respond(StatusCode::NO_CONTENT, "");
        let sub = manager
            .subscribe("topic", "hub", "callback", Some(60))
            .unwrap();
        hub.respond(StatusCode::NO_CONTENT, "");
        manager
            .subscribe("other", "hub", "callback", Some(86_400))
            .unwrap();

        let expiring = manager.expiring_within(Duration::from_secs(3600)).unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, sub.id);

        hub.respond(StatusCode::ACCEPTED, "");
        let renewed = manager.renew(sub.id, "callback").unwrap();
        assert_eq!(renewed.id, sub.id);
        assert_lease_near(&renewed, 2_592_000);
        assert!(manager
            .expiring_within(Duration::from_secs(3600))
            .unwrap()
            .is_empty());
    }
}
