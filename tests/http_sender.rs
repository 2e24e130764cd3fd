//! `HttpHubSender` against a mock hub.
//!
//! The sender is blocking, so every call runs on tokio's blocking pool while
//! the mock server keeps serving.

use std::sync::Arc;
use std::time::Duration;
use websub_subscriber::{
    HttpHubSender, HubSender, ListenerManager, MemoryStore, StatusCode, SubscriberConfig,
    SubscriberError, SubscriptionManager, SubscriptionStore,
};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Sender that ignores proxy settings from the environment.
fn local_sender(timeout: Duration) -> HttpHubSender {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()
        .unwrap();
    HttpHubSender::with_client(client)
}

fn manager() -> SubscriptionManager<MemoryStore> {
    SubscriptionManager::new(
        Arc::new(MemoryStore::new()),
        local_sender(Duration::from_secs(5)),
        Arc::new(ListenerManager::new()),
        SubscriberConfig::default(),
    )
}

fn hub_url(server: &MockServer) -> String {
    format!("{}/hub", server.uri())
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.unwrap()
}

#[tokio::test]
async fn test_subscribe_posts_form() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hub"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("hub.mode=subscribe"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let url = hub_url(&server);
    let sub = blocking(move || {
        manager().subscribe("http://blog.example/feed", &url, "http://me.example/cb", Some(2000))
    })
    .await
    .unwrap();
    assert!(!sub.verified);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8(requests[0].body.clone()).unwrap();

    assert!(body.starts_with("hub.mode=subscribe&hub.topic=http%3A%2F%2Fblog.example%2Ffeed&"));
    assert!(body.contains(&format!(
        "hub.callback=http%3A%2F%2Fme.example%2Fcb%2F{}",
        sub.id
    )));
    assert!(body.contains("&hub.verify=async&hub.verify=sync&"));
    assert!(body.contains(&format!("hub.verify_token={}", sub.verify_token)));
    assert!(body.ends_with("hub.lease_seconds=2000"));
}

#[tokio::test]
async fn test_error_body_in_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hub"))
        .respond_with(ResponseTemplate::new(500).set_body_string("error data"))
        .expect(1)
        .mount(&server)
        .await;

    let url = hub_url(&server);
    let (err, empty) = blocking({
        let url = url.clone();
        move || {
            let manager = manager();
            let err = manager
                .subscribe("topic", &url, "http://me.example/cb", None)
                .unwrap_err();
            (err, manager.store().is_empty().unwrap())
        }
    })
    .await;

    assert_eq!(
        err.to_string(),
        format!("error subscribing to topic on {url}:\nerror data")
    );
    assert!(empty);
}

#[tokio::test]
async fn test_sync_verification_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hub"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let url = hub_url(&server);
    let sub = blocking(move || manager().subscribe("topic", &url, "http://me.example/cb", None))
        .await
        .unwrap();
    assert!(sub.verified);
}

#[tokio::test]
async fn test_unsubscribe_form_has_no_lease() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hub"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let url = hub_url(&server);
    let done = blocking(move || {
        let manager = manager();
        let sub = manager.subscribe("topic", &url, "http://me.example/cb", None)?;
        manager.unsubscribe(sub.id, "http://me.example/cb")
    })
    .await
    .unwrap();
    assert!(!done.verified);

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8(requests[1].body.clone()).unwrap();
    assert!(body.starts_with("hub.mode=unsubscribe&"));
    assert!(body.contains(&format!("hub.verify_token={}", done.verify_token)));
    assert!(!body.contains("hub.lease_seconds"));
}

#[tokio::test]
async fn test_unresponsive_hub_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hub"))
        .respond_with(ResponseTemplate::new(204).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let url = hub_url(&server);
    let result = blocking(move || {
        local_sender(Duration::from_millis(200)).send(&url, &[("hub.mode", "subscribe".to_string())])
    })
    .await;
    assert!(matches!(result, Err(SubscriberError::Transport(_))));
}

#[tokio::test]
async fn test_sync_status_is_exposed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hub"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let url = hub_url(&server);
    let response = blocking(move || {
        local_sender(Duration::from_secs(5)).send(&url, &[("hub.mode", "subscribe".to_string())])
    })
    .await
    .unwrap();
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert!(response.body.is_empty());
}

#[test]
fn test_sender_from_config() {
    assert!(HttpHubSender::new(&SubscriberConfig::default()).is_ok());
    assert!(
        SubscriptionManager::with_http(Arc::new(MemoryStore::new()), SubscriberConfig::default())
            .is_ok()
    );
}
