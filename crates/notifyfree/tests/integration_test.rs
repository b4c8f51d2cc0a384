// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use notifyfree::{
    Client, Config, DeliveryError, DeliveryMode, FallbackStore, FormattedEntry, Level, LogHandler,
    LogRecord, LogSender,
};
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::Duration;

fn config(endpoint: &str) -> Config {
    let mut config = Config {
        endpoint: endpoint.to_string(),
        token: Some("mock-token".to_string()),
        app_id: Some("mock-app".to_string()),
        timeout: Duration::from_secs(5),
        retry_attempts: 3,
        retry_backoff_base: Duration::from_millis(1),
        ..Config::default()
    };
    config.fallback.enabled = false;
    config
}

fn entry(message: &str) -> FormattedEntry {
    FormattedEntry {
        message: message.to_string(),
        level: Level::Error,
        timestamp: "2024-05-01T12:00:00+00:00".to_string(),
        tags: vec!["checkout".to_string()],
        metadata: Map::new(),
    }
}

#[tokio::test]
async fn send_posts_single_entry_with_bearer_token() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/logs")
        .match_header("Authorization", "Bearer mock-token")
        .match_header("Content-Type", "application/json")
        .match_body(Matcher::PartialJson(json!({
            "message": "payment failed",
            "level": "error",
            "tags": ["checkout"],
        })))
        .with_status(201)
        .create_async()
        .await;

    let client = Client::new(&config(&format!("{}/v1/logs", server.url()))).expect("client");
    client.send(&entry("payment failed")).await.expect("delivered");

    mock.assert_async().await;
}

#[tokio::test]
async fn send_batch_posts_app_id_and_messages() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/logs/batch")
        .match_body(Matcher::PartialJson(json!({
            "app_id": "mock-app",
            "messages": [{"message": "one"}, {"message": "two"}],
        })))
        .with_status(200)
        .create_async()
        .await;

    let client = Client::new(&config(&format!("{}/v1/logs", server.url()))).expect("client");
    client
        .send_batch(&[entry("one"), entry("two")])
        .await
        .expect("delivered");

    mock.assert_async().await;
}

#[tokio::test]
async fn unauthorized_is_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/logs")
        .with_status(401)
        .expect(1)
        .create_async()
        .await;

    let client = Client::new(&config(&format!("{}/v1/logs", server.url()))).expect("client");
    let result = client.send(&entry("secret stuff")).await;

    assert!(matches!(result, Err(DeliveryError::Auth)));
    mock.assert_async().await;
}

#[tokio::test]
async fn server_errors_exhaust_retries() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/logs")
        .with_status(500)
        .expect(3)
        .create_async()
        .await;

    let client = Client::new(&config(&format!("{}/v1/logs", server.url()))).expect("client");
    let result = client.send(&entry("flaky")).await;

    match result {
        Err(DeliveryError::Network { attempts, cause }) => {
            assert_eq!(attempts, 3);
            assert!(cause.contains("500"), "unexpected cause: {cause}");
        }
        other => panic!("expected network error, got {other:?}"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn missing_batch_endpoint_falls_back_to_individual_sends() {
    let mut server = Server::new_async().await;
    let batch = server
        .mock("POST", "/v1/logs/batch")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;
    let single = server
        .mock("POST", "/v1/logs")
        .with_status(200)
        .expect(3)
        .create_async()
        .await;

    let client = Client::new(&config(&format!("{}/v1/logs", server.url()))).expect("client");
    client
        .send_batch(&[entry("a"), entry("b"), entry("c")])
        .await
        .expect("delivered individually");

    batch.assert_async().await;
    single.assert_async().await;
}

#[tokio::test]
async fn individual_fallback_needs_more_than_half() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/v1/logs/batch")
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("POST", "/v1/logs")
        .match_body(Matcher::PartialJson(json!({"message": "ok"})))
        .with_status(200)
        .create_async()
        .await;
    server
        .mock("POST", "/v1/logs")
        .match_body(Matcher::PartialJson(json!({"message": "broken"})))
        .with_status(500)
        .create_async()
        .await;

    let client = Client::new(&config(&format!("{}/v1/logs", server.url()))).expect("client");
    let result = client.send_batch(&[entry("ok"), entry("broken")]).await;

    assert!(matches!(
        result,
        Err(DeliveryError::PartialBatch {
            delivered: 1,
            total: 2
        })
    ));
}

#[tokio::test]
async fn connection_probe_accepts_ok_and_method_not_allowed() {
    for (status, expected) in [(200, true), (405, true), (500, false)] {
        let mut server = Server::new_async().await;
        server
            .mock("HEAD", "/v1/logs")
            .with_status(status)
            .create_async()
            .await;

        let client = Client::new(&config(&format!("{}/v1/logs", server.url()))).expect("client");
        assert_eq!(client.test_connection().await, expected, "status {status}");
    }
}

#[tokio::test]
async fn connection_probe_swallows_transport_errors() {
    // Nothing listens on port 9 on the loopback interface.
    let client = Client::new(&config("http://127.0.0.1:9/v1/logs")).expect("client");
    assert!(!client.test_connection().await);
}

#[tokio::test]
async fn handler_flushes_buffer_through_batch_endpoint() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/logs/batch")
        .match_body(Matcher::PartialJson(json!({
            "messages": [
                {"message": "first", "level": "info"},
                {"message": "second", "level": "warning"},
                {"message": "third", "level": "error"},
            ],
        })))
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let mut config = config(&format!("{}/v1/logs", server.url()));
    config.batch.buffer_size = 3;
    config.batch.flush_timeout = Duration::from_secs(100);
    let mut handler = LogHandler::from_config(&config).expect("handler");

    handler.write(LogRecord::new(Level::Info, "first")).await;
    handler.write(LogRecord::new(Level::Warning, "second")).await;
    assert_eq!(handler.buffer_len(), 2);
    handler.write(LogRecord::new(Level::Error, "third")).await;
    assert_eq!(handler.buffer_len(), 0);

    mock.assert_async().await;
}

#[tokio::test]
async fn handler_redacts_sensitive_context_on_the_wire() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/logs")
        .match_body(Matcher::PartialJson(json!({
            "message": "login",
            "metadata": {"password": "[FILTERED]", "user": "ada"},
        })))
        .with_status(200)
        .create_async()
        .await;

    let mut config = config(&format!("{}/v1/logs", server.url()));
    config.mode = DeliveryMode::Basic;
    let mut handler = LogHandler::from_config(&config).expect("handler");

    let mut context = Map::new();
    context.insert("password".to_string(), json!("hunter2"));
    context.insert("user".to_string(), json!("ada"));
    handler
        .write(LogRecord::new(Level::Notice, "login").with_context(context))
        .await;

    mock.assert_async().await;
}

#[tokio::test]
async fn fallback_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut server = Server::new_async().await;
    let failing = server
        .mock("POST", "/v1/logs")
        .with_status(503)
        .create_async()
        .await;

    let mut config = config(&format!("{}/v1/logs", server.url()));
    config.mode = DeliveryMode::Cached;
    config.retry_attempts = 1;
    config.fallback.path = dir.path().join("notifyfree-fallback.log");
    let mut handler = LogHandler::from_config(&config).expect("handler");

    for i in 0..4 {
        handler
            .write(LogRecord::new(Level::Error, format!("order {i} failed")))
            .await;
    }

    let store = FallbackStore::from_config(&config.fallback);
    assert_eq!(store.stats().expect("stats").count, 4);

    failing.remove_async().await;
    let healthy = server
        .mock("POST", "/v1/logs")
        .with_status(200)
        .expect(4)
        .create_async()
        .await;

    let sender: Arc<dyn LogSender> = Arc::new(Client::new(&config).expect("client"));
    let delivered = store.retry(sender.as_ref()).await.expect("retry");

    assert_eq!(delivered, 4);
    assert!(!config.fallback.path.exists());
    healthy.assert_async().await;
}
