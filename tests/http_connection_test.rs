use hec_forwarder::app::{Config, Connection};
use hec_forwarder::domain::{BatchId, ConnectionCallbacks, Event, EventBatch, HecError};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct Recorder {
    acknowledged: Mutex<Vec<BatchId>>,
    failed: Mutex<Vec<String>>,
}

impl ConnectionCallbacks for Recorder {
    fn acknowledged(&self, batch: &EventBatch) {
        self.acknowledged.lock().push(batch.id());
    }

    fn failed(&self, _batch: &EventBatch, error: &HecError) {
        self.failed.lock().push(error.to_string());
    }
}

fn config(server: &MockServer) -> Config {
    let mut config = Config {
        urls: vec![server.uri()],
        token: "test-token".to_string(),
        channels_per_destination: 1,
        max_total_channels: 1,
        ack_poll_ms: 20,
        ack_timeout_ms: 2_000,
        max_retries: 0,
        ..Config::default()
    };
    config.post_process().unwrap();
    config
}

async fn mount_health(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/services/collector/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "HEC is healthy", "code": 17})))
        .mount(server)
        .await;
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_event_is_posted_and_acknowledged() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    Mock::given(method("POST"))
        .and(path("/services/collector/event"))
        .and(header("authorization", "Splunk test-token"))
        .and(header_exists("x-splunk-request-channel"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"text": "Success", "code": 0, "ackId": 7})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/services/collector/ack"))
        .and(body_json(json!({"acks": [7]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acks": {"7": true}})))
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let connection = Connection::from_config(&config(&server), recorder.clone()).unwrap();
    tokio_test::assert_ok!(connection.send(Event::json(json!({"message": "hello"}))).await);

    wait_until(|| recorder.acknowledged.lock().len() == 1).await;
    assert!(recorder.failed.lock().is_empty());
    assert!(connection.wait_for_drain(Duration::from_secs(1)).await);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_token_fails_batch() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    Mock::given(method("POST"))
        .and(path("/services/collector/event"))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({"text": "Invalid token", "code": 4})),
        )
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let connection = Connection::from_config(&config(&server), recorder.clone()).unwrap();
    connection.send(Event::raw("rejected")).await.unwrap();

    wait_until(|| recorder.failed.lock().len() == 1).await;
    let failed = recorder.failed.lock();
    assert!(failed[0].contains("Invalid token"), "{}", failed[0]);
    assert!(failed[0].contains("code 4"));
    assert!(recorder.acknowledged.lock().is_empty());
}

#[tokio::test]
async fn test_unindexed_batch_times_out() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    Mock::given(method("POST"))
        .and(path("/services/collector/event"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"text": "Success", "code": 0, "ackId": 0})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/services/collector/ack"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acks": {"0": false}})))
        .mount(&server)
        .await;

    let mut config = config(&server);
    config.ack_timeout_ms = 300;
    let recorder = Arc::new(Recorder::default());
    let connection = Connection::from_config(&config, recorder.clone()).unwrap();
    connection.send(Event::raw("slow indexer")).await.unwrap();

    wait_until(|| recorder.failed.lock().len() == 1).await;
    assert!(recorder.failed.lock()[0].contains("not acknowledged"));
    assert_eq!(connection.metrics().snapshot().batches_timed_out, 1);
    connection.close_now();
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = Config {
        token: String::new(),
        ..Config::default()
    };
    let result = Connection::from_config(&config, Arc::new(Recorder::default()));
    assert!(matches!(result, Err(HecError::Config(_))));
}
