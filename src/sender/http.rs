use super::{HecTransport, TransportFactory};
use crate::app::ConnectionSettings;
use crate::channel::AckRequest;
use crate::domain::{AckId, EventBatch, HecError, HecServerError};
use crate::pool::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::{
    AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT,
};
use reqwest::{Client, ClientBuilder, Response};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use url::Url;
use uuid::Uuid;

const REQUEST_CHANNEL: &str = "x-splunk-request-channel";
const ACK_PATH: &str = "/services/collector/ack";
const HEALTH_PATH: &str = "/services/collector/health";
/// Payloads at or below this size are sent uncompressed.
const MIN_COMPRESS_BYTES: usize = 1024;

#[derive(Debug, Default)]
pub struct ClientStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_response_time_ms: AtomicU64,
    bytes_sent: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time: Duration,
    pub bytes_sent: u64,
}

impl ClientStats {
    pub fn record_request(&self, success: bool, response_time: Duration, bytes: usize) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_ms
            .fetch_add(response_time.as_millis() as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ClientStatsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_ms = self.total_response_time_ms.load(Ordering::Relaxed);
        ClientStatsSnapshot {
            total_requests,
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            average_response_time: if total_requests > 0 {
                Duration::from_millis(total_ms / total_requests)
            } else {
                Duration::ZERO
            },
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    code: i32,
    #[serde(rename = "ackId")]
    ack_id: Option<AckId>,
}

#[derive(Debug, Deserialize)]
struct AckResponse {
    acks: HashMap<String, bool>,
}

/// `reqwest` transport for one HEC request channel.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    events_url: Url,
    ack_url: Url,
    health_url: Url,
    headers: HeaderMap,
    compress: bool,
    stats: Arc<ClientStats>,
}

impl HttpTransport {
    pub fn new(
        client: Client,
        endpoint: &Endpoint,
        channel_uuid: Uuid,
        settings: &ConnectionSettings,
        stats: Arc<ClientStats>,
    ) -> Result<Self, HecError> {
        let join = |path: &str| {
            endpoint
                .url()
                .join(path)
                .map_err(|e| HecError::Transport(format!("invalid url for {path}: {e}")))
        };

        Ok(Self {
            client,
            events_url: join(settings.endpoint_kind.path())?,
            ack_url: join(ACK_PATH)?,
            health_url: join(HEALTH_PATH)?,
            headers: build_headers(&settings.token, channel_uuid)?,
            compress: settings.enable_compression,
            stats,
        })
    }

    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.stats
    }

    fn prepare_payload(&self, payload: Bytes) -> Result<(Bytes, bool), HecError> {
        if !self.compress || payload.len() <= MIN_COMPRESS_BYTES {
            return Ok((payload, false));
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 4), Compression::default());
        encoder
            .write_all(&payload)
            .and_then(|()| encoder.finish())
            .map(|compressed| (Bytes::from(compressed), true))
            .map_err(|e| HecError::Transport(format!("gzip failed: {e}")))
    }

    async fn error_from(response: Response) -> HecError {
        let status = response.status().as_u16();
        let url = response.url().to_string();
        match response.text().await {
            Ok(body) => HecError::Server(HecServerError::from_response_body(&body, status, url)),
            Err(e) => HecError::Http(e),
        }
    }
}

fn build_headers(token: &str, channel_uuid: Uuid) -> Result<HeaderMap, HecError> {
    let mut headers = HeaderMap::new();
    let auth = HeaderValue::from_str(&format!("Splunk {token}"))
        .map_err(|e| HecError::Transport(format!("invalid token header: {e}")))?;
    headers.insert(AUTHORIZATION, auth);
    let channel = HeaderValue::from_str(&channel_uuid.to_string())
        .map_err(|e| HecError::Transport(format!("invalid channel header: {e}")))?;
    headers.insert(REQUEST_CHANNEL, channel);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("hec-forwarder/", env!("CARGO_PKG_VERSION"))),
    );
    Ok(headers)
}

#[async_trait]
impl HecTransport for HttpTransport {
    async fn post_events(&self, batch: &EventBatch) -> Result<AckId, HecError> {
        let (body, compressed) = self.prepare_payload(batch.payload())?;
        let bytes = body.len();
        let mut request = self
            .client
            .post(self.events_url.clone())
            .headers(self.headers.clone());
        if compressed {
            request = request.header(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let start = Instant::now();
        let response = request.body(body).send().await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_request(false, start.elapsed(), bytes);
                return Err(HecError::Http(e));
            }
        };
        let success = response.status().is_success();
        self.stats.record_request(success, start.elapsed(), bytes);
        if !success {
            return Err(Self::error_from(response).await);
        }

        let status = response.status().as_u16();
        let parsed: EventResponse = response.json().await?;
        if parsed.code != 0 {
            return Err(HecError::Server(HecServerError::new(
                parsed.code,
                parsed.text,
                status,
                self.events_url.as_str(),
            )));
        }
        let ack_id = parsed.ack_id.ok_or_else(|| {
            HecError::Transport(format!(
                "response for batch {} has no ackId; is indexer acknowledgement enabled?",
                batch.id()
            ))
        })?;
        debug!(batch_id = %batch.id(), ack_id, bytes, compressed, "Event post accepted");
        Ok(ack_id)
    }

    async fn poll_acks(&self, request: &AckRequest) -> Result<Vec<AckId>, HecError> {
        let body = request.to_json()?;
        let start = Instant::now();
        let response = self
            .client
            .post(self.ack_url.clone())
            .headers(self.headers.clone())
            .body(body.clone())
            .send()
            .await?;
        let success = response.status().is_success();
        self.stats.record_request(success, start.elapsed(), body.len());
        if !success {
            return Err(Self::error_from(response).await);
        }

        let parsed: AckResponse = response.json().await?;
        let mut succeeded: Vec<AckId> = parsed
            .acks
            .into_iter()
            .filter(|(_, indexed)| *indexed)
            .filter_map(|(id, _)| id.parse().ok())
            .collect();
        succeeded.sort_unstable();
        trace!(requested = request.len(), succeeded = succeeded.len(), "Ack poll response");
        Ok(succeeded)
    }

    async fn check_health(&self) -> Result<(), HecError> {
        let response = self
            .client
            .get(self.health_url.clone())
            .headers(self.headers.clone())
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_from(response).await)
        }
    }
}

/// Shares one connection pool across all channels.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    client: Client,
    settings: Arc<ConnectionSettings>,
    stats: Arc<ClientStats>,
}

impl HttpTransportFactory {
    pub fn new(settings: Arc<ConnectionSettings>) -> Result<Self, HecError> {
        let client = ClientBuilder::new()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.request_timeout)
            .pool_idle_timeout(Duration::from_secs(60))
            .danger_accept_invalid_certs(settings.disable_cert_validation)
            .build()?;
        Ok(Self {
            client,
            settings,
            stats: Arc::new(ClientStats::default()),
        })
    }

    pub fn stats(&self) -> &Arc<ClientStats> {
        &self.stats
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(
        &self,
        endpoint: &Endpoint,
        channel_uuid: Uuid,
    ) -> Result<Arc<dyn HecTransport>, HecError> {
        let transport = HttpTransport::new(
            self.client.clone(),
            endpoint,
            channel_uuid,
            &self.settings,
            Arc::clone(&self.stats),
        )?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Event;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer, compress: bool) -> HttpTransport {
        let settings = Arc::new(ConnectionSettings {
            token: "00000000-token".to_string(),
            enable_compression: compress,
            ..ConnectionSettings::default()
        });
        let endpoint = Endpoint::parse(&server.uri()).unwrap();
        let factory = HttpTransportFactory::new(Arc::clone(&settings)).unwrap();
        HttpTransport::new(
            factory.client.clone(),
            &endpoint,
            Uuid::new_v4(),
            &settings,
            Arc::clone(factory.stats()),
        )
        .unwrap()
    }

    fn batch(lines: usize) -> EventBatch {
        let batch = EventBatch::new();
        for i in 0..lines {
            batch
                .append(&Event::json(serde_json::json!({"line": i})))
                .unwrap();
        }
        batch
    }

    #[tokio::test]
    async fn test_post_events_returns_ack_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/collector/event"))
            .and(header("authorization", "Splunk 00000000-token"))
            .and(header_exists("x-splunk-request-channel"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"text": "Success", "code": 0, "ackId": 7})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ack_id = transport(&server, false).post_events(&batch(3)).await.unwrap();
        assert_eq!(ack_id, 7);
    }

    #[tokio::test]
    async fn test_post_events_maps_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/collector/event"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_json(serde_json::json!({"text": "Server is busy", "code": 9})),
            )
            .mount(&server)
            .await;

        let transport = transport(&server, false);
        let err = transport.post_events(&batch(1)).await.unwrap_err();
        match err {
            HecError::Server(server_err) => {
                assert_eq!(server_err.code, 9);
                assert_eq!(server_err.status, 503);
                assert!(HecError::Server(server_err).is_retryable());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(transport.stats().snapshot().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_missing_ack_id_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/collector/event"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"text": "Success", "code": 0})),
            )
            .mount(&server)
            .await;

        let err = transport(&server, false).post_events(&batch(1)).await.unwrap_err();
        assert!(matches!(err, HecError::Transport(_)));
    }

    #[tokio::test]
    async fn test_large_payload_is_gzipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/collector/event"))
            .and(header("content-encoding", "gzip"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"text": "Success", "code": 0, "ackId": 1})),
            )
            .expect(1)
            .mount(&server)
            .await;

        transport(&server, true).post_events(&batch(200)).await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_acks_returns_indexed_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/collector/ack"))
            .and(body_json(serde_json::json!({"acks": [1, 2, 3]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"acks": {"1": true, "2": false, "3": true}}),
            ))
            .mount(&server)
            .await;

        let request = AckRequest {
            acks: [1, 2, 3].into_iter().collect(),
        };
        let succeeded = transport(&server, false).poll_acks(&request).await.unwrap();
        assert_eq!(succeeded, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/collector/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(transport(&server, false).check_health().await.is_ok());

        let unhealthy = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services/collector/health"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_json(serde_json::json!({"text": "HEC is unhealthy", "code": 17})),
            )
            .mount(&unhealthy)
            .await;
        let err = transport(&unhealthy, false).check_health().await.unwrap_err();
        assert_eq!(err.server_error_type(), Some(crate::domain::ServerErrorType::Unknown));
    }
}
