// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destinations for sealed batches.
//!
//! The engine only needs one fallible call per batch. [`LogSink`] is the default when no
//! downstream is configured; [`HttpSink`] posts batches as JSON.

use std::io::Write;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use serde::Serialize;
use tracing::{debug, info, trace};
use zstd::stream::write::Encoder;

use crate::batch::Batch;
use crate::errors::SinkError;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Delivers the whole batch. Partial success is failure: the batch is retried as a unit.
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError>;
}

/// Logs every batch and accepts it.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError> {
        info!(
            "Batch {} delivered: {} events, {} previous attempts",
            batch.id(),
            batch.len(),
            batch.attempts()
        );
        for event in batch.events() {
            trace!(
                "  - {} {}: {}",
                event.protocol(),
                event.source(),
                String::from_utf8_lossy(event.payload())
            );
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct WireEvent<'a> {
    /// Milliseconds since the Unix epoch.
    timestamp: u64,
    source: String,
    protocol: &'static str,
    payload: std::borrow::Cow<'a, str>,
}

pub struct HttpSinkConfig {
    pub url: String,
    pub timeout: Duration,
    /// zstd level; `None` sends the body uncompressed.
    pub compression_level: Option<i32>,
}

/// Posts each batch as a JSON array to a fixed URL. Any 2xx status is success.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    compression_level: Option<i32>,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self, SinkError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if config.compression_level.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| SinkError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpSink {
            client,
            url: config.url,
            compression_level: config.compression_level,
        })
    }

    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, SinkError> {
        let wire: Vec<WireEvent<'_>> = batch
            .events()
            .iter()
            .map(|event| WireEvent {
                timestamp: event
                    .received_at()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis()
                    .try_into()
                    .unwrap_or(u64::MAX),
                source: event.source().to_string(),
                protocol: event.protocol().as_str(),
                payload: String::from_utf8_lossy(event.payload()),
            })
            .collect();
        let body = serde_json::to_vec(&wire).map_err(|e| SinkError::Payload(e.to_string()))?;

        match self.compression_level {
            None => Ok(body),
            Some(level) => {
                let mut encoder = Encoder::new(Vec::new(), level)
                    .map_err(|e| SinkError::Payload(e.to_string()))?;
                encoder
                    .write_all(&body)
                    .map_err(|e| SinkError::Payload(e.to_string()))?;
                encoder.finish().map_err(|e| SinkError::Payload(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, batch: &Batch) -> Result<(), SinkError> {
        let body = self.encode(batch)?;
        let started = SystemTime::now();
        let resp = self
            .client
            .post(&self.url)
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            debug!(
                "Batch {} accepted by {} with {} in {} ms",
                batch.id(),
                self.url,
                status,
                started.elapsed().unwrap_or_default().as_millis()
            );
            return Ok(());
        }
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Protocol};
    use mockito::{Matcher, Server};
    use std::net::SocketAddr;

    fn sample_batch() -> Batch {
        let source: SocketAddr = "10.1.2.3:514".parse().unwrap();
        Batch::new(
            1,
            SystemTime::now(),
            vec![
                Event::new(Protocol::Udp, source, b"<34>first".to_vec()),
                Event::new(Protocol::Udp, source, b"<34>second".to_vec()),
            ],
        )
    }

    fn sink(url: String, compression_level: Option<i32>) -> HttpSink {
        HttpSink::new(HttpSinkConfig {
            url,
            timeout: Duration::from_secs(2),
            compression_level,
        })
        .expect("failed to build sink")
    }

    #[tokio::test]
    async fn test_log_sink_accepts_everything() {
        assert!(LogSink.deliver(&sample_batch()).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_sink_posts_json_events() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .match_header("Content-Type", "application/json")
            .match_body(Matcher::Regex(
                r#"^\[\{"timestamp":\d+,"source":"10\.1\.2\.3:514","protocol":"udp","payload":"<34>first"\},.*"payload":"<34>second"\}\]$"#
                    .to_string(),
            ))
            .with_status(202)
            .create_async()
            .await;

        let result = sink(format!("{}/ingest", server.url()), None)
            .deliver(&sample_batch())
            .await;

        assert!(result.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_sink_compresses_with_zstd() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest")
            .match_header("Content-Encoding", "zstd")
            .with_status(200)
            .create_async()
            .await;

        let result = sink(format!("{}/ingest", server.url()), Some(3))
            .deliver(&sample_batch())
            .await;

        assert!(result.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_sink_reports_rejection() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/ingest")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let result = sink(format!("{}/ingest", server.url()), None)
            .deliver(&sample_batch())
            .await;

        match result {
            Err(SinkError::Rejected { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_sink_unreachable() {
        // Port 9 on localhost is the discard port; nothing listens there in test environments.
        let result = sink("http://127.0.0.1:9/ingest".to_string(), None)
            .deliver(&sample_batch())
            .await;
        assert!(matches!(result, Err(SinkError::Unreachable(_))));
    }
}
