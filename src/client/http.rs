//! HTTP Transport
//!
//! Default [`Transport`] over reqwest. Connection failures and timeouts are
//! retried with exponential backoff before any response arrives; HTTP error
//! statuses are classified and returned without retry.

use crate::api::bridge::EventSink;
use crate::api::streaming::{SseDecoder, SseLine};
use crate::client::failure;
use crate::client::transport::{OutboundRequest, Transport};
use crate::error::{LlmaoError, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timeouts and connection retry policy
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Whole-request timeout; long completions need a generous one
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Retries after the first attempt, connection failures only
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    options: HttpOptions,
}

impl HttpTransport {
    /// Create a transport with default options
    pub fn new() -> Result<Self> {
        Self::with_options(HttpOptions::default())
    }

    pub fn with_options(options: HttpOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| LlmaoError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, options })
    }

    pub fn options(&self) -> &HttpOptions {
        &self.options
    }

    fn header_map(request: &OutboundRequest) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if request.stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }

        for (key, value) in &request.headers {
            let name = HeaderName::try_from(key.as_str())
                .map_err(|e| LlmaoError::Config(format!("Invalid header name '{}': {}", key, e)))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                // The value may be a credential; keep it out of the message
                LlmaoError::Config(format!("Invalid value for header '{}'", key))
            })?;
            headers.insert(name, value);
        }

        Ok(headers)
    }

    /// POST the request, retrying connection failures
    async fn post(&self, request: &OutboundRequest) -> Result<Response> {
        let headers = Self::header_map(request)?;
        let max_retries = self.options.max_retries;

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(120)),
            max_interval: self.options.max_backoff,
            initial_interval: self.options.initial_backoff,
            current_interval: self.options.initial_backoff,
            multiplier: 2.0,
            ..Default::default()
        };

        let mut attempt = 0u32;
        let operation = || {
            attempt += 1;
            let this_attempt = attempt;
            let pending = self
                .client
                .post(&request.url)
                .headers(headers.clone())
                .json(&request.body)
                .send();

            async move {
                pending.await.map_err(|err| {
                    if (err.is_connect() || err.is_timeout()) && this_attempt <= max_retries {
                        warn!(attempt = this_attempt, error = %err, "connection failed, retrying");
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
            }
        };

        debug!(url = %request.url, stream = request.stream, "sending request");
        Ok(backoff::future::retry(policy, operation).await?)
    }

    /// Turn a non-success response into a provider error
    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let headers = response.headers().clone();
        let err = match response.text().await {
            Ok(body) => failure::provider_error(status.as_u16(), &headers, &body),
            Err(e) => failure::unreadable_body_error(status.as_u16(), &headers, &e.to_string()),
        };
        warn!(status = status.as_u16(), error = %err, "provider returned an error status");
        Err(err)
    }

    /// Forward one SSE line to the sink; `false` once the stream is done
    async fn forward(line: SseLine, sink: &mut EventSink) -> Result<bool> {
        match line {
            SseLine::Done => Ok(false),
            SseLine::Ignored => Ok(true),
            SseLine::Data(payload) => {
                let event: Value = serde_json::from_str(&payload).map_err(|e| {
                    LlmaoError::Response(format!(
                        "Malformed stream event: {}. Payload: {}",
                        e,
                        payload.chars().take(200).collect::<String>()
                    ))
                })?;
                sink.push(&event).await?;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<Value> {
        let response = Self::check_status(self.post(request).await?).await?;
        let body = response.text().await?;

        serde_json::from_str(&body).map_err(|e| {
            LlmaoError::Response(format!(
                "Failed to parse response: {}. Body: {}",
                e,
                body.chars().take(500).collect::<String>()
            ))
        })
    }

    async fn stream(
        &self,
        request: &OutboundRequest,
        sink: &mut EventSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let response = tokio::select! {
            response = self.post(request) => response?,
            _ = cancel.cancelled() => return Err(LlmaoError::Cancelled),
        };
        let response = Self::check_status(response).await?;

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmaoError::Cancelled),
                next = body.next() => next,
            };

            let Some(chunk) = next else { break };
            let chunk: Bytes = chunk?;
            for line in decoder.feed(&chunk) {
                if !Self::forward(line, sink).await? {
                    debug!(events = sink.delivered(), "stream terminated by [DONE]");
                    return Ok(());
                }
            }
        }

        if let Some(line) = decoder.finish() {
            Self::forward(line, sink).await?;
        }
        debug!(events = sink.delivered(), "stream body ended");
        Ok(())
    }
}
