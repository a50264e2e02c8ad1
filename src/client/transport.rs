//! Transport Seam
//!
//! The injected I/O collaborator. The router builds an [`OutboundRequest`];
//! a [`Transport`] performs it. [`crate::client::HttpTransport`] is the
//! default implementation; tests substitute their own.

use crate::api::bridge::EventSink;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// A fully built provider request
#[derive(Clone, PartialEq)]
pub struct OutboundRequest {
    /// Full endpoint URL
    pub url: String,
    /// Every header to send, the credential header included
    pub headers: BTreeMap<String, String>,
    /// Wire body, already translated and param-mapped
    pub body: Value,
    pub stream: bool,
    /// Name of the header carrying the credential
    pub auth_header: String,
}

impl OutboundRequest {
    /// Look up a header by name, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: BTreeMap<&str, &str> = self
            .headers
            .iter()
            .map(|(key, value)| {
                if key.eq_ignore_ascii_case(&self.auth_header) {
                    (key.as_str(), "[redacted]")
                } else {
                    (key.as_str(), value.as_str())
                }
            })
            .collect();

        f.debug_struct("OutboundRequest")
            .field("url", &self.url)
            .field("headers", &headers)
            .field("body", &self.body)
            .field("stream", &self.stream)
            .finish()
    }
}

/// Performs provider requests
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the raw JSON response body.
    ///
    /// Non-success statuses come back as [`crate::LlmaoError::Provider`],
    /// network failures as [`crate::LlmaoError::Transport`].
    async fn send(&self, request: &OutboundRequest) -> Result<Value>;

    /// Send a streaming request, pushing each raw event into `sink` until the
    /// body ends, the sink closes, or `cancel` fires.
    async fn stream(
        &self,
        request: &OutboundRequest,
        sink: &mut EventSink,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::client::failure::provider_error;
    use parking_lot::Mutex;
    use reqwest::header::HeaderMap;

    /// Records every request; replies with a canned body or event list
    pub(crate) struct MockTransport {
        requests: Mutex<Vec<OutboundRequest>>,
        response: Value,
        events: Vec<Value>,
        /// Fail with this status, after any events
        fail_status: Option<u16>,
    }

    impl MockTransport {
        pub(crate) fn replying(response: Value) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                response,
                events: Vec::new(),
                fail_status: None,
            }
        }

        pub(crate) fn streaming(events: Vec<Value>) -> Self {
            Self {
                events,
                ..Self::replying(Value::Null)
            }
        }

        pub(crate) fn failing_with(mut self, status: u16) -> Self {
            self.fail_status = Some(status);
            self
        }

        pub(crate) fn requests(&self) -> Vec<OutboundRequest> {
            self.requests.lock().clone()
        }

        /// Credential header value of every recorded request, in order
        pub(crate) fn credentials(&self) -> Vec<String> {
            self.requests
                .lock()
                .iter()
                .map(|r| r.header(&r.auth_header).unwrap_or_default().to_string())
                .collect()
        }

        fn failure(&self) -> Result<()> {
            match self.fail_status {
                Some(status) => Err(provider_error(
                    status,
                    &HeaderMap::new(),
                    r#"{"error":{"message":"mock failure"}}"#,
                )),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&self, request: &OutboundRequest) -> Result<Value> {
            self.requests.lock().push(request.clone());
            self.failure()?;
            Ok(self.response.clone())
        }

        async fn stream(
            &self,
            request: &OutboundRequest,
            sink: &mut EventSink,
            cancel: &CancellationToken,
        ) -> Result<()> {
            self.requests.lock().push(request.clone());
            for event in &self.events {
                if cancel.is_cancelled() {
                    return Err(crate::LlmaoError::Cancelled);
                }
                sink.push(event).await?;
            }
            self.failure()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_debug_redacts_credential_header() {
        let request = OutboundRequest {
            url: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            headers: BTreeMap::from([
                ("Authorization".to_string(), "Bearer sk-secret".to_string()),
                ("X-Title".to_string(), "llmao".to_string()),
            ]),
            body: json!({ "model": "m1" }),
            stream: false,
            auth_header: "authorization".to_string(),
        };

        let debug = format!("{:?}", request);
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("[redacted]"));
        assert!(debug.contains("llmao"));
        assert_eq!(request.header("authorization"), Some("Bearer sk-secret"));
    }
}
