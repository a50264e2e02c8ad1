//! Request Dispatch
//!
//! Builds the outbound request for a route and hands it to the transport.
//! Transport and provider errors come back annotated with the provider, the
//! model and the index of the key in use.

use crate::api::bridge::ChunkStream;
use crate::api::completion::{CompletionRequest, CompletionResponse};
use crate::api::normalize::{normalize_response, StreamNormalizer};
use crate::client::{OutboundRequest, Transport};
use crate::config::{EffectiveConfig, Protocol, Route};
use crate::error::{LlmaoError, RequestTarget, Result};
use crate::router::SelectedKey;
use crate::ClientOptions;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Default `max_tokens` for endpoints that require one
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 4096;

/// Sends completion requests over a [`Transport`]
pub struct RequestRouter {
    transport: Arc<dyn Transport>,
    options: ClientOptions,
}

impl RequestRouter {
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Build the wire request for one route and credential.
    ///
    /// The body is the generic request with the routed model name and the
    /// streaming flag set, translated for the route's protocol, and finally
    /// renamed through the route's `param_mappings`.
    pub fn build_request(
        config: &EffectiveConfig,
        key: &SelectedKey<'_>,
        request: &CompletionRequest,
        streaming: bool,
    ) -> Result<OutboundRequest> {
        let mut body = serde_json::to_value(request)?;
        let obj = body
            .as_object_mut()
            .ok_or_else(|| LlmaoError::Config("Request did not serialize to an object".to_string()))?;

        obj.insert("model".to_string(), Value::String(config.model.clone()));
        if streaming {
            obj.insert("stream".to_string(), Value::Bool(true));
        } else {
            obj.remove("stream");
        }

        if config.protocol == Protocol::Anthropic {
            to_anthropic_body(obj);
        }
        config.apply_param_mappings(&mut body);

        let mut headers: BTreeMap<String, String> = config
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(&config.auth.header))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        headers.insert(config.auth.header.clone(), config.auth.header_value(key.value()));

        Ok(OutboundRequest {
            url: config.endpoint(),
            headers,
            body,
            stream: streaming,
            auth_header: config.auth.header.clone(),
        })
    }

    fn pick<'a>(route: &'a Route) -> Result<(SelectedKey<'a>, RequestTarget)> {
        let config = route.config();
        let key = route.key_pool().pick_next().ok_or_else(|| {
            LlmaoError::Config(format!(
                "No API keys for '{}/{}'",
                config.provider, config.model
            ))
        })?;

        let target = RequestTarget {
            provider: config.provider.clone(),
            model: config.model.clone(),
            key_index: key.index,
        };
        Ok((key, target))
    }

    /// Send a non-streaming request and normalize the reply
    pub async fn send(&self, route: &Route, request: &CompletionRequest) -> Result<CompletionResponse> {
        let config = route.config();
        let (key, target) = Self::pick(route)?;
        let outbound = Self::build_request(config, &key, request, false)?;
        debug!(target = %target, url = %outbound.url, "dispatching completion");

        let raw = self
            .transport
            .send(&outbound)
            .await
            .map_err(|e| e.with_target(target.clone()))?;

        normalize_response(config.protocol, raw, &config.model).map_err(|e| e.with_target(target))
    }

    /// Start a streaming request; chunks are pulled from the returned stream
    pub fn stream(&self, route: &Route, request: &CompletionRequest) -> Result<ChunkStream> {
        let config = route.config();
        let (key, target) = Self::pick(route)?;
        let outbound = Self::build_request(config, &key, request, true)?;
        debug!(target = %target, url = %outbound.url, "dispatching streaming completion");

        let transport = Arc::clone(&self.transport);
        let normalizer = StreamNormalizer::new(config.protocol, config.model.clone());

        Ok(ChunkStream::spawn(&self.options, normalizer, move |mut sink, cancel| async move {
            transport
                .stream(&outbound, &mut sink, &cancel)
                .await
                .map_err(|e| e.with_target(target))
        }))
    }
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Rewrite an OpenAI-style chat body into an Anthropic messages body
fn to_anthropic_body(body: &mut Map<String, Value>) {
    let messages = match body.remove("messages") {
        Some(Value::Array(messages)) => messages,
        _ => Vec::new(),
    };

    let mut system = Vec::new();
    let mut converted = Vec::new();
    for message in messages {
        match message.get("role").and_then(Value::as_str) {
            Some("system") => system.push(content_text(message.get("content"))),
            Some("tool") => converted.push(json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": message.get("tool_call_id").cloned().unwrap_or(Value::Null),
                    "content": content_text(message.get("content")),
                }]
            })),
            Some("assistant") if message.get("tool_calls").is_some() => {
                converted.push(assistant_with_tool_use(&message))
            }
            _ => converted.push(json!({
                "role": message.get("role").cloned().unwrap_or_else(|| json!("user")),
                "content": message.get("content").cloned().unwrap_or_else(|| json!("")),
            })),
        }
    }

    body.insert("messages".to_string(), Value::Array(converted));
    if !system.is_empty() {
        body.insert("system".to_string(), Value::String(system.join("\n\n")));
    }
    body.entry("max_tokens")
        .or_insert_with(|| json!(ANTHROPIC_DEFAULT_MAX_TOKENS));

    if let Some(stop) = body.remove("stop") {
        body.insert("stop_sequences".to_string(), stop);
    }

    if let Some(Value::Array(tools)) = body.remove("tools") {
        let tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let function = tool.get("function").unwrap_or(tool);
                json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or_else(|| json!("")),
                    "input_schema": function
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tools));
    }

    if let Some(choice) = body.remove("tool_choice") {
        let converted = match &choice {
            Value::String(mode) if mode == "required" => json!({ "type": "any" }),
            Value::String(mode) => json!({ "type": mode }),
            other => match other.pointer("/function/name") {
                Some(name) => json!({ "type": "tool", "name": name }),
                None => other.clone(),
            },
        };
        body.insert("tool_choice".to_string(), converted);
    }
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn assistant_with_tool_use(message: &Value) -> Value {
    let mut blocks = Vec::new();
    let text = content_text(message.get("content"));
    if !text.is_empty() {
        blocks.push(json!({ "type": "text", "text": text }));
    }

    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let arguments = call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .unwrap_or("{}");
        blocks.push(json!({
            "type": "tool_use",
            "id": call.get("id").cloned().unwrap_or(Value::Null),
            "name": call.pointer("/function/name").cloned().unwrap_or(Value::Null),
            "input": serde_json::from_str::<Value>(arguments).unwrap_or_else(|_| json!({})),
        }));
    }

    json!({ "role": "assistant", "content": blocks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::completion::{Message, Tool};
    use crate::client::transport::mock::MockTransport;
    use crate::config::{AuthScheme, RotationStrategy};
    use crate::error::ProviderErrorKind;
    use std::collections::HashMap;

    fn config(protocol: Protocol) -> EffectiveConfig {
        EffectiveConfig {
            provider: "groq".to_string(),
            model: "m1".to_string(),
            base_url: "https://api.groq.example/openai/v1".to_string(),
            headers: HashMap::from([("X-Title".to_string(), "llmao".to_string())]),
            keys: vec!["k1".to_string(), "k2".to_string()],
            rotation_strategy: RotationStrategy::RoundRobin,
            param_mappings: HashMap::new(),
            auth: AuthScheme::bearer(),
            protocol,
        }
    }

    fn anthropic_config() -> EffectiveConfig {
        EffectiveConfig {
            provider: "anthropic".to_string(),
            model: "claude-sonnet".to_string(),
            base_url: "https://api.anthropic.example/v1".to_string(),
            headers: HashMap::from([("anthropic-version".to_string(), "2023-06-01".to_string())]),
            auth: AuthScheme::header("x-api-key"),
            ..config(Protocol::Anthropic)
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![Message::user("Hello")])
    }

    fn openai_reply() -> Value {
        json!({
            "id": "r1",
            "created": 1,
            "model": "m1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "Hi" }, "finish_reason": "stop" }]
        })
    }

    #[test]
    fn test_build_request_openai() {
        let route = Route::new(config(Protocol::OpenAi));
        let key = route.key_pool().pick_next().unwrap();
        let outbound =
            RequestRouter::build_request(route.config(), &key, &request().with_temperature(0.7), false)
                .unwrap();

        assert_eq!(outbound.url, "https://api.groq.example/openai/v1/chat/completions");
        assert_eq!(outbound.header("authorization"), Some("Bearer k1"));
        assert_eq!(outbound.header("x-title"), Some("llmao"));
        assert_eq!(outbound.body["model"], "m1");
        assert_eq!(outbound.body["temperature"], json!(0.7));
        assert!(outbound.body.get("stream").is_none());
        assert!(!outbound.stream);
    }

    #[test]
    fn test_param_mapping_renames_generic_field() {
        let mut config = config(Protocol::OpenAi);
        config
            .param_mappings
            .insert("max_completion_tokens".to_string(), "max_tokens".to_string());
        let route = Route::new(config);
        let key = route.key_pool().pick_next().unwrap();

        let req = request().with_max_tokens(50).with_extra("seed", json!(7));
        let outbound = RequestRouter::build_request(route.config(), &key, &req, true).unwrap();

        assert_eq!(outbound.body["max_completion_tokens"], 50);
        assert!(outbound.body.get("max_tokens").is_none());
        assert_eq!(outbound.body["seed"], 7);
        assert_eq!(outbound.body["stream"], true);
    }

    #[test]
    fn test_routed_model_wins_over_request_field() {
        let route = Route::new(config(Protocol::OpenAi));
        let key = route.key_pool().pick_next().unwrap();
        let req = request().with_extra("model", json!("openai/gpt-4o"));
        let outbound = RequestRouter::build_request(route.config(), &key, &req, false).unwrap();

        assert_eq!(outbound.body["model"], "m1");
        assert_eq!(outbound.url, "https://api.groq.example/openai/v1/chat/completions");
    }

    #[test]
    fn test_auth_header_replaces_configured_header() {
        let mut config = config(Protocol::OpenAi);
        config
            .headers
            .insert("authorization".to_string(), "Bearer stale".to_string());
        let route = Route::new(config);
        let key = route.key_pool().pick_next().unwrap();
        let outbound = RequestRouter::build_request(route.config(), &key, &request(), false).unwrap();

        let auth_headers: Vec<_> = outbound
            .headers
            .keys()
            .filter(|k| k.eq_ignore_ascii_case("authorization"))
            .collect();
        assert_eq!(auth_headers.len(), 1);
        assert_eq!(outbound.header("authorization"), Some("Bearer k1"));
    }

    #[test]
    fn test_build_request_anthropic() {
        let route = Route::new(anthropic_config());
        let key = route.key_pool().pick_next().unwrap();
        let req = CompletionRequest::new(vec![Message::system("Be brief."), Message::user("Weather?")])
        .with_tools(vec![Tool::function(
            "get_weather",
            "Look up weather",
            json!({ "type": "object", "properties": { "location": { "type": "string" } } }),
        )]);

        let outbound = RequestRouter::build_request(route.config(), &key, &req, false).unwrap();

        assert_eq!(outbound.url, "https://api.anthropic.example/v1/messages");
        assert_eq!(outbound.header("x-api-key"), Some("k1"));
        assert_eq!(outbound.header("anthropic-version"), Some("2023-06-01"));
        assert_eq!(outbound.body["system"], "Be brief.");
        assert_eq!(outbound.body["max_tokens"], 4096);
        let messages = outbound.body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(outbound.body["tools"][0]["name"], "get_weather");
        assert_eq!(outbound.body["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn test_anthropic_tool_round_trip_messages() {
        let mut body = json!({
            "model": "claude-sonnet",
            "messages": [
                { "role": "user", "content": "Weather in Tokyo?" },
                {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{
                        "id": "toolu_1",
                        "type": "function",
                        "function": { "name": "get_weather", "arguments": "{\"location\":\"Tokyo\"}" }
                    }]
                },
                { "role": "tool", "content": "22C", "tool_call_id": "toolu_1" }
            ],
            "tool_choice": "required",
            "stop": ["END"]
        });
        to_anthropic_body(body.as_object_mut().unwrap());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["input"]["location"], "Tokyo");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
        assert_eq!(body["tool_choice"], json!({ "type": "any" }));
        assert_eq!(body["stop_sequences"], json!(["END"]));
        assert!(body.get("stop").is_none());
    }

    #[tokio::test]
    async fn test_send_rotates_keys_and_normalizes() {
        let transport = Arc::new(MockTransport::replying(openai_reply()));
        let router = RequestRouter::new(transport.clone(), ClientOptions::default());
        let route = Route::new(config(Protocol::OpenAi));

        for _ in 0..3 {
            let response = router.send(&route, &request()).await.unwrap();
            assert_eq!(response.content(), Some("Hi".to_string()));
        }

        assert_eq!(transport.credentials(), vec!["Bearer k1", "Bearer k2", "Bearer k1"]);
    }

    #[tokio::test]
    async fn test_send_annotates_provider_error() {
        let transport = Arc::new(MockTransport::replying(openai_reply()).failing_with(401));
        let router = RequestRouter::new(transport, ClientOptions::default());
        let route = Route::new(config(Protocol::OpenAi));

        router.send(&route, &request()).await.unwrap_err();
        let err = router.send(&route, &request()).await.unwrap_err();

        assert_eq!(err.provider_kind(), Some(ProviderErrorKind::Authentication));
        let target = err.target().unwrap();
        assert_eq!(target.provider, "groq");
        assert_eq!(target.model, "m1");
        assert_eq!(target.key_index, 1);
        assert!(!err.to_string().contains("k2"));
    }

    #[tokio::test]
    async fn test_stream_error_annotated_after_chunks() {
        let event = |content: &str| {
            json!({
                "id": "s1", "created": 1, "model": "m1",
                "choices": [{ "index": 0, "delta": { "content": content } }]
            })
        };
        let transport = Arc::new(
            MockTransport::streaming(vec![event("c1"), event("c2")]).failing_with(500),
        );
        let router = RequestRouter::new(transport.clone(), ClientOptions::default());
        let route = Route::new(config(Protocol::OpenAi));

        let mut stream = router.stream(&route, &request()).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().content(), Some("c1"));
        assert_eq!(stream.next().await.unwrap().unwrap().content(), Some("c2"));
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.provider_kind(), Some(ProviderErrorKind::Server));
        assert_eq!(err.target().unwrap().key_index, 0);
        assert!(stream.next().await.is_none());

        assert!(transport.requests()[0].stream);
        assert_eq!(transport.requests()[0].body["stream"], true);
    }
}
