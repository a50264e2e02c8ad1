//! Response Normalization
//!
//! Maps vendor payloads into the canonical [`CompletionResponse`] and
//! [`ChunkEnvelope`] shapes. Vendor field names stop here.

use crate::api::completion::{
    Choice, CompletionResponse, FunctionCall, Message, MessageContent, ToolCall, Usage,
};
use crate::api::streaming::{ChunkEnvelope, FunctionDelta, StreamDelta, ToolCallDelta};
use crate::client::failure::kind_from_error_type;
use crate::config::Protocol;
use crate::error::{LlmaoError, Result};
use serde_json::Value;
use std::collections::HashMap;

/// Token counter clamped to `u32::MAX`
fn token_count(usage: &Value, field: &str) -> u32 {
    usage
        .get(field)
        .and_then(Value::as_u64)
        .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Error object embedded in an otherwise successful payload
fn embedded_error(value: &Value) -> Option<LlmaoError> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("unknown provider error")
        .to_string();
    let kind = error
        .get("type")
        .or_else(|| error.get("code"))
        .and_then(Value::as_str)
        .map(kind_from_error_type)
        .unwrap_or(crate::error::ProviderErrorKind::Other);

    Some(LlmaoError::Provider {
        kind,
        status: 200,
        message,
        retry_after: None,
        target: None,
    })
}

/// Normalize a non-streaming response body
pub fn normalize_response(protocol: Protocol, body: Value, model: &str) -> Result<CompletionResponse> {
    if let Some(err) = embedded_error(&body) {
        return Err(err);
    }
    if !body.is_object() {
        return Err(LlmaoError::Response(format!(
            "Expected a JSON object, got: {}",
            truncate(&body.to_string())
        )));
    }

    match protocol {
        Protocol::OpenAi => openai_response(&body, model),
        Protocol::Anthropic => anthropic_response(&body, model),
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(500).collect()
}

fn openai_response(body: &Value, model: &str) -> Result<CompletionResponse> {
    let created = body.get("created").and_then(Value::as_u64).unwrap_or_else(now);
    let raw_choices = body
        .get("choices")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            LlmaoError::Response(format!(
                "Response has no `choices`: {}",
                truncate(&body.to_string())
            ))
        })?;

    let choices = raw_choices
        .iter()
        .enumerate()
        .map(|(position, choice)| {
            let message = choice.get("message").cloned().unwrap_or(Value::Null);
            Choice {
                index: choice
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64) as u32,
                message: openai_message(&message),
                finish_reason: str_field(choice, "finish_reason"),
            }
        })
        .collect();

    Ok(CompletionResponse {
        id: str_field(body, "id").unwrap_or_else(|| format!("llmao-{}", created)),
        object: "chat.completion".to_string(),
        created,
        model: str_field(body, "model").unwrap_or_else(|| model.to_string()),
        choices,
        usage: body.get("usage").filter(|u| u.is_object()).map(|u| {
            let prompt = token_count(u, "prompt_tokens");
            let completion = token_count(u, "completion_tokens");
            Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: u
                    .get("total_tokens")
                    .map_or(prompt.saturating_add(completion), |_| token_count(u, "total_tokens")),
            }
        }),
    })
}

fn openai_message(message: &Value) -> Message {
    let reasoning = str_field(message, "reasoning").or_else(|| str_field(message, "reasoning_content"));

    let mut content = match message.get("content") {
        None | Some(Value::Null) => MessageContent::default(),
        Some(Value::String(s)) => MessageContent::Text(s.clone()),
        Some(other) => serde_json::from_value(other.clone())
            .unwrap_or_else(|_| MessageContent::Text(other.to_string())),
    };

    // Reasoning-only answers surface their reasoning as content
    if content.is_empty() {
        if let Some(reasoning) = &reasoning {
            content = MessageContent::Text(reasoning.clone());
        }
    }

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .filter(|calls| !calls.is_empty())
        .map(|calls| calls.iter().map(openai_tool_call).collect());

    Message {
        role: str_field(message, "role").unwrap_or_else(|| "assistant".to_string()),
        content,
        reasoning,
        name: None,
        tool_calls,
        tool_call_id: None,
    }
}

fn openai_tool_call(call: &Value) -> ToolCall {
    let function = call.get("function").cloned().unwrap_or(Value::Null);
    ToolCall {
        id: str_field(call, "id").unwrap_or_default(),
        call_type: str_field(call, "type").unwrap_or_else(|| "function".to_string()),
        function: FunctionCall {
            name: str_field(&function, "name").unwrap_or_default(),
            arguments: arguments_string(function.get("arguments")),
        },
    }
}

fn arguments_string(arguments: Option<&Value>) -> String {
    match arguments {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Map an Anthropic stop reason to the canonical finish reason
pub fn anthropic_finish_reason(stop_reason: &str) -> String {
    match stop_reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    }
    .to_string()
}

fn anthropic_response(body: &Value, model: &str) -> Result<CompletionResponse> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            LlmaoError::Response(format!(
                "Response has no `content` blocks: {}",
                truncate(&body.to_string())
            ))
        })?;

    let mut text = String::new();
    let mut reasoning: Option<String> = None;
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => text.push_str(block.get("text").and_then(Value::as_str).unwrap_or("")),
            Some("thinking") => {
                if let Some(thinking) = block.get("thinking").and_then(Value::as_str) {
                    reasoning.get_or_insert_with(String::new).push_str(thinking);
                }
            }
            Some("tool_use") => tool_calls.push(ToolCall {
                id: str_field(block, "id").unwrap_or_default(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: str_field(block, "name").unwrap_or_default(),
                    arguments: arguments_string(block.get("input")),
                },
            }),
            _ => {}
        }
    }

    let usage = body.get("usage").map(|u| {
        let prompt = token_count(u, "input_tokens");
        let completion = token_count(u, "output_tokens");
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt.saturating_add(completion),
        }
    });

    let created = now();
    Ok(CompletionResponse {
        id: str_field(body, "id").unwrap_or_else(|| format!("llmao-{}", created)),
        object: "chat.completion".to_string(),
        created,
        model: str_field(body, "model").unwrap_or_else(|| model.to_string()),
        choices: vec![Choice {
            index: 0,
            message: Message {
                role: str_field(body, "role").unwrap_or_else(|| "assistant".to_string()),
                content: MessageContent::Text(text),
                reasoning,
                name: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            },
            finish_reason: body
                .get("stop_reason")
                .and_then(Value::as_str)
                .map(anthropic_finish_reason),
        }],
        usage,
    })
}

/// Turns raw stream events of one request into chunk envelopes.
///
/// Stateful: Anthropic streams announce the message id and model once and
/// identify tool calls by content block index.
#[derive(Debug)]
pub struct StreamNormalizer {
    protocol: Protocol,
    id: String,
    model: String,
    created: u64,
    /// Anthropic content block index -> tool call index
    tool_blocks: HashMap<u64, u32>,
}

impl StreamNormalizer {
    pub fn new(protocol: Protocol, model: impl Into<String>) -> Self {
        Self {
            protocol,
            id: String::new(),
            model: model.into(),
            created: now(),
            tool_blocks: HashMap::new(),
        }
    }

    /// Normalize one raw event. Events that carry nothing for the caller
    /// (keep-alives, usage-only frames, block boundaries) yield no envelope.
    pub fn normalize(&mut self, event: &Value) -> Result<Vec<ChunkEnvelope>> {
        if let Some(err) = embedded_error(event) {
            return Err(err);
        }

        match self.protocol {
            Protocol::OpenAi => Ok(self.openai_event(event)),
            Protocol::Anthropic => Ok(self.anthropic_event(event)),
        }
    }

    fn openai_event(&mut self, event: &Value) -> Vec<ChunkEnvelope> {
        let id = str_field(event, "id").unwrap_or_else(|| self.id.clone());
        let created = event
            .get("created")
            .and_then(Value::as_u64)
            .unwrap_or(self.created);
        let model = str_field(event, "model").unwrap_or_else(|| self.model.clone());

        let Some(choices) = event.get("choices").and_then(Value::as_array) else {
            return Vec::new();
        };

        choices
            .iter()
            .enumerate()
            .filter_map(|(position, choice)| {
                let raw_delta = choice.get("delta").cloned().unwrap_or(Value::Null);
                let delta = StreamDelta {
                    role: str_field(&raw_delta, "role"),
                    content: str_field(&raw_delta, "content"),
                    tool_calls: raw_delta
                        .get("tool_calls")
                        .and_then(Value::as_array)
                        .filter(|calls| !calls.is_empty())
                        .map(|calls| {
                            calls
                                .iter()
                                .enumerate()
                                .map(|(i, call)| openai_tool_call_delta(call, i))
                                .collect()
                        }),
                };
                let finish_reason = str_field(choice, "finish_reason");

                if delta.is_empty() && finish_reason.is_none() {
                    return None;
                }

                Some(ChunkEnvelope {
                    id: id.clone(),
                    created,
                    model: model.clone(),
                    index: choice
                        .get("index")
                        .and_then(Value::as_u64)
                        .unwrap_or(position as u64) as u32,
                    delta,
                    finish_reason,
                })
            })
            .collect()
    }

    fn envelope(&self, delta: StreamDelta, finish_reason: Option<String>) -> ChunkEnvelope {
        ChunkEnvelope {
            id: self.id.clone(),
            created: self.created,
            model: self.model.clone(),
            index: 0,
            delta,
            finish_reason,
        }
    }

    fn anthropic_event(&mut self, event: &Value) -> Vec<ChunkEnvelope> {
        match event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let message = event.get("message").cloned().unwrap_or(Value::Null);
                if let Some(id) = str_field(&message, "id") {
                    self.id = id;
                }
                if let Some(model) = str_field(&message, "model") {
                    self.model = model;
                }
                let role = str_field(&message, "role").unwrap_or_else(|| "assistant".to_string());
                vec![self.envelope(
                    StreamDelta {
                        role: Some(role),
                        ..Default::default()
                    },
                    None,
                )]
            }
            Some("content_block_start") => {
                let block = event.get("content_block").cloned().unwrap_or(Value::Null);
                let block_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let tool_index = self.tool_blocks.len() as u32;
                        self.tool_blocks.insert(block_index, tool_index);
                        vec![self.envelope(
                            StreamDelta {
                                tool_calls: Some(vec![ToolCallDelta {
                                    index: tool_index,
                                    id: str_field(&block, "id"),
                                    call_type: Some("function".to_string()),
                                    function: Some(FunctionDelta {
                                        name: str_field(&block, "name"),
                                        arguments: Some(String::new()),
                                    }),
                                }]),
                                ..Default::default()
                            },
                            None,
                        )]
                    }
                    Some("text") => match str_field(&block, "text").filter(|t| !t.is_empty()) {
                        Some(text) => vec![self.envelope(
                            StreamDelta {
                                content: Some(text),
                                ..Default::default()
                            },
                            None,
                        )],
                        None => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
            Some("content_block_delta") => {
                let delta = event.get("delta").cloned().unwrap_or(Value::Null);
                let block_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => vec![self.envelope(
                        StreamDelta {
                            content: str_field(&delta, "text"),
                            ..Default::default()
                        },
                        None,
                    )],
                    Some("input_json_delta") => {
                        let Some(&tool_index) = self.tool_blocks.get(&block_index) else {
                            return Vec::new();
                        };
                        vec![self.envelope(
                            StreamDelta {
                                tool_calls: Some(vec![ToolCallDelta {
                                    index: tool_index,
                                    id: None,
                                    call_type: None,
                                    function: Some(FunctionDelta {
                                        name: None,
                                        arguments: str_field(&delta, "partial_json"),
                                    }),
                                }]),
                                ..Default::default()
                            },
                            None,
                        )]
                    }
                    _ => Vec::new(),
                }
            }
            Some("message_delta") => event
                .pointer("/delta/stop_reason")
                .and_then(Value::as_str)
                .map(|reason| {
                    vec![self.envelope(StreamDelta::default(), Some(anthropic_finish_reason(reason)))]
                })
                .unwrap_or_default(),
            // ping, content_block_stop, message_stop
            _ => Vec::new(),
        }
    }
}

fn openai_tool_call_delta(call: &Value, position: usize) -> ToolCallDelta {
    let function = call.get("function");
    ToolCallDelta {
        index: call
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(position as u64) as u32,
        id: str_field(call, "id"),
        call_type: str_field(call, "type"),
        function: function.map(|f| FunctionDelta {
            name: str_field(f, "name"),
            arguments: f.get("arguments").map(|a| arguments_string(Some(a))),
        }),
    }
}
