//! Streaming Support
//!
//! Chunk envelopes, the canonical streamed record, Server-Sent Events decoding
//! and folding a chunk sequence back into a full response.

use crate::api::completion::{
    Choice, CompletionResponse, FunctionCall, Message, MessageContent, ToolCall,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One normalized streamed event for a single choice
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEnvelope {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub index: u32,
    /// Only the fields that changed in this event
    pub delta: StreamDelta,
    /// Set only on the terminal chunk of the choice
    pub finish_reason: Option<String>,
}

impl ChunkEnvelope {
    /// The canonical record handed to the caller
    pub fn into_chunk(self) -> StreamChunk {
        StreamChunk {
            id: self.id,
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model,
            choices: vec![StreamChoice {
                index: self.index,
                delta: self.delta,
                finish_reason: self.finish_reason,
            }],
        }
    }
}

/// A streamed chunk as seen by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,

    /// Object type, always `chat.completion.chunk`
    pub object: String,
    pub created: u64,
    pub model: String,

    /// Exactly one choice
    pub choices: Vec<StreamChoice>,
}

impl StreamChunk {
    /// Content delta of the first choice, if any
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: StreamDelta,

    /// Finish reason; serialized as `null` until the terminal chunk
    pub finish_reason: Option<String>,
}

/// Partial message carried by one chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Role (usually only in first chunk)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

impl StreamDelta {
    pub fn is_empty(&self) -> bool {
        self.role.is_none() && self.content.is_none() && self.tool_calls.is_none()
    }
}

/// Fragment of one tool call; fragments sharing `index` concatenate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Index in the tool_calls array
    pub index: u32,

    /// Tool call ID (only in first chunk for this tool call)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Type (only in first chunk)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "type")]
    pub call_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDelta {
    /// Function name (only in first chunk)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Accumulator for streaming chunks
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    /// Response ID from the first chunk
    pub id: Option<String>,

    /// Model name from the first chunk
    pub model: Option<String>,

    /// Created timestamp from the first chunk
    pub created: Option<u64>,

    /// Per-choice state, by choice index
    choices: BTreeMap<u32, ChoiceAccumulator>,
}

#[derive(Debug, Default)]
struct ChoiceAccumulator {
    role: Option<String>,
    content: String,
    /// Keyed by the provider's index, which need not be dense
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    finish_reason: Option<String>,
}

/// Accumulator for a single tool call
#[derive(Debug, Default, Clone)]
struct ToolCallAccumulator {
    id: String,
    call_type: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    /// Create a new accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a streaming chunk
    pub fn process_chunk(&mut self, chunk: &StreamChunk) {
        // Store metadata from first chunk
        if self.id.is_none() {
            self.id = Some(chunk.id.clone());
            self.model = Some(chunk.model.clone());
            self.created = Some(chunk.created);
        }

        for choice in &chunk.choices {
            let acc = self.choices.entry(choice.index).or_default();

            if let Some(role) = &choice.delta.role {
                if acc.role.is_none() {
                    acc.role = Some(role.clone());
                }
            }

            if let Some(content) = &choice.delta.content {
                acc.content.push_str(content);
            }

            if let Some(tool_calls) = &choice.delta.tool_calls {
                for tc_delta in tool_calls {
                    let tc = acc.tool_calls.entry(tc_delta.index).or_default();

                    if let Some(id) = &tc_delta.id {
                        tc.id = id.clone();
                    }
                    if let Some(call_type) = &tc_delta.call_type {
                        tc.call_type = call_type.clone();
                    }
                    if let Some(func) = &tc_delta.function {
                        if let Some(name) = &func.name {
                            tc.name.push_str(name);
                        }
                        if let Some(args) = &func.arguments {
                            tc.arguments.push_str(args);
                        }
                    }
                }
            }

            if let Some(reason) = &choice.finish_reason {
                acc.finish_reason = Some(reason.clone());
            }
        }
    }

    /// Convert to a full response
    pub fn into_response(self) -> CompletionResponse {
        let choices = self
            .choices
            .into_iter()
            .map(|(index, acc)| {
                let tool_calls = if acc.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        acc.tool_calls
                            .into_values()
                            .map(|tc| ToolCall {
                                id: tc.id,
                                call_type: if tc.call_type.is_empty() {
                                    "function".to_string()
                                } else {
                                    tc.call_type
                                },
                                function: FunctionCall {
                                    name: tc.name,
                                    arguments: tc.arguments,
                                },
                            })
                            .collect(),
                    )
                };

                Choice {
                    index,
                    message: Message {
                        role: acc.role.unwrap_or_else(|| "assistant".to_string()),
                        content: MessageContent::Text(acc.content),
                        reasoning: None,
                        name: None,
                        tool_calls,
                        tool_call_id: None,
                    },
                    finish_reason: acc.finish_reason,
                }
            })
            .collect();

        CompletionResponse {
            id: self.id.unwrap_or_default(),
            object: "chat.completion".to_string(),
            created: self.created.unwrap_or_default(),
            model: self.model.unwrap_or_default(),
            choices,
            usage: None,
        }
    }
}

/// One classified line of a Server-Sent Events body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// A `data:` payload
    Data(String),
    /// The `data: [DONE]` terminator
    Done,
    /// Blank line, comment, or a field other than `data`
    Ignored,
}

/// Parse a single SSE line
pub fn parse_sse_line(line: &str) -> SseLine {
    // Skip empty lines and comments
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Ignored;
    }

    // Parse data: prefix (the space after the colon is optional)
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim();

        if data == "[DONE]" {
            return SseLine::Done;
        }
        if data.is_empty() {
            return SseLine::Ignored;
        }
        return SseLine::Data(data.to_string());
    }

    // Ignore other fields (event:, id:, retry:)
    SseLine::Ignored
}

/// Incremental SSE decoder for a body arriving in arbitrary byte chunks
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes; returns the meaningful lines completed by them
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseLine> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let parsed = parse_sse_line(&String::from_utf8_lossy(&raw));
            if parsed != SseLine::Ignored {
                lines.push(parsed);
            }
        }
        lines
    }

    /// Flush a trailing line that was not newline-terminated
    pub fn finish(&mut self) -> Option<SseLine> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        match parse_sse_line(&String::from_utf8_lossy(&raw)) {
            SseLine::Ignored => None,
            line => Some(line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(content: &str, finish_reason: Option<&str>) -> ChunkEnvelope {
        ChunkEnvelope {
            id: "test".to_string(),
            created: 12345,
            model: "gpt-4".to_string(),
            index: 0,
            delta: StreamDelta {
                role: None,
                content: Some(content.to_string()),
                tool_calls: None,
            },
            finish_reason: finish_reason.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_sse_line() {
        let line = r#"data: {"id":"chatcmpl-123","choices":[]}"#;
        assert_eq!(
            parse_sse_line(line),
            SseLine::Data(r#"{"id":"chatcmpl-123","choices":[]}"#.to_string())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Ignored);
        assert_eq!(parse_sse_line("event: message_start"), SseLine::Ignored);
        assert_eq!(parse_sse_line("data:{}"), SseLine::Data("{}".to_string()));
    }

    #[test]
    fn test_sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::new();

        assert!(decoder.feed(b"data: {\"a\":").is_empty());
        let lines = decoder.feed(b"1}\r\n\r\ndata: {\"b\":2}\n\ndata: [DO");
        assert_eq!(
            lines,
            vec![
                SseLine::Data("{\"a\":1}".to_string()),
                SseLine::Data("{\"b\":2}".to_string()),
            ]
        );
        assert_eq!(decoder.feed(b"NE]\n"), vec![SseLine::Done]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_sse_decoder_flushes_trailing_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"c\":3}").is_empty());
        assert_eq!(decoder.finish(), Some(SseLine::Data("{\"c\":3}".to_string())));
    }

    #[test]
    fn test_sse_decoder_multibyte_boundary() {
        let mut decoder = SseDecoder::new();
        let line = "data: {\"t\":\"héllo\"}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        assert!(decoder.feed(&line[..split]).is_empty());
        assert_eq!(
            decoder.feed(&line[split..]),
            vec![SseLine::Data("{\"t\":\"héllo\"}".to_string())]
        );
    }

    #[test]
    fn test_envelope_into_chunk_shape() {
        let chunk = envelope("Hi", None).into_chunk();
        let json = serde_json::to_value(&chunk).unwrap();

        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"].as_array().unwrap().len(), 1);
        assert_eq!(json["choices"][0]["delta"], serde_json::json!({ "content": "Hi" }));
        assert!(json["choices"][0]["finish_reason"].is_null());
    }

    #[test]
    fn test_stream_accumulator() {
        let mut acc = StreamAccumulator::new();

        let mut first = envelope("Hello", None);
        first.delta.role = Some("assistant".to_string());
        acc.process_chunk(&first.into_chunk());
        acc.process_chunk(&envelope(" World", Some("stop")).into_chunk());

        let response = acc.into_response();
        assert_eq!(response.id, "test");
        assert_eq!(response.content(), Some("Hello World".to_string()));
        assert_eq!(response.finish_reason(), Some("stop"));
        assert_eq!(response.choices[0].message.role, "assistant");
    }

    #[test]
    fn test_stream_accumulator_tool_calls() {
        let mut acc = StreamAccumulator::new();
        let mut first = envelope("", None);
        first.delta.content = None;
        first.delta.tool_calls = Some(vec![ToolCallDelta {
            index: 0,
            id: Some("call_1".to_string()),
            call_type: Some("function".to_string()),
            function: Some(FunctionDelta {
                name: Some("get_weather".to_string()),
                arguments: Some("{\"location\":".to_string()),
            }),
        }]);
        let mut second = envelope("", Some("tool_calls"));
        second.delta.content = None;
        second.delta.tool_calls = Some(vec![ToolCallDelta {
            index: 0,
            id: None,
            call_type: None,
            function: Some(FunctionDelta {
                name: None,
                arguments: Some("\"Tokyo\"}".to_string()),
            }),
        }]);

        acc.process_chunk(&first.into_chunk());
        acc.process_chunk(&second.into_chunk());

        let response = acc.into_response();
        let calls = response.tool_calls().unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, "{\"location\":\"Tokyo\"}");
        assert_eq!(response.finish_reason(), Some("tool_calls"));
    }

    #[test]
    fn test_stream_accumulator_sparse_tool_call_index() {
        let mut acc = StreamAccumulator::new();
        for (index, id) in [(3, "call_x"), (4_000_000_000, "call_y")] {
            let mut chunk = envelope("", None);
            chunk.delta.content = None;
            chunk.delta.tool_calls = Some(vec![ToolCallDelta {
                index,
                id: Some(id.to_string()),
                call_type: None,
                function: Some(FunctionDelta {
                    name: Some("lookup".to_string()),
                    arguments: Some("{}".to_string()),
                }),
            }]);
            acc.process_chunk(&chunk.into_chunk());
        }

        let response = acc.into_response();
        let ids: Vec<&str> = response
            .tool_calls()
            .unwrap()
            .iter()
            .map(|call| call.id.as_str())
            .collect();
        assert_eq!(ids, vec!["call_x", "call_y"]);
    }
}
