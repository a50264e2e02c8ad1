//! API Module
//!
//! Chat completion API types, response normalization and streaming support.

pub mod bridge;
pub mod completion;
pub mod normalize;
pub mod streaming;

pub use bridge::{ChunkStream, EventSink};
pub use completion::{
    Choice, CompletionRequest, CompletionResponse, ContentPart, FunctionCall, FunctionDefinition,
    ImageUrl, Message, MessageContent, Tool, ToolCall, ToolChoice, ToolChoiceFunction, Usage,
};
pub use normalize::{normalize_response, StreamNormalizer};
pub use streaming::{
    ChunkEnvelope, FunctionDelta, SseDecoder, SseLine, StreamAccumulator, StreamChoice,
    StreamChunk, StreamDelta, ToolCallDelta,
};
