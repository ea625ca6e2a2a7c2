//! LLM integration layer.
//!
//! - [`types`] -- Backend-agnostic messages, parts, prompts, and stream deltas.
//! - [`schema`] -- Response schemas and function declarations.
//! - [`adapter`] -- The [`Adapter`] trait every backend implements.
//! - [`providers`] -- The built-in backends.
//! - [`http`] -- Shared request and line-stream plumbing.
//! - [`sse`] -- Server-sent events line parser.

pub mod adapter;
pub mod http;
pub mod providers;
pub mod schema;
pub mod sse;
pub mod types;

pub use adapter::{Adapter, DeltaStream};
pub use schema::{FunctionDeclaration, Schema, SchemaType};
pub use types::{
    FinishReason, GenerationConfig, HandlerMap, JsonMap, Media, Message, ModelTurn, Part, Prompt,
    Role, Status, StreamChunk, StreamDelta, TokenUsage, ToolArguments, ToolCall, ToolResult,
    TurnRequest,
};
