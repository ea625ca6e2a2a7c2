//! Agentic generation engine for llmux.
//!
//! The engine drives a language model through a bounded tool-calling loop.
//! A prompt goes in; the model may request tools, whose results are fed back
//! until it produces a final answer.  The same loop runs over five backends
//! behind a single [`Adapter`] contract, in blocking or streaming mode.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────┐     ┌──────────────┐
//! │ Multiplexer │────>│  Engine  │────>│   Adapter    │──> HTTP
//! │ (route key) │     │ (loop)   │     │ (wire codec) │
//! └─────────────┘     └────┬─────┘     └──────────────┘
//!                          │
//!              ┌───────────┼────────────┐
//!              │           │            │
//!        ┌─────┴────┐ ┌────┴─────┐ ┌────┴─────┐
//!        │  Tools   │ │Compaction│ │ EventBus │
//!        │(handlers)│ │ (media)  │ │ (usage)  │
//!        └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`runtime`] -- The [`Gen`] contract and the blocking tool loop.
//! - [`streaming`] -- Streaming generation and tool-call reassembly.
//! - [`multiplexer`] -- Provider routing with lazily built backends.
//! - [`retry`] -- Exponential-backoff middleware for transient failures.
//! - [`llm`] -- Message types, schemas, and the provider adapters.
//! - [`tools`] -- Tool handlers and the executor.
//! - [`compaction`] -- Placeholder substitution for already-sent media.
//! - [`config`] -- Environment-driven configuration.
//! - [`init`] -- Lazy, cached adapter initialization.
//! - [`error`] -- Engine error types.

pub mod compaction;
pub mod config;
pub mod error;
pub mod init;
pub mod llm;
pub mod multiplexer;
pub mod retry;
pub mod runtime;
pub mod streaming;
pub mod tools;

// Re-export the most commonly used types at the crate root.
pub use compaction::{CompactionStats, compact_history};
pub use config::{EngineConfig, ModelDefaults, RetrySettings};
pub use error::{BlockReason, EngineError, ErrorCategory, Result};
pub use llm::{
    Adapter, DeltaStream, FinishReason, FunctionDeclaration, GenerationConfig, HandlerMap, JsonMap,
    Media, Message, ModelTurn, Part, Prompt, Role, Schema, SchemaType, Status, StreamChunk,
    StreamDelta, TokenUsage, ToolArguments, ToolCall, ToolResult, TurnRequest,
};
pub use multiplexer::{Multiplexer, MultiplexerBuilder};
pub use retry::Retrying;
pub use runtime::{Engine, EngineOptions, Gen};
pub use streaming::{ChunkStream, ToolCallAccumulator};
pub use tools::{HandlerError, ToolExecutor, ToolHandler, handler_fn, handler_map};

pub use llmux_kernel::{Event, EventBus, NotificationKind};
