//! Core types for LLM interaction.
//!
//! These types are backend-agnostic.  Each adapter in
//! [`super::providers`] translates them into its own wire format and back.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::schema::{FunctionDeclaration, Schema};
use crate::tools::ToolHandler;

pub use llmux_kernel::TokenUsage;

/// Tool-iteration budget applied when a prompt leaves it unset.
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 200;

/// JSON object used for tool arguments and tool results.
pub type JsonMap = Map<String, Value>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Input from the human user, including tool-produced media.
    User,
    /// Output from the LLM.
    Model,
    /// Results of tool invocations, fed back to the model.
    Tool,
}

/// Inline binary media (image, PDF, ...).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Media {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Standard base64 encoding of the payload.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.data)
    }

    /// `data:<mime>;base64,<payload>` URL.
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// Text that replaces this media once it has been sent.
    pub fn placeholder(&self) -> String {
        format!(
            "[previously loaded {}, {} bytes]",
            self.mime_type,
            self.data.len()
        )
    }
}

impl fmt::Debug for Media {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Media")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Tool-call arguments as the backend delivered them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolArguments {
    /// JSON text (OpenAI-style `function.arguments`).
    Json(String),
    /// An already-structured value (genai `args`, Ollama `arguments`).
    Value(Value),
}

impl Default for ToolArguments {
    fn default() -> Self {
        Self::Value(Value::Null)
    }
}

impl ToolArguments {
    /// Best-effort object view used when re-encoding history.  Invalid JSON
    /// renders as an empty object; the executor rejects it before it could
    /// ever be resent.
    pub fn to_map_lossy(&self) -> JsonMap {
        match self {
            Self::Json(text) => serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .unwrap_or_default(),
            Self::Value(Value::Object(map)) => map.clone(),
            Self::Value(_) => JsonMap::new(),
        }
    }

    /// JSON text form, as required by OpenAI-compatible backends.
    pub fn to_json_string(&self) -> String {
        match self {
            Self::Json(text) if !text.trim().is_empty() => text.clone(),
            _ => Value::Object(self.to_map_lossy()).to_string(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Backend-assigned id.  Empty for backends that do not assign one.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: ToolArguments,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// The marshalled result of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Echo of [`ToolCall::id`].
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Handler output with binary payload fields removed.
    pub response: JsonMap,
}

impl ToolResult {
    /// The response map as JSON text.
    pub fn response_json(&self) -> String {
        Value::Object(self.response.clone()).to_string()
    }
}

/// One element of a message.  Exactly one variant is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    /// Reasoning text.  Hidden from the caller unless a debug toggle is set.
    Thinking(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Media(Media),
}

/// A single message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// A user message with a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::Text(text.into())])
    }

    /// A model message with a single text part.
    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, vec![Part::Text(text.into())])
    }

    /// A tool message answering a set of calls, in call order.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self::new(Role::Tool, results.into_iter().map(Part::ToolResult).collect())
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Thinking segments, in order.
    pub fn thoughts(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Thinking(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Tool calls, in the order the model requested them.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::ToolCall(_)))
    }

    pub fn tool_results_iter(&self) -> impl Iterator<Item = &ToolResult> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolResult(r) => Some(r),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Finish reasons
// ---------------------------------------------------------------------------

/// Why the backend stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// Output-token ceiling reached.  The partial answer is still usable.
    MaxTokens,
    /// The backend stopped to let the caller run tools.
    ToolCalls,
    Safety,
    Recitation,
    Blocklist,
    ProhibitedContent,
    Spii,
    MalformedFunctionCall,
    /// Any reason the engine does not interpret.
    Other(String),
    /// The backend did not report a reason.
    Unspecified,
}

// ---------------------------------------------------------------------------
// Requests and turns
// ---------------------------------------------------------------------------

/// Per-request generation settings, resolved from the prompt and the
/// configured defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationConfig {
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub response_schema: Option<Schema>,
    pub functions: Vec<FunctionDeclaration>,
}

impl GenerationConfig {
    /// System text for backends without a native schema field: the
    /// instruction, or a JSON-schema directive when there is none.
    pub fn instruction_with_schema_fallback(&self) -> Option<String> {
        match (&self.system_instruction, &self.response_schema) {
            (Some(instruction), _) if !instruction.trim().is_empty() => Some(instruction.clone()),
            (_, Some(schema)) => Some(format!(
                "You must respond with JSON matching this schema:\n{}",
                schema.to_json_pretty()
            )),
            _ => None,
        }
    }
}

/// Everything an adapter needs for one outbound call.
#[derive(Debug, Clone, Copy)]
pub struct TurnRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub config: &'a GenerationConfig,
}

/// The normalized result of one blocking round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTurn {
    pub message: Message,
    pub finish_reason: FinishReason,
    /// Backend explanation accompanying the finish reason, if any.
    pub finish_message: String,
    pub usage: Option<TokenUsage>,
}

impl ModelTurn {
    pub fn has_tool_calls(&self) -> bool {
        self.message.has_tool_calls()
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Identifies the tool call a streamed fragment belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FragmentKey {
    /// Position in the backend's tool-call array.
    Index(u32),
    /// Backend-assigned call id.  An empty id continues the latest call.
    Id(String),
}

/// Arguments carried by a streamed fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentsFragment {
    /// A piece of JSON text to append.
    Partial(String),
    /// The complete, already-structured arguments.
    Complete(Value),
}

/// A piece of a tool call delivered by a streaming backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallFragment {
    pub key: FragmentKey,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<ArgumentsFragment>,
}

/// One decoded event from a backend's incremental stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Thinking(String),
    /// Closes the current reasoning block.  The next thinking delta starts a
    /// new one.
    ThinkingBreak,
    ToolCall(ToolCallFragment),
    Usage(TokenUsage),
    Finish {
        reason: FinishReason,
        message: String,
    },
}

/// A chunk delivered to the caller of a streaming generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    pub text: String,
    pub thinking: String,
    /// Consolidated tool calls, emitted once per model turn.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            thinking: text.into(),
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn usage(usage: TokenUsage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Name → handler map supplied with a prompt.
pub type HandlerMap = HashMap<String, Arc<dyn ToolHandler>>;

/// A complete generation request.
#[derive(Clone, Default)]
pub struct Prompt {
    pub text: String,
    pub instruction: String,
    /// Inline attachments sent with the first user message.
    pub media: Vec<Media>,
    /// Target model.  Empty means the adapter's configured default.
    pub model_name: String,
    /// Values `<= 0` fall back to the configured default.
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: i32,
    pub response_schema: Option<Schema>,
    pub functions: Vec<FunctionDeclaration>,
    pub handlers: HandlerMap,
    /// Values `<= 0` mean [`DEFAULT_MAX_TOOL_ITERATIONS`].
    pub max_tool_iterations: i32,
    /// Explicit provider key or alias.  Empty means the multiplexer default.
    pub provider: String,
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&String> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("Prompt")
            .field("text", &self.text)
            .field("instruction", &self.instruction)
            .field("media", &self.media)
            .field("model_name", &self.model_name)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_tokens", &self.max_tokens)
            .field("functions", &self.functions.len())
            .field("handlers", &handlers)
            .field("max_tool_iterations", &self.max_tool_iterations)
            .field("provider", &self.provider)
            .finish()
    }
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_name = model.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.media.push(media);
        self
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_max_tool_iterations(mut self, limit: i32) -> Self {
        self.max_tool_iterations = limit;
        self
    }

    /// Register a callable function together with its handler.
    pub fn with_tool(mut self, declaration: FunctionDeclaration, handler: Arc<dyn ToolHandler>) -> Self {
        self.handlers.insert(declaration.name.clone(), handler);
        self.functions.push(declaration);
        self
    }

    /// Effective tool-iteration budget.
    pub fn tool_iteration_limit(&self) -> usize {
        if self.max_tool_iterations <= 0 {
            DEFAULT_MAX_TOOL_ITERATIONS
        } else {
            self.max_tool_iterations as usize
        }
    }

    /// The first user message: prompt text followed by attachments.
    pub fn initial_message(&self) -> Message {
        let mut parts = Vec::with_capacity(1 + self.media.len());
        parts.push(Part::Text(self.text.clone()));
        parts.extend(
            self.media
                .iter()
                .filter(|m| !m.data.is_empty())
                .cloned()
                .map(Part::Media),
        );
        Message::new(Role::User, parts)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Read-only configuration report for a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Whether mandatory configuration is present.
    pub configured: bool,
    /// Backend name (e.g. `"gemini"`, `"vertex"`, `"ollama"`).
    pub backend: String,
    /// Model description (name and sampling defaults).
    pub model: String,
    /// Human-readable detail.
    pub message: String,
}
