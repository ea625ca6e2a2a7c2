//! Engine error types.
//!
//! Every fatal condition surfaces through [`EngineError`].  Variants are
//! grouped by [`ErrorCategory`] so callers can react differently to a refused
//! request, a runaway tool loop, or a misconfigured backend.

/// Why a backend refused to produce content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Safety,
    Recitation,
    Blocklist,
    ProhibitedContent,
    Spii,
    /// Prompt-level block with a reason the engine does not model.
    Other,
}

impl BlockReason {
    fn describe(self) -> &'static str {
        match self {
            Self::Safety => "response blocked by safety filters",
            Self::Recitation => "response blocked due to potential recitation",
            Self::Blocklist => "response blocked due to forbidden terms",
            Self::ProhibitedContent => "response blocked due to prohibited content",
            Self::Spii => "response blocked due to sensitive personal information",
            Self::Other => "prompt blocked",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// Coarse classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing credentials or endpoint.  Never retried.
    Configuration,
    /// Transport failures and malformed or unusable backend responses.
    Protocol,
    /// The backend refused the request on content-policy grounds.
    ContentPolicy,
    /// The tool-iteration budget ran out.
    ResourceExhausted,
    /// A tool handler failed.
    Handler,
    /// The caller cancelled the invocation.
    Cancelled,
    Internal,
}

/// Unified error type for the generation engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- Configuration -------------------------------------------------------
    /// A backend is missing mandatory configuration.  `message` names the
    /// environment variables to set.
    #[error("{provider} is not configured: {message}")]
    Config { provider: String, message: String },

    // -- Protocol ------------------------------------------------------------
    /// The requested provider key resolves to no factory.
    #[error("multiplexer: unsupported LLM provider {provider:?}")]
    UnsupportedProvider { provider: String },

    /// An HTTP request to the backend failed or returned a non-success status.
    #[error("llm request failed: {reason}")]
    LlmRequestFailed { reason: String },

    /// The backend response could not be parsed.
    #[error("llm response parse error: {reason}")]
    LlmParseFailed { reason: String },

    /// The streaming connection was interrupted or produced invalid data.
    #[error("llm stream error: {reason}")]
    LlmStreamError { reason: String },

    /// The backend answered without any candidate.
    #[error("no candidates generated")]
    NoCandidates,

    /// The response had no text, no tool calls, and no tool ran earlier.
    #[error("no usable content in response")]
    EmptyResponse,

    /// The model emitted a function call the backend could not parse.
    #[error("model generated invalid function call: {message}")]
    MalformedFunctionCall { message: String },

    /// The model asked for a tool the prompt does not provide.
    #[error("no handler found for function {tool_name:?}")]
    NoHandler { tool_name: String },

    /// Tool-call arguments were not a JSON object.
    #[error("invalid arguments for function {tool_name:?}: {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    /// A `viewImage` / `viewDocument` result carried an unusable payload.
    #[error("invalid {tool_name} response: {reason}")]
    InvalidToolPayload { tool_name: String, reason: String },

    // -- Content policy ------------------------------------------------------
    /// The backend blocked the response.  `message` is the backend's text.
    #[error("{reason}: {message}")]
    ContentBlocked { reason: BlockReason, message: String },

    // -- Resource exhaustion -------------------------------------------------
    #[error("exceeded maximum tool call iterations ({max_iterations}) without completion")]
    MaxIterationsExceeded { max_iterations: usize },

    // -- Handler -------------------------------------------------------------
    /// A tool handler returned an error.
    #[error("error handling function {tool_name:?}: {reason}")]
    Handler { tool_name: String, reason: String },

    // -- Generic -------------------------------------------------------------
    #[error("generation cancelled")]
    Cancelled,

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal engine error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Build a configuration error for `provider`.
    pub fn config(provider: &str, message: impl Into<String>) -> Self {
        Self::Config {
            provider: provider.to_owned(),
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } => ErrorCategory::Configuration,
            Self::UnsupportedProvider { .. }
            | Self::LlmRequestFailed { .. }
            | Self::LlmParseFailed { .. }
            | Self::LlmStreamError { .. }
            | Self::NoCandidates
            | Self::EmptyResponse
            | Self::MalformedFunctionCall { .. }
            | Self::NoHandler { .. }
            | Self::InvalidArguments { .. }
            | Self::InvalidToolPayload { .. }
            | Self::Json(_) => ErrorCategory::Protocol,
            Self::ContentBlocked { .. } => ErrorCategory::ContentPolicy,
            Self::MaxIterationsExceeded { .. } => ErrorCategory::ResourceExhausted,
            Self::Handler { .. } => ErrorCategory::Handler,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Transport-level failures that may succeed when the whole invocation
    /// is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LlmRequestFailed { .. } | Self::LlmStreamError { .. }
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::LlmRequestFailed {
            reason: err.to_string(),
        }
    }
}
