//! Backend adapters.
//!
//! - [`genai`] -- Gemini API and Vertex AI.
//! - [`openai`] -- OpenAI Chat Completions, plus the wire codec LM Studio reuses.
//! - [`anthropic`] -- Anthropic Messages API.
//! - [`ollama`] -- Ollama `/api/chat`.
//! - [`lmstudio`] -- LM Studio's OpenAI-compatible server.

pub mod anthropic;
pub mod genai;
pub mod lmstudio;
pub mod ollama;
pub mod openai;

use std::sync::Arc;

use reqwest::header::HeaderValue;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::llm::adapter::Adapter;

pub use anthropic::AnthropicAdapter;
pub use genai::GenaiAdapter;
pub use lmstudio::LmStudioAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

/// Provider keys with a built-in adapter.
pub const PROVIDERS: [&str; 5] = ["genai", "openai", "anthropic", "ollama", "lmstudio"];

/// Text sent in place of non-image attachments on backends that only accept
/// images.
pub const UNSUPPORTED_DOCUMENT_TEXT: &str =
    "Inline document attachments are not supported; see tool response.";

/// Construct the built-in adapter for `provider`.  Construction never
/// touches the network or validates credentials.
pub fn adapter_for(provider: &str, config: &EngineConfig) -> Option<Arc<dyn Adapter>> {
    let adapter: Arc<dyn Adapter> = match provider {
        "genai" => Arc::new(GenaiAdapter::new(
            config.genai.clone(),
            config.defaults.clone(),
            config.http_timeout,
        )),
        "openai" => Arc::new(OpenAiAdapter::new(
            config.openai.clone(),
            config.defaults.clone(),
            config.http_timeout,
        )),
        "anthropic" => Arc::new(AnthropicAdapter::new(
            config.anthropic.clone(),
            config.defaults.clone(),
            config.http_timeout,
        )),
        "ollama" => Arc::new(OllamaAdapter::new(
            config.ollama.clone(),
            config.defaults.clone(),
            config.http_timeout,
        )),
        "lmstudio" => Arc::new(LmStudioAdapter::new(
            config.lmstudio.clone(),
            config.defaults.clone(),
            config.http_timeout,
        )),
        _ => return None,
    };
    Some(adapter)
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn header_value(provider: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| EngineError::config(provider, format!("invalid header value: {e}")))
}

/// Sampling values as JSON numbers without `f32` widening noise.
pub(crate) fn sampling(value: f32) -> f64 {
    (f64::from(value) * 1000.0).round() / 1000.0
}

/// The request model, or a configuration error for backends without a
/// built-in default.
pub(crate) fn require_model<'a>(provider: &str, model: &'a str, example: &str) -> Result<&'a str> {
    let model = model.trim();
    if model.is_empty() {
        return Err(EngineError::config(
            provider,
            format!(
                "no model configured. Set one with: export LLMUX_MODEL_NAME={example} \
                 (or name a model in the prompt)"
            ),
        ));
    }
    Ok(model)
}

/// Validate a base URL and return it without a trailing slash.
pub(crate) fn parse_base_url(provider: &str, raw: &str) -> Result<String> {
    let url = url::Url::parse(raw)
        .map_err(|e| EngineError::config(provider, format!("invalid base URL {raw:?}: {e}")))?;
    Ok(url.as_str().trim_end_matches('/').to_owned())
}

pub(crate) fn non_empty(s: &&str) -> bool {
    !s.is_empty()
}
