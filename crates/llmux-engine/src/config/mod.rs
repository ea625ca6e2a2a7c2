//! Engine configuration.
//!
//! Everything the engine reads from the environment is resolved once into an
//! [`EngineConfig`]: model defaults, the default provider, per-backend
//! credentials and endpoints, debug toggles, and retry settings.  Adapters
//! receive their own section at construction time and never read the
//! environment themselves.
//!
//! [`EngineConfig::from_env`] reads the process environment;
//! [`EngineConfig::from_lookup`] takes any key lookup, which keeps tests
//! independent of process state.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Provider used when neither the prompt nor the environment names one.
pub const DEFAULT_PROVIDER: &str = "genai";

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_VERTEX_LOCATION: &str = "us-central1";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_LMSTUDIO_BASE_URL: &str = "http://127.0.0.1:1234";

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// A credential that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Model-name and sampling defaults applied when a prompt leaves them unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefaults {
    /// Overrides every adapter's built-in default model when set.
    pub model_name: Option<String>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self {
            model_name: None,
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 8192,
        }
    }
}

impl ModelDefaults {
    /// The configured model, or `fallback`.
    pub fn model_or(&self, fallback: &str) -> String {
        self.model_name
            .clone()
            .unwrap_or_else(|| fallback.to_owned())
    }

    /// Status line describing `model` with the sampling defaults.
    pub fn describe(&self, model: &str) -> String {
        format!(
            "{model}, Temperature: {:.2}, Max Tokens: {}",
            self.temperature, self.max_tokens
        )
    }
}

/// Which genai endpoint family to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenaiBackend {
    #[default]
    Gemini,
    Vertex,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenaiSettings {
    pub backend: GenaiBackend,
    pub api_key: Option<Secret>,
    pub project: Option<String>,
    pub location: String,
    /// OAuth bearer token for Vertex AI.
    pub access_token: Option<Secret>,
    /// Overrides the Gemini API endpoint (proxies, tests).
    pub base_url: Option<String>,
    pub thinking_budget: Option<i32>,
    pub thinking_level: Option<String>,
    pub include_thoughts: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenAiSettings {
    pub api_key: Option<Secret>,
    pub base_url: String,
    pub organization: Option<String>,
    pub project: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnthropicSettings {
    pub api_key: Option<Secret>,
    pub base_url: String,
    pub show_thinking: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OllamaSettings {
    pub base_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LmStudioSettings {
    /// Always ends in `/v1`.
    pub base_url: String,
    pub api_key: Option<Secret>,
}

/// Debug and trace toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugToggles {
    pub debug: bool,
    /// Log token usage for every request.
    pub token_debug: bool,
    /// Publish model reasoning as notifications.
    pub show_thoughts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub defaults: ModelDefaults,
    pub default_provider: String,
    pub genai: GenaiSettings,
    pub openai: OpenAiSettings,
    pub anthropic: AnthropicSettings,
    pub ollama: OllamaSettings,
    pub lmstudio: LmStudioSettings,
    pub debug: DebugToggles,
    pub retry: RetrySettings,
    pub http_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl EngineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`.  Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let defaults = ModelDefaults {
            model_name: env.string("LLMUX_MODEL_NAME"),
            temperature: env.parsed("LLMUX_MODEL_TEMPERATURE").unwrap_or(0.7),
            top_p: env.parsed("LLMUX_TOP_P").unwrap_or(0.9),
            max_tokens: env.parsed("LLMUX_MAX_TOKENS").unwrap_or(8192),
        };

        let backend = match env.string("GENAI_BACKEND").as_deref().map(str::to_lowercase) {
            Some(b) if b == "vertex" || b == "vertexai" => GenaiBackend::Vertex,
            _ => GenaiBackend::Gemini,
        };
        let genai = GenaiSettings {
            backend,
            api_key: env.secret("GEMINI_API_KEY"),
            project: env.string("GOOGLE_CLOUD_PROJECT"),
            location: env
                .string("GOOGLE_CLOUD_LOCATION")
                .unwrap_or_else(|| DEFAULT_VERTEX_LOCATION.to_owned()),
            access_token: env.secret("GOOGLE_CLOUD_ACCESS_TOKEN"),
            base_url: env.string("GEMINI_BASE_URL"),
            thinking_budget: env.parsed("GEMINI_THINKING_BUDGET"),
            thinking_level: env.string("GEMINI_THINKING_LEVEL"),
            include_thoughts: env.flag("GEMINI_INCLUDE_THOUGHTS"),
        };

        let openai = OpenAiSettings {
            api_key: env.secret("OPENAI_API_KEY"),
            base_url: env
                .string("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_owned()),
            organization: env.string("OPENAI_ORG_ID"),
            project: env.string("OPENAI_PROJECT_ID"),
        };

        let anthropic = AnthropicSettings {
            api_key: env.secret("ANTHROPIC_API_KEY"),
            base_url: env
                .string("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_owned()),
            show_thinking: env.flag("ANTHROPIC_SHOW_THINKING"),
        };

        let ollama = OllamaSettings {
            base_url: env
                .first(&["LLMUX_OLLAMA_BASE_URL", "OLLAMA_HOST"])
                .map(|u| with_scheme(&u))
                .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_owned()),
        };

        let lmstudio = LmStudioSettings {
            base_url: ensure_v1_suffix(
                &env.first(&[
                    "LLMUX_LMSTUDIO_BASE_URL",
                    "LMSTUDIO_BASE_URL",
                    "LM_STUDIO_BASE_URL",
                ])
                .unwrap_or_else(|| DEFAULT_LMSTUDIO_BASE_URL.to_owned()),
            ),
            api_key: env.secret("LMSTUDIO_API_KEY"),
        };

        let debug = DebugToggles {
            debug: env.flag("LLMUX_DEBUG"),
            token_debug: env.flag("LLMUX_TOKEN_DEBUG"),
            show_thoughts: env.flag("GEMINI_SHOW_THOUGHTS"),
        };

        let retry = RetrySettings {
            max_retries: env.parsed("LLMUX_RETRY_MAX_RETRIES").unwrap_or(3),
            initial_backoff: Duration::from_millis(
                env.parsed("LLMUX_RETRY_INITIAL_BACKOFF_MS").unwrap_or(1000),
            ),
        };

        Self {
            defaults,
            default_provider: env
                .string("LLMUX_LLM_PROVIDER")
                .map(|p| p.to_lowercase())
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_owned()),
            genai,
            openai,
            anthropic,
            ollama,
            lmstudio,
            debug,
            retry,
            http_timeout: Duration::from_secs(env.parsed("LLMUX_HTTP_TIMEOUT_SECS").unwrap_or(120)),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    fn secret(&self, key: &str) -> Option<Secret> {
        self.string(key).map(Secret)
    }

    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.string(k))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.string(key)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable configuration value");
                None
            }
        }
    }

    fn flag(&self, key: &str) -> bool {
        matches!(
            self.string(key).map(|v| v.to_lowercase()).as_deref(),
            Some("1" | "true" | "yes" | "on")
        )
    }
}

/// `OLLAMA_HOST` is often given as `host:port`.
fn with_scheme(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.trim_end_matches('/').to_owned()
    } else {
        format!("http://{}", url.trim_end_matches('/'))
    }
}

/// Append `/v1` unless the URL already ends with it.
pub fn ensure_v1_suffix(url: &str) -> String {
    let trimmed = with_scheme(url);
    if trimmed.ends_with("/v1") {
        trimmed
    } else {
        format!("{trimmed}/v1")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> EngineConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        EngineConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]);
        assert_eq!(cfg.default_provider, "genai");
        assert_eq!(cfg.defaults.max_tokens, 8192);
        assert!((cfg.defaults.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(cfg.genai.backend, GenaiBackend::Gemini);
        assert_eq!(cfg.genai.location, "us-central1");
        assert_eq!(cfg.ollama.base_url, "http://127.0.0.1:11434");
        assert_eq!(cfg.lmstudio.base_url, "http://127.0.0.1:1234/v1");
        assert_eq!(cfg.openai.base_url, "https://api.openai.com/v1");
        assert_eq!(cfg.retry, RetrySettings::default());
        assert_eq!(cfg.http_timeout, Duration::from_secs(120));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = config(&[("OPENAI_API_KEY", "   "), ("LLMUX_MODEL_NAME", "")]);
        assert!(cfg.openai.api_key.is_none());
        assert!(cfg.defaults.model_name.is_none());
    }

    #[test]
    fn ollama_host_gets_a_scheme() {
        let cfg = config(&[("OLLAMA_HOST", "10.0.0.5:11434")]);
        assert_eq!(cfg.ollama.base_url, "http://10.0.0.5:11434");
        let cfg = config(&[
            ("LLMUX_OLLAMA_BASE_URL", "http://gpu-box:11434/"),
            ("OLLAMA_HOST", "ignored:1"),
        ]);
        assert_eq!(cfg.ollama.base_url, "http://gpu-box:11434");
    }

    #[test]
    fn lmstudio_aliases_and_suffix() {
        let cfg = config(&[("LM_STUDIO_BASE_URL", "http://studio:1234/v1/")]);
        assert_eq!(cfg.lmstudio.base_url, "http://studio:1234/v1");
        let cfg = config(&[("LMSTUDIO_BASE_URL", "http://studio:1234")]);
        assert_eq!(cfg.lmstudio.base_url, "http://studio:1234/v1");
    }

    #[test]
    fn toggles_and_numbers() {
        let cfg = config(&[
            ("GEMINI_SHOW_THOUGHTS", "true"),
            ("LLMUX_TOKEN_DEBUG", "1"),
            ("GENAI_BACKEND", "Vertex"),
            ("GEMINI_THINKING_BUDGET", "1024"),
            ("LLMUX_MAX_TOKENS", "not-a-number"),
            ("LLMUX_LLM_PROVIDER", "Ollama"),
        ]);
        assert!(cfg.debug.show_thoughts);
        assert!(cfg.debug.token_debug);
        assert!(!cfg.debug.debug);
        assert_eq!(cfg.genai.backend, GenaiBackend::Vertex);
        assert_eq!(cfg.genai.thinking_budget, Some(1024));
        assert_eq!(cfg.defaults.max_tokens, 8192);
        assert_eq!(cfg.default_provider, "ollama");
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let cfg = config(&[("ANTHROPIC_API_KEY", "sk-ant-123")]);
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("sk-ant-123"));
        assert_eq!(cfg.anthropic.api_key.unwrap().expose(), "sk-ant-123");
    }

    #[test]
    fn model_description() {
        let defaults = ModelDefaults::default();
        assert_eq!(
            defaults.describe("llama3.2"),
            "llama3.2, Temperature: 0.70, Max Tokens: 8192"
        );
    }
}
