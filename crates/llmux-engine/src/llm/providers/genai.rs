//! Google genai adapter: the Gemini API and Vertex AI.
//!
//! Both backends share one REST shape (`contents`, `parts`,
//! `functionCall`/`functionResponse`) and differ only in endpoint and
//! authentication.  The backend is picked once, on first use:
//!
//! ```text
//!   GENAI_BACKEND=gemini   GEMINI_API_KEY set        -> Gemini API
//!                          else GOOGLE_CLOUD_PROJECT -> Vertex AI (fallback)
//!   GENAI_BACKEND=vertex   GOOGLE_CLOUD_PROJECT set  -> Vertex AI
//!                          else GEMINI_API_KEY       -> Gemini API (fallback)
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use super::{header_value, non_empty, sampling};
use crate::config::{DEFAULT_GEMINI_BASE_URL, GenaiBackend, GenaiSettings, ModelDefaults};
use crate::error::{BlockReason, EngineError, Result};
use crate::init::LazyInit;
use crate::llm::adapter::{Adapter, DeltaStream};
use crate::llm::http::{self, LineDecoder};
use crate::llm::sse::SseParser;
use crate::llm::types::{
    ArgumentsFragment, FinishReason, FragmentKey, GenerationConfig, Message, ModelTurn, Part, Role,
    Status, StreamDelta, TokenUsage, ToolArguments, ToolCall, ToolCallFragment, TurnRequest,
};

const PROVIDER: &str = "genai";

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

const SETUP_HELP: &str = "no valid AI backend configured. Set up one of the following:\n\n\
    Option 1 - Gemini API (recommended):\n  \
    export GEMINI_API_KEY=your-api-key\n  \
    Get your API key from: https://aistudio.google.com/apikey\n\n\
    Option 2 - Vertex AI:\n  \
    export GOOGLE_CLOUD_PROJECT=your-project-id\n  \
    export GOOGLE_CLOUD_LOCATION=us-central1\n  \
    export GOOGLE_CLOUD_ACCESS_TOKEN=$(gcloud auth print-access-token)";

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// The endpoint family actually in use after fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Gemini,
    Vertex { project: String },
}

fn resolve_target(settings: &GenaiSettings) -> Option<Target> {
    let gemini = settings.api_key.as_ref().map(|_| Target::Gemini);
    let vertex = settings
        .project
        .clone()
        .map(|project| Target::Vertex { project });
    match settings.backend {
        GenaiBackend::Gemini => gemini.or(vertex),
        GenaiBackend::Vertex => vertex.or(gemini),
    }
}

struct Connection {
    http: reqwest::Client,
    /// Everything up to and including `/models`.
    models_url: String,
    headers: HeaderMap,
}

impl Connection {
    fn open(settings: &GenaiSettings, timeout: Duration) -> Result<Self> {
        let target = resolve_target(settings).ok_or_else(|| EngineError::config(PROVIDER, SETUP_HELP))?;
        let mut headers = HeaderMap::new();

        let models_url = match target {
            Target::Gemini => {
                let key = settings
                    .api_key
                    .as_ref()
                    .ok_or_else(|| EngineError::config(PROVIDER, SETUP_HELP))?;
                headers.insert("x-goog-api-key", header_value(PROVIDER, key.expose())?);
                let base = settings
                    .base_url
                    .as_deref()
                    .unwrap_or(DEFAULT_GEMINI_BASE_URL);
                format!("{}/models", super::parse_base_url(PROVIDER, base)?)
            }
            Target::Vertex { project } => {
                let token = settings.access_token.as_ref().ok_or_else(|| {
                    EngineError::config(
                        PROVIDER,
                        format!(
                            "Vertex AI selected for project {project} but GOOGLE_CLOUD_ACCESS_TOKEN \
                             is not set. Run: export GOOGLE_CLOUD_ACCESS_TOKEN=$(gcloud auth print-access-token)"
                        ),
                    )
                })?;
                headers.insert(
                    AUTHORIZATION,
                    header_value(PROVIDER, &format!("Bearer {}", token.expose()))?,
                );
                vertex_models_url(&project, &settings.location)
            }
        };

        Ok(Self {
            http: http::build_client(timeout)?,
            models_url,
            headers,
        })
    }

    fn post(&self, model: &str, method: &str, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}/{model}:{method}", self.models_url);
        tracing::debug!(url = %url, model, provider = PROVIDER, "sending LLM request");
        self.http.post(url).headers(self.headers.clone()).json(body)
    }
}

fn vertex_models_url(project: &str, location: &str) -> String {
    let host = if location == "global" {
        "aiplatform.googleapis.com".to_owned()
    } else {
        format!("{location}-aiplatform.googleapis.com")
    };
    format!("https://{host}/v1/projects/{project}/locations/{location}/publishers/google/models")
}

// ---------------------------------------------------------------------------
// Request encoding
// ---------------------------------------------------------------------------

fn encode_part(part: &Part) -> Option<Value> {
    match part {
        Part::Text(text) => Some(json!({"text": text})),
        // Reasoning is not resent.
        Part::Thinking(_) => None,
        Part::Media(media) => Some(json!({
            "inlineData": {"mimeType": media.mime_type, "data": media.to_base64()},
        })),
        Part::ToolCall(call) => {
            let mut function_call = json!({
                "name": call.name,
                "args": Value::Object(call.arguments.to_map_lossy()),
            });
            if !call.id.is_empty() {
                function_call["id"] = json!(call.id);
            }
            Some(json!({"functionCall": function_call}))
        }
        Part::ToolResult(result) => {
            let mut function_response = json!({
                "name": result.name,
                "response": Value::Object(result.response.clone()),
            });
            if !result.id.is_empty() {
                function_response["id"] = json!(result.id);
            }
            Some(json!({"functionResponse": function_response}))
        }
    }
}

fn encode_contents(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .filter_map(|message| {
            let role = match message.role {
                Role::Model => "model",
                Role::User | Role::Tool => "user",
            };
            let parts: Vec<Value> = message.parts.iter().filter_map(encode_part).collect();
            (!parts.is_empty()).then(|| json!({"role": role, "parts": parts}))
        })
        .collect()
}

fn encode_tools(config: &GenerationConfig) -> Option<Value> {
    if config.functions.is_empty() {
        return None;
    }
    let declarations: Vec<Value> = config
        .functions
        .iter()
        .map(|f| {
            let mut decl = json!({"name": f.name, "description": f.description});
            if let Some(params) = &f.parameters {
                decl["parameters"] = params.to_genai();
            }
            if let Some(response) = &f.response {
                decl["response"] = response.to_genai();
            }
            decl
        })
        .collect();
    Some(json!([{"functionDeclarations": declarations}]))
}

fn thinking_config(settings: &GenaiSettings) -> Option<Value> {
    let mut out = Map::new();
    if let Some(budget) = settings.thinking_budget {
        out.insert("thinkingBudget".into(), json!(budget));
    }
    if let Some(level) = &settings.thinking_level {
        out.insert("thinkingLevel".into(), json!(level.to_uppercase()));
    }
    if settings.include_thoughts {
        out.insert("includeThoughts".into(), json!(true));
    }
    (!out.is_empty()).then_some(Value::Object(out))
}

fn encode_request(settings: &GenaiSettings, request: TurnRequest<'_>) -> Value {
    let config = request.config;
    let mut body = json!({"contents": encode_contents(request.messages)});

    if let Some(system) = config
        .system_instruction
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    if let Some(tools) = encode_tools(config) {
        body["tools"] = tools;
    }

    let mut generation = Map::new();
    if let Some(t) = config.temperature {
        generation.insert("temperature".into(), json!(sampling(t)));
    }
    if let Some(p) = config.top_p {
        generation.insert("topP".into(), json!(sampling(p)));
    }
    if let Some(max) = config.max_output_tokens {
        generation.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(schema) = &config.response_schema {
        generation.insert("responseMimeType".into(), json!("application/json"));
        generation.insert("responseSchema".into(), schema.to_genai());
    }
    if let Some(thinking) = thinking_config(settings) {
        generation.insert("thinkingConfig".into(), thinking);
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

// ---------------------------------------------------------------------------
// Response decoding
// ---------------------------------------------------------------------------

fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::MaxTokens,
        "SAFETY" | "IMAGE_SAFETY" => FinishReason::Safety,
        "RECITATION" => FinishReason::Recitation,
        "BLOCKLIST" => FinishReason::Blocklist,
        "PROHIBITED_CONTENT" => FinishReason::ProhibitedContent,
        "SPII" => FinishReason::Spii,
        "MALFORMED_FUNCTION_CALL" => FinishReason::MalformedFunctionCall,
        "" | "FINISH_REASON_UNSPECIFIED" => FinishReason::Unspecified,
        other => FinishReason::Other(other.to_owned()),
    }
}

fn decode_usage(v: &Value) -> Option<TokenUsage> {
    if !v.is_object() {
        return None;
    }
    let count = |key: &str| v[key].as_u64().unwrap_or(0);
    let mut usage = TokenUsage::new(count("promptTokenCount"), count("candidatesTokenCount"));
    if let Some(total) = v["totalTokenCount"].as_u64() {
        usage.total = total;
    }
    usage.cached = count("cachedContentTokenCount");
    usage.tool_use = count("toolUsePromptTokenCount");
    Some(usage)
}

/// A response with no candidates: a prompt-level block or nothing at all.
fn no_candidates(v: &Value) -> EngineError {
    let feedback = &v["promptFeedback"];
    let Some(reason) = feedback["blockReason"].as_str().filter(non_empty) else {
        return EngineError::NoCandidates;
    };
    let block = match reason {
        "SAFETY" => BlockReason::Safety,
        "BLOCKLIST" => BlockReason::Blocklist,
        "PROHIBITED_CONTENT" => BlockReason::ProhibitedContent,
        _ => BlockReason::Other,
    };
    EngineError::ContentBlocked {
        reason: block,
        message: feedback["blockReasonMessage"]
            .as_str()
            .filter(non_empty)
            .unwrap_or(reason)
            .to_owned(),
    }
}

fn decode_parts(content: &Value) -> Vec<Part> {
    content["parts"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|part| {
            if let Some(call) = part.get("functionCall") {
                return Some(Part::ToolCall(ToolCall::new(
                    call["id"].as_str().unwrap_or_default(),
                    call["name"].as_str().unwrap_or_default(),
                    ToolArguments::Value(call["args"].clone()),
                )));
            }
            let text = part["text"].as_str()?;
            if part["thought"].as_bool() == Some(true) {
                Some(Part::Thinking(text.to_owned()))
            } else if text.is_empty() {
                None
            } else {
                Some(Part::Text(text.to_owned()))
            }
        })
        .collect()
}

fn decode_response(v: &Value) -> Result<ModelTurn> {
    let candidate = v["candidates"].get(0).ok_or_else(|| no_candidates(v))?;
    Ok(ModelTurn {
        message: Message::new(Role::Model, decode_parts(&candidate["content"])),
        finish_reason: finish_reason(candidate["finishReason"].as_str().unwrap_or_default()),
        finish_message: candidate["finishMessage"]
            .as_str()
            .unwrap_or_default()
            .to_owned(),
        usage: decode_usage(&v["usageMetadata"]),
    })
}

/// Decodes `streamGenerateContent?alt=sse`.  Each event is a full response
/// object carrying the newest parts; tool calls arrive complete.
#[derive(Debug, Default)]
struct GenaiStreamDecoder {
    parser: SseParser,
    next_call: u32,
    usage: Option<TokenUsage>,
    saw_candidate: bool,
}

impl LineDecoder for GenaiStreamDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamDelta>> {
        let Some(event) = self.parser.parse_line(line) else {
            return Ok(Vec::new());
        };
        let v: Value = serde_json::from_str(&event.data).map_err(|e| EngineError::LlmParseFailed {
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;
        if let Some(error) = v.get("error") {
            return Err(EngineError::LlmStreamError {
                reason: error["message"]
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| error.to_string()),
            });
        }

        if let Some(usage) = decode_usage(&v["usageMetadata"]) {
            self.usage = Some(usage);
        }

        let Some(candidate) = v["candidates"].get(0) else {
            return match no_candidates(&v) {
                err @ EngineError::ContentBlocked { .. } => Err(err),
                _ => Ok(Vec::new()),
            };
        };
        self.saw_candidate = true;

        let mut out = Vec::new();
        for part in decode_parts(&candidate["content"]) {
            match part {
                Part::Text(text) => out.push(StreamDelta::Text(text)),
                Part::Thinking(text) => out.push(StreamDelta::Thinking(text)),
                Part::ToolCall(call) => {
                    let arguments = match call.arguments {
                        ToolArguments::Value(value) => ArgumentsFragment::Complete(value),
                        ToolArguments::Json(text) => ArgumentsFragment::Partial(text),
                    };
                    out.push(StreamDelta::ToolCall(ToolCallFragment {
                        key: FragmentKey::Index(self.next_call),
                        id: Some(call.id).filter(|id| !id.is_empty()),
                        name: Some(call.name),
                        arguments: Some(arguments),
                    }));
                    self.next_call += 1;
                }
                _ => {}
            }
        }

        if let Some(reason) = candidate["finishReason"].as_str().filter(non_empty) {
            out.push(StreamDelta::Finish {
                reason: finish_reason(reason),
                message: candidate["finishMessage"]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned(),
            });
        }
        Ok(out)
    }

    fn finish(&mut self) -> Vec<StreamDelta> {
        self.usage.take().map(StreamDelta::Usage).into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct GenaiAdapter {
    settings: GenaiSettings,
    defaults: ModelDefaults,
    timeout: Duration,
    connection: LazyInit<Connection>,
}

impl GenaiAdapter {
    pub fn new(settings: GenaiSettings, defaults: ModelDefaults, timeout: Duration) -> Self {
        Self {
            settings,
            defaults,
            timeout,
            connection: LazyInit::new(),
        }
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.connection
            .get_or_init(PROVIDER, || Connection::open(&self.settings, self.timeout))
    }
}

#[async_trait]
impl Adapter for GenaiAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> String {
        self.defaults.model_or(DEFAULT_MODEL)
    }

    async fn invoke(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn> {
        let connection = self.connection()?;
        let body = encode_request(&self.settings, request);
        let v = http::send_for_json(connection.post(request.model, "generateContent", &body), cancel)
            .await?;
        decode_response(&v)
    }

    async fn stream(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        let connection = self.connection()?;
        let body = encode_request(&self.settings, request);
        let resp = http::send(
            connection.post(request.model, "streamGenerateContent?alt=sse", &body),
            cancel,
        )
        .await?;
        Ok(http::delta_stream(
            resp,
            GenaiStreamDecoder::default(),
            cancel.clone(),
        ))
    }

    async fn count_tokens(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        let connection = self.connection()?;
        let mut contents = Vec::new();
        if let Some(system) = request
            .config
            .system_instruction
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            contents.push(json!({"role": "user", "parts": [{"text": system}]}));
        }
        contents.extend(encode_contents(request.messages));

        let v = http::send_for_json(
            connection.post(request.model, "countTokens", &json!({"contents": contents})),
            cancel,
        )
        .await?;
        let total = v["totalTokens"].as_u64().unwrap_or(0);
        Ok(TokenUsage {
            input: total,
            total,
            cached: v["cachedContentTokenCount"].as_u64().unwrap_or(0),
            ..TokenUsage::default()
        })
    }

    fn status(&self) -> Status {
        let model = self.defaults.describe(&self.default_model());
        let (configured, backend, message) = match resolve_target(&self.settings) {
            Some(Target::Gemini) => (true, "gemini", "Gemini API configured".to_owned()),
            Some(Target::Vertex { project }) => (
                true,
                "vertex",
                format!(
                    "Vertex AI configured (project: {project}, location: {})",
                    self.settings.location
                ),
            ),
            None => match self.settings.backend {
                GenaiBackend::Gemini => (false, "gemini", "GEMINI_API_KEY not configured".to_owned()),
                GenaiBackend::Vertex => (
                    false,
                    "vertex",
                    "GOOGLE_CLOUD_PROJECT not configured".to_owned(),
                ),
            },
        };
        Status {
            configured,
            backend: backend.into(),
            model,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
