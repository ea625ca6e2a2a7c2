//! OpenAI Chat Completions adapter.
//!
//! The request/response codec in this module is shared with
//! [`super::lmstudio`], which speaks the same wire format with a few
//! differences captured by [`Dialect`]:
//!
//! | | OpenAI | LM Studio |
//! |---|---|---|
//! | auth | `Authorization: Bearer` | none |
//! | output cap | `max_completion_tokens` | `max_tokens` |
//! | sampling | model dependent | always sent |
//! | stream fragment key | `index` | call `id` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{UNSUPPORTED_DOCUMENT_TEXT, header_value, non_empty, parse_base_url, sampling};
use crate::config::{ModelDefaults, OpenAiSettings};
use crate::error::{EngineError, Result};
use crate::init::LazyInit;
use crate::llm::adapter::{Adapter, DeltaStream};
use crate::llm::http::{self, LineDecoder};
use crate::llm::sse::SseParser;
use crate::llm::types::{
    ArgumentsFragment, FinishReason, FragmentKey, Message, ModelTurn, Part, Role, Status,
    StreamDelta, TokenUsage, ToolArguments, ToolCall, ToolCallFragment, TurnRequest,
};

const PROVIDER: &str = "openai";

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

const MISSING_KEY: &str = "OPENAI_API_KEY is not set. Create a key at \
    https://platform.openai.com/api-keys and run: export OPENAI_API_KEY=sk-your-key \
    (optionally OPENAI_BASE_URL=https://api.openai.com/v1 and OPENAI_ORG_ID=org-...)";

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

/// Differences between backends that share the Chat Completions format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    OpenAi,
    LmStudio,
}

impl Dialect {
    fn fragment_key(self, index: u32, id: Option<&str>) -> FragmentKey {
        match self {
            Self::OpenAi => FragmentKey::Index(index),
            Self::LmStudio => FragmentKey::Id(id.unwrap_or_default().to_owned()),
        }
    }
}

/// Reasoning models reject temperature and top-p.
fn allows_sampling(model: &str) -> bool {
    let model = model.to_lowercase();
    !["o1", "o3", "o4"].iter().any(|p| model.starts_with(p))
}

fn supports_top_p(model: &str) -> bool {
    let model = model.to_lowercase();
    ["gpt-4o", "gpt-4-", "gpt-3.5"]
        .iter()
        .any(|p| model.starts_with(p))
}

// ---------------------------------------------------------------------------
// Request encoding
// ---------------------------------------------------------------------------

pub(crate) fn encode_messages(messages: &[Message], system: Option<&str>) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
        out.push(json!({"role": "system", "content": system}));
    }

    for message in messages {
        match message.role {
            Role::User => out.push(encode_user(message)),
            Role::Model => out.push(encode_assistant(message)),
            Role::Tool => out.extend(message.tool_results_iter().map(|result| {
                json!({
                    "role": "tool",
                    "tool_call_id": result.id,
                    "content": result.response_json(),
                })
            })),
        }
    }
    out
}

fn encode_user(message: &Message) -> Value {
    let has_media = message.parts.iter().any(|p| matches!(p, Part::Media(_)));
    if !has_media {
        return json!({"role": "user", "content": message.text()});
    }

    let content: Vec<Value> = message
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text(text) => Some(json!({"type": "text", "text": text})),
            Part::Media(media) if media.is_image() => Some(json!({
                "type": "image_url",
                "image_url": {"url": media.to_data_url()},
            })),
            Part::Media(_) => Some(json!({"type": "text", "text": UNSUPPORTED_DOCUMENT_TEXT})),
            _ => None,
        })
        .collect();
    json!({"role": "user", "content": content})
}

fn encode_assistant(message: &Message) -> Value {
    let text = message.text();
    let content = if text.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    let mut out = json!({"role": "assistant", "content": content});

    let calls: Vec<Value> = message
        .tool_calls()
        .into_iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments.to_json_string(),
                },
            })
        })
        .collect();
    if !calls.is_empty() {
        out["tool_calls"] = Value::Array(calls);
    }
    out
}

pub(crate) fn encode_request(dialect: Dialect, request: TurnRequest<'_>, stream: bool) -> Value {
    let config = request.config;
    let mut body = json!({
        "model": request.model,
        "messages": encode_messages(request.messages, config.system_instruction.as_deref()),
    });

    match dialect {
        Dialect::OpenAi => {
            if allows_sampling(request.model) {
                if let Some(t) = config.temperature {
                    body["temperature"] = json!(sampling(t));
                }
                if let Some(p) = config.top_p.filter(|_| supports_top_p(request.model)) {
                    body["top_p"] = json!(sampling(p));
                }
            }
            if let Some(max) = config.max_output_tokens {
                body["max_completion_tokens"] = json!(max);
            }
        }
        Dialect::LmStudio => {
            if let Some(t) = config.temperature {
                body["temperature"] = json!(sampling(t));
            }
            if let Some(p) = config.top_p {
                body["top_p"] = json!(sampling(p));
            }
            if let Some(max) = config.max_output_tokens {
                body["max_tokens"] = json!(max);
            }
        }
    }

    if !config.functions.is_empty() {
        let tools: Vec<Value> = config
            .functions
            .iter()
            .map(|f| {
                json!({
                    "type": "function",
                    "function": {
                        "name": f.name,
                        "description": f.description,
                        "parameters": f.parameters_json_schema(),
                    },
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }

    if let Some(schema) = &config.response_schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {"name": "response", "schema": schema.to_json_schema()},
        });
    }

    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({"include_usage": true});
    }
    body
}

// ---------------------------------------------------------------------------
// Response decoding
// ---------------------------------------------------------------------------

pub(crate) fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::MaxTokens,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::Safety,
        "" => FinishReason::Unspecified,
        other => FinishReason::Other(other.to_owned()),
    }
}

pub(crate) fn decode_usage(v: &Value) -> Option<TokenUsage> {
    if !v.is_object() {
        return None;
    }
    let mut usage = TokenUsage::new(
        v["prompt_tokens"].as_u64().unwrap_or(0),
        v["completion_tokens"].as_u64().unwrap_or(0),
    );
    if let Some(total) = v["total_tokens"].as_u64() {
        usage.total = total;
    }
    usage.cached = v["prompt_tokens_details"]["cached_tokens"]
        .as_u64()
        .unwrap_or(0);
    Some(usage)
}

fn arguments_of(v: &Value) -> ToolArguments {
    match v {
        Value::String(text) => ToolArguments::Json(text.clone()),
        Value::Null => ToolArguments::default(),
        other => ToolArguments::Value(other.clone()),
    }
}

pub(crate) fn decode_response(v: &Value) -> Result<ModelTurn> {
    let choice = v["choices"].get(0).ok_or(EngineError::NoCandidates)?;
    let message = &choice["message"];

    let mut parts = Vec::new();
    if let Some(reasoning) = message["reasoning_content"].as_str().filter(non_empty) {
        parts.push(Part::Thinking(reasoning.to_owned()));
    }
    if let Some(text) = message["content"].as_str().filter(non_empty) {
        parts.push(Part::Text(text.to_owned()));
    }
    for call in message["tool_calls"].as_array().into_iter().flatten() {
        parts.push(Part::ToolCall(ToolCall::new(
            call["id"].as_str().unwrap_or_default(),
            call["function"]["name"].as_str().unwrap_or_default(),
            arguments_of(&call["function"]["arguments"]),
        )));
    }

    let (finish_reason, finish_message) = match message["refusal"].as_str().filter(non_empty) {
        Some(refusal) => (FinishReason::Safety, refusal.to_owned()),
        None => (
            finish_reason(choice["finish_reason"].as_str().unwrap_or_default()),
            String::new(),
        ),
    };

    Ok(ModelTurn {
        message: Message::new(Role::Model, parts),
        finish_reason,
        finish_message,
        usage: decode_usage(&v["usage"]),
    })
}

/// Decodes `data:` lines of a Chat Completions stream.
pub(crate) struct ChatStreamDecoder {
    dialect: Dialect,
    parser: SseParser,
    done: bool,
}

impl ChatStreamDecoder {
    pub(crate) fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            parser: SseParser::new(),
            done: false,
        }
    }

    fn decode_chunk(&self, v: &Value) -> Vec<StreamDelta> {
        let mut out = Vec::new();

        if let Some(choice) = v["choices"].get(0) {
            let delta = &choice["delta"];
            if let Some(reasoning) = delta["reasoning_content"].as_str().filter(non_empty) {
                out.push(StreamDelta::Thinking(reasoning.to_owned()));
            }
            if let Some(text) = delta["content"].as_str().filter(non_empty) {
                out.push(StreamDelta::Text(text.to_owned()));
            }
            for call in delta["tool_calls"].as_array().into_iter().flatten() {
                let index = call["index"].as_u64().unwrap_or(0) as u32;
                let id = call["id"].as_str().filter(non_empty).map(str::to_owned);
                out.push(StreamDelta::ToolCall(ToolCallFragment {
                    key: self.dialect.fragment_key(index, id.as_deref()),
                    id,
                    name: call["function"]["name"]
                        .as_str()
                        .filter(non_empty)
                        .map(str::to_owned),
                    arguments: call["function"]["arguments"]
                        .as_str()
                        .map(|s| ArgumentsFragment::Partial(s.to_owned())),
                }));
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                out.push(StreamDelta::Finish {
                    reason: finish_reason(reason),
                    message: String::new(),
                });
            }
        }

        if let Some(usage) = decode_usage(&v["usage"]) {
            out.push(StreamDelta::Usage(usage));
        }
        out
    }
}

impl LineDecoder for ChatStreamDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamDelta>> {
        let Some(event) = self.parser.parse_line(line) else {
            return Ok(Vec::new());
        };
        if event.is_done() {
            self.done = true;
            return Ok(Vec::new());
        }

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
        Ok(self.decode_chunk(&v))
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// Rough prompt-size estimate: about four characters per token, three
/// tokens of framing per message, three more to prime the reply.
pub(crate) fn estimate_tokens(request: TurnRequest<'_>) -> TokenUsage {
    let mut chars = 0usize;
    let mut messages = 0usize;

    if let Some(system) = &request.config.system_instruction {
        chars += system.chars().count();
        messages += 1;
    }
    for message in request.messages {
        messages += match message.role {
            Role::Tool => message.parts.len().max(1),
            _ => 1,
        };
        for part in &message.parts {
            chars += match part {
                Part::Text(t) | Part::Thinking(t) => t.chars().count(),
                Part::ToolCall(c) => c.name.len() + c.arguments.to_json_string().len(),
                Part::ToolResult(r) => r.response_json().len(),
                Part::Media(_) => 0,
            };
        }
    }

    let tokens = chars.div_ceil(4) + 3 * messages + 3;
    TokenUsage::new(tokens as u64, 0)
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A validated Chat Completions endpoint.
pub(crate) struct ChatCompletions {
    provider: &'static str,
    dialect: Dialect,
    http: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
}

impl ChatCompletions {
    pub(crate) fn new(
        provider: &'static str,
        dialect: Dialect,
        base_url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<Self> {
        let base = parse_base_url(provider, base_url)?;
        Ok(Self {
            provider,
            dialect,
            http: http::build_client(timeout)?,
            endpoint: format!("{base}/chat/completions"),
            headers,
        })
    }

    fn post(&self, body: &Value) -> reqwest::RequestBuilder {
        tracing::debug!(url = %self.endpoint, model = %body["model"], provider = self.provider, "sending LLM request");
        self.http
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .json(body)
    }

    pub(crate) async fn invoke(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn> {
        let body = encode_request(self.dialect, request, false);
        let v = http::send_for_json(self.post(&body), cancel).await?;
        decode_response(&v)
    }

    pub(crate) async fn stream(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        let body = encode_request(self.dialect, request, true);
        let resp = http::send(self.post(&body), cancel).await?;
        Ok(http::delta_stream(
            resp,
            ChatStreamDecoder::new(self.dialect),
            cancel.clone(),
        ))
    }

    /// Ask the server to evaluate the prompt without generating.
    pub(crate) async fn evaluate_prompt(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        let mut body = encode_request(self.dialect, request, false);
        body["max_tokens"] = json!(0);
        let v = http::send_for_json(self.post(&body), cancel).await?;
        let prompt = v["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
        Ok(TokenUsage::new(prompt, 0))
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct OpenAiAdapter {
    settings: OpenAiSettings,
    defaults: ModelDefaults,
    timeout: Duration,
    connection: LazyInit<ChatCompletions>,
}

impl OpenAiAdapter {
    pub fn new(settings: OpenAiSettings, defaults: ModelDefaults, timeout: Duration) -> Self {
        Self {
            settings,
            defaults,
            timeout,
            connection: LazyInit::new(),
        }
    }

    fn connection(&self) -> Result<Arc<ChatCompletions>> {
        self.connection.get_or_init(PROVIDER, || {
            let key = self
                .settings
                .api_key
                .as_ref()
                .ok_or_else(|| EngineError::config(PROVIDER, MISSING_KEY))?;

            let mut headers = HeaderMap::new();
            headers.insert(
                AUTHORIZATION,
                header_value(PROVIDER, &format!("Bearer {}", key.expose()))?,
            );
            if let Some(org) = &self.settings.organization {
                headers.insert("openai-organization", header_value(PROVIDER, org)?);
            }
            if let Some(project) = &self.settings.project {
                headers.insert("openai-project", header_value(PROVIDER, project)?);
            }

            ChatCompletions::new(
                PROVIDER,
                Dialect::OpenAi,
                &self.settings.base_url,
                headers,
                self.timeout,
            )
        })
    }
}

#[async_trait]
impl Adapter for OpenAiAdapter {
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
        self.connection()?.invoke(request, cancel).await
    }

    async fn stream(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        self.connection()?.stream(request, cancel).await
    }

    async fn count_tokens(
        &self,
        request: TurnRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        Ok(estimate_tokens(request))
    }

    fn status(&self) -> Status {
        let model = self.defaults.describe(&self.default_model());
        match &self.settings.api_key {
            Some(_) => Status {
                configured: true,
                backend: PROVIDER.into(),
                model,
                message: format!("OpenAI configured (endpoint: {})", self.settings.base_url),
            },
            None => Status {
                configured: false,
                backend: PROVIDER.into(),
                model,
                message: "OPENAI_API_KEY not configured".into(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::schema::{FunctionDeclaration, Schema};
    use crate::llm::types::{GenerationConfig, Media, ToolResult};

    fn config() -> GenerationConfig {
        GenerationConfig {
            system_instruction: Some("Be brief.".into()),
            temperature: Some(0.7),
            top_p: Some(0.9),
            max_output_tokens: Some(256),
            ..GenerationConfig::default()
        }
    }

    #[test]
    fn reasoning_models_get_no_sampling() {
        let cfg = config();
        let messages = [Message::user("hi")];
        let request = TurnRequest {
            model: "o3-mini",
            messages: &messages,
            config: &cfg,
        };
        let body = encode_request(Dialect::OpenAi, request, false);
        assert!(body.get("temperature").is_none());
        assert!(body.get("top_p").is_none());
        assert_eq!(body["max_completion_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[test]
    fn top_p_only_for_older_families() {
        let cfg = config();
        let messages = [Message::user("hi")];
        let for_model = |model| {
            encode_request(
                Dialect::OpenAi,
                TurnRequest {
                    model,
                    messages: &messages,
                    config: &cfg,
                },
                false,
            )
        };
        assert_eq!(for_model("gpt-4o-mini")["top_p"], 0.9);
        assert!(for_model("gpt-4.1")["top_p"].is_null());
        assert_eq!(for_model("gpt-4.1")["temperature"], 0.7);
    }

    #[test]
    fn lmstudio_dialect_uses_max_tokens() {
        let cfg = config();
        let messages = [Message::user("hi")];
        let body = encode_request(
            Dialect::LmStudio,
            TurnRequest {
                model: "qwen2.5-7b",
                messages: &messages,
                config: &cfg,
            },
            true,
        );
        assert_eq!(body["max_tokens"], 256);
        assert!(body.get("max_completion_tokens").is_none());
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn tools_and_schema_are_encoded() {
        let cfg = GenerationConfig {
            functions: vec![FunctionDeclaration::new("listFiles", "List files").with_parameters(
                Schema::object([("dir", Schema::string())], &["dir"]),
            )],
            response_schema: Some(Schema::object([("ok", Schema::boolean())], &[])),
            ..GenerationConfig::default()
        };
        let messages = [Message::user("hi")];
        let body = encode_request(
            Dialect::OpenAi,
            TurnRequest {
                model: "gpt-4o",
                messages: &messages,
                config: &cfg,
            },
            false,
        );
        assert_eq!(body["tools"][0]["function"]["name"], "listFiles");
        assert_eq!(
            body["tools"][0]["function"]["parameters"]["properties"]["dir"]["type"],
            "string"
        );
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(
            body["response_format"]["json_schema"]["schema"]["properties"]["ok"]["type"],
            "boolean"
        );
    }

    #[test]
    fn history_round_trips_tool_calls_and_media() {
        let call = ToolCall::new("call_1", "viewImage", ToolArguments::Json(r#"{"p":"a"}"#.into()));
        let history = vec![
            Message::user("look"),
            Message::new(Role::Model, vec![Part::ToolCall(call)]),
            Message::tool_results(vec![ToolResult {
                id: "call_1".into(),
                name: "viewImage".into(),
                response: serde_json::Map::new(),
            }]),
            Message::new(
                Role::User,
                vec![
                    Part::Text("Image retrieved from a".into()),
                    Part::Media(Media::new("image/png", vec![1])),
                    Part::Media(Media::new("application/pdf", vec![2])),
                ],
            ),
        ];
        let out = encode_messages(&history, None);
        assert_eq!(out.len(), 4);
        assert!(out[1]["content"].is_null());
        assert_eq!(out[1]["tool_calls"][0]["function"]["arguments"], r#"{"p":"a"}"#);
        assert_eq!(out[2]["role"], "tool");
        assert_eq!(out[2]["tool_call_id"], "call_1");
        assert_eq!(out[3]["content"][1]["image_url"]["url"], "data:image/png;base64,AQ==");
        assert_eq!(out[3]["content"][2]["text"], UNSUPPORTED_DOCUMENT_TEXT);
    }

    #[test]
    fn decode_tool_call_response() {
        let v = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "ls", "arguments": "{\"dir\":\".\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
        });
        let turn = decode_response(&v).unwrap();
        assert!(turn.has_tool_calls());
        assert_eq!(turn.finish_reason, FinishReason::ToolCalls);
        assert_eq!(turn.usage.unwrap().total, 17);
        let calls = turn.message.tool_calls();
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].arguments, ToolArguments::Json("{\"dir\":\".\"}".into()));
    }

    #[test]
    fn decode_refusal_and_missing_choices() {
        let v = json!({"choices": [{"message": {"content": null, "refusal": "I can't help with that."}, "finish_reason": "stop"}]});
        let turn = decode_response(&v).unwrap();
        assert_eq!(turn.finish_reason, FinishReason::Safety);
        assert_eq!(turn.finish_message, "I can't help with that.");

        assert!(matches!(
            decode_response(&json!({"choices": []})),
            Err(EngineError::NoCandidates)
        ));
    }

    #[test]
    fn stream_decoder_keys_fragments_by_index() {
        let mut decoder = ChatStreamDecoder::new(Dialect::OpenAi);
        let deltas = decoder
            .decode_line(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"ls","arguments":"{\"d"}}]}}]}"#)
            .unwrap();
        assert_eq!(
            deltas,
            vec![StreamDelta::ToolCall(ToolCallFragment {
                key: FragmentKey::Index(1),
                id: Some("call_b".into()),
                name: Some("ls".into()),
                arguments: Some(ArgumentsFragment::Partial("{\"d".into())),
            })]
        );

        let deltas = decoder
            .decode_line(r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#)
            .unwrap();
        assert_eq!(deltas.len(), 2);
        assert!(matches!(&deltas[0], StreamDelta::Finish { reason: FinishReason::ToolCalls, .. }));
        assert!(matches!(&deltas[1], StreamDelta::Usage(u) if u.total == 7));

        assert!(decoder.decode_line("data: [DONE]").unwrap().is_empty());
        assert!(decoder.is_done());
    }

    #[test]
    fn lmstudio_fragments_are_keyed_by_id() {
        let mut decoder = ChatStreamDecoder::new(Dialect::LmStudio);
        let deltas = decoder
            .decode_line(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"}"}}]}}]}"#)
            .unwrap();
        assert!(matches!(
            &deltas[0],
            StreamDelta::ToolCall(f) if f.key == FragmentKey::Id(String::new())
        ));
    }

    #[test]
    fn stream_error_payload_fails() {
        let mut decoder = ChatStreamDecoder::new(Dialect::OpenAi);
        let err = decoder
            .decode_line(r#"data: {"error":{"message":"overloaded"}}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "llm stream error: overloaded");
    }

    #[test]
    fn token_estimate() {
        let cfg = GenerationConfig::default();
        let messages = [Message::user("abcdefgh")];
        let usage = estimate_tokens(TurnRequest {
            model: "gpt-4o",
            messages: &messages,
            config: &cfg,
        });
        // 8 chars -> 2 tokens, one message -> 3, priming -> 3
        assert_eq!(usage.input, 8);
    }

    #[test]
    fn status_without_key() {
        let adapter = OpenAiAdapter::new(
            OpenAiSettings::default(),
            ModelDefaults::default(),
            Duration::from_secs(5),
        );
        let status = adapter.status();
        assert!(!status.configured);
        assert_eq!(status.message, "OPENAI_API_KEY not configured");
        assert_eq!(status.model, "gpt-4o-mini, Temperature: 0.70, Max Tokens: 8192");
    }

    #[tokio::test]
    async fn missing_key_is_a_cached_configuration_error() {
        let adapter = OpenAiAdapter::new(
            OpenAiSettings::default(),
            ModelDefaults::default(),
            Duration::from_secs(5),
        );
        let cfg = GenerationConfig::default();
        let messages = [Message::user("hi")];
        let request = TurnRequest {
            model: "gpt-4o",
            messages: &messages,
            config: &cfg,
        };
        for _ in 0..2 {
            let err = adapter
                .invoke(request, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("OPENAI_API_KEY"));
        }
    }
}
