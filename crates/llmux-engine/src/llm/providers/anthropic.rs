//! Anthropic Messages API adapter.
//!
//! The system prompt travels in the top-level `system` field.  There is no
//! native response-schema parameter, so a requested schema becomes part of
//! the system text.  Streams use `event:` + `data:` SSE pairs; tool input
//! arrives as `input_json_delta` fragments keyed by content-block index.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{UNSUPPORTED_DOCUMENT_TEXT, header_value, non_empty, parse_base_url, sampling};
use crate::config::{AnthropicSettings, ModelDefaults};
use crate::error::{EngineError, Result};
use crate::init::LazyInit;
use crate::llm::adapter::{Adapter, DeltaStream};
use crate::llm::http::{self, LineDecoder};
use crate::llm::sse::SseParser;
use crate::llm::types::{
    ArgumentsFragment, FinishReason, FragmentKey, GenerationConfig, Message, ModelTurn, Part, Role,
    Status, StreamDelta, TokenUsage, ToolArguments, ToolCall, ToolCallFragment, TurnRequest,
};

const PROVIDER: &str = "anthropic";

pub const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory on this API.
const DEFAULT_MAX_TOKENS: u32 = 4096;

const MISSING_KEY: &str = "ANTHROPIC_API_KEY is not set. Create a key at \
    https://console.anthropic.com/settings/keys and run: export ANTHROPIC_API_KEY=sk-ant-your-key \
    (optionally ANTHROPIC_BASE_URL=https://api.anthropic.com)";

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

fn content_blocks(message: &Message) -> Vec<Value> {
    message
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text(text) if !text.is_empty() => Some(json!({"type": "text", "text": text})),
            Part::Media(media) if media.is_image() => Some(json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media.mime_type, "data": media.to_base64()},
            })),
            Part::Media(media) if media.mime_type == "application/pdf" => Some(json!({
                "type": "document",
                "source": {"type": "base64", "media_type": media.mime_type, "data": media.to_base64()},
            })),
            Part::Media(_) => Some(json!({"type": "text", "text": UNSUPPORTED_DOCUMENT_TEXT})),
            Part::ToolCall(call) => Some(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": Value::Object(call.arguments.to_map_lossy()),
            })),
            Part::ToolResult(result) => Some(json!({
                "type": "tool_result",
                "tool_use_id": result.id,
                "content": result.response_json(),
            })),
            _ => None,
        })
        .collect()
}

/// Encode history.  Tool results go in a `user` turn; consecutive turns with
/// the same role are merged since the API requires alternation.
fn encode_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for message in messages {
        let role = match message.role {
            Role::Model => "assistant",
            Role::User | Role::Tool => "user",
        };
        let blocks = content_blocks(message);
        if blocks.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(prev) if prev["role"] == role => {
                if let Some(existing) = prev["content"].as_array_mut() {
                    existing.extend(blocks);
                }
            }
            _ => out.push(json!({"role": role, "content": blocks})),
        }
    }
    out
}

fn system_text(config: &GenerationConfig) -> Option<String> {
    let instruction = config
        .system_instruction
        .as_deref()
        .filter(|s| !s.trim().is_empty());
    match (instruction, &config.response_schema) {
        (Some(instruction), Some(schema)) => Some(format!(
            "{instruction}\n\nYou must respond with JSON matching this schema:\n{}",
            schema.to_json_pretty()
        )),
        _ => config.instruction_with_schema_fallback(),
    }
}

fn encode_tools(config: &GenerationConfig) -> Option<Value> {
    if config.functions.is_empty() {
        return None;
    }
    Some(Value::Array(
        config
            .functions
            .iter()
            .map(|f| {
                json!({
                    "name": f.name,
                    "description": f.description,
                    "input_schema": f.parameters_json_schema(),
                })
            })
            .collect(),
    ))
}

fn encode_request(request: TurnRequest<'_>, stream: bool) -> Value {
    let config = request.config;
    let mut body = json!({
        "model": request.model,
        "max_tokens": config.max_output_tokens.filter(|m| *m > 0).unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": encode_messages(request.messages),
    });
    if let Some(system) = system_text(config) {
        body["system"] = json!(system);
    }
    if let Some(t) = config.temperature {
        body["temperature"] = json!(sampling(t));
    }
    if let Some(p) = config.top_p {
        body["top_p"] = json!(sampling(p));
    }
    if let Some(tools) = encode_tools(config) {
        body["tools"] = tools;
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::MaxTokens,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::Safety,
        "" => FinishReason::Unspecified,
        other => FinishReason::Other(other.to_owned()),
    }
}

fn decode_usage(v: &Value) -> Option<TokenUsage> {
    if !v.is_object() {
        return None;
    }
    let mut usage = TokenUsage::new(
        v["input_tokens"].as_u64().unwrap_or(0),
        v["output_tokens"].as_u64().unwrap_or(0),
    );
    usage.cached = v["cache_read_input_tokens"].as_u64().unwrap_or(0);
    Some(usage)
}

fn decode_response(v: &Value) -> Result<ModelTurn> {
    let content = v["content"].as_array().ok_or(EngineError::NoCandidates)?;

    let mut parts = Vec::new();
    for block in content {
        match block["type"].as_str().unwrap_or_default() {
            "text" => {
                if let Some(text) = block["text"].as_str().filter(non_empty) {
                    parts.push(Part::Text(text.to_owned()));
                }
            }
            "thinking" => {
                if let Some(text) = block["thinking"].as_str().filter(|s| !s.trim().is_empty()) {
                    parts.push(Part::Thinking(text.trim().to_owned()));
                }
            }
            "tool_use" => parts.push(Part::ToolCall(ToolCall::new(
                block["id"].as_str().unwrap_or_default(),
                block["name"].as_str().unwrap_or_default(),
                ToolArguments::Value(block["input"].clone()),
            ))),
            other => tracing::trace!(block_type = other, "ignoring content block"),
        }
    }

    Ok(ModelTurn {
        message: Message::new(Role::Model, parts),
        finish_reason: finish_reason(v["stop_reason"].as_str().unwrap_or_default()),
        finish_message: String::new(),
        usage: decode_usage(&v["usage"]),
    })
}

/// Decodes Messages API stream events.
#[derive(Debug, Default)]
struct MessagesStreamDecoder {
    parser: SseParser,
    usage: TokenUsage,
    done: bool,
}

impl MessagesStreamDecoder {
    fn decode_event(&mut self, event_type: &str, v: &Value) -> Result<Vec<StreamDelta>> {
        let index = v["index"].as_u64().unwrap_or(0) as u32;
        let mut out = Vec::new();

        match event_type {
            "message_start" => {
                if let Some(usage) = decode_usage(&v["message"]["usage"]) {
                    self.usage = usage;
                }
            }
            "content_block_start" => {
                let block = &v["content_block"];
                if block["type"] == "thinking" {
                    out.push(StreamDelta::ThinkingBreak);
                } else if block["type"] == "tool_use" {
                    out.push(StreamDelta::ToolCall(ToolCallFragment {
                        key: FragmentKey::Index(index),
                        id: block["id"].as_str().map(str::to_owned),
                        name: block["name"].as_str().map(str::to_owned),
                        arguments: None,
                    }));
                }
            }
            "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str().filter(non_empty) {
                            out.push(StreamDelta::Text(text.to_owned()));
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta["thinking"].as_str().filter(non_empty) {
                            out.push(StreamDelta::Thinking(text.to_owned()));
                        }
                    }
                    "input_json_delta" => out.push(StreamDelta::ToolCall(ToolCallFragment {
                        key: FragmentKey::Index(index),
                        id: None,
                        name: None,
                        arguments: delta["partial_json"]
                            .as_str()
                            .map(|s| ArgumentsFragment::Partial(s.to_owned())),
                    })),
                    other => tracing::trace!(delta_type = other, "ignoring delta"),
                }
            }
            "message_delta" => {
                if let Some(output) = v["usage"]["output_tokens"].as_u64() {
                    self.usage.output = output;
                    self.usage.total = self.usage.input + output;
                }
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    out.push(StreamDelta::Finish {
                        reason: finish_reason(reason),
                        message: String::new(),
                    });
                }
            }
            "message_stop" => self.done = true,
            "error" => {
                return Err(EngineError::LlmStreamError {
                    reason: v["error"]["message"]
                        .as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(|| v.to_string()),
                });
            }
            _ => tracing::trace!(event_type, "ignoring SSE event"),
        }
        Ok(out)
    }
}

impl LineDecoder for MessagesStreamDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamDelta>> {
        let Some(event) = self.parser.parse_line(line) else {
            return Ok(Vec::new());
        };
        let v: Value = serde_json::from_str(&event.data).map_err(|e| EngineError::LlmParseFailed {
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;
        let event_type = event
            .event
            .or_else(|| v["type"].as_str().map(str::to_owned))
            .unwrap_or_default();
        self.decode_event(&event_type, &v)
    }

    fn finish(&mut self) -> Vec<StreamDelta> {
        if self.usage.is_empty() {
            Vec::new()
        } else {
            vec![StreamDelta::Usage(self.usage)]
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

struct Connection {
    http: reqwest::Client,
    base: String,
    headers: HeaderMap,
}

impl Connection {
    fn post(&self, path: &str, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}{path}", self.base);
        tracing::debug!(url = %url, model = %body["model"], provider = PROVIDER, "sending LLM request");
        self.http.post(url).headers(self.headers.clone()).json(body)
    }
}

pub struct AnthropicAdapter {
    settings: AnthropicSettings,
    defaults: ModelDefaults,
    timeout: Duration,
    connection: LazyInit<Connection>,
}

impl AnthropicAdapter {
    pub fn new(settings: AnthropicSettings, defaults: ModelDefaults, timeout: Duration) -> Self {
        Self {
            settings,
            defaults,
            timeout,
            connection: LazyInit::new(),
        }
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.connection.get_or_init(PROVIDER, || {
            let key = self
                .settings
                .api_key
                .as_ref()
                .ok_or_else(|| EngineError::config(PROVIDER, MISSING_KEY))?;
            let mut headers = HeaderMap::new();
            headers.insert("x-api-key", header_value(PROVIDER, key.expose())?);
            headers.insert(
                "anthropic-version",
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
            Ok(Connection {
                http: http::build_client(self.timeout)?,
                base: parse_base_url(PROVIDER, &self.settings.base_url)?,
                headers,
            })
        })
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
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
        let body = encode_request(request, false);
        let v = http::send_for_json(connection.post("/v1/messages", &body), cancel).await?;
        decode_response(&v)
    }

    async fn stream(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        let connection = self.connection()?;
        let body = encode_request(request, true);
        let resp = http::send(connection.post("/v1/messages", &body), cancel).await?;
        Ok(http::delta_stream(
            resp,
            MessagesStreamDecoder::default(),
            cancel.clone(),
        ))
    }

    async fn count_tokens(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        let connection = self.connection()?;
        let mut body = json!({
            "model": request.model,
            "messages": encode_messages(request.messages),
        });
        if let Some(system) = system_text(request.config) {
            body["system"] = json!(system);
        }
        if let Some(tools) = encode_tools(request.config) {
            body["tools"] = tools;
        }
        let v = http::send_for_json(connection.post("/v1/messages/count_tokens", &body), cancel)
            .await?;
        Ok(TokenUsage::new(v["input_tokens"].as_u64().unwrap_or(0), 0))
    }

    fn status(&self) -> Status {
        let model = self.defaults.describe(&self.default_model());
        match &self.settings.api_key {
            Some(_) => Status {
                configured: true,
                backend: PROVIDER.into(),
                model,
                message: format!("Anthropic configured (endpoint: {})", self.settings.base_url),
            },
            None => Status {
                configured: false,
                backend: PROVIDER.into(),
                model,
                message: "ANTHROPIC_API_KEY not configured".into(),
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
    use crate::llm::schema::Schema;
    use crate::llm::types::{Media, ToolResult};

    #[test]
    fn schema_goes_into_system_text() {
        let cfg = GenerationConfig {
            response_schema: Some(Schema::object([("ok", Schema::boolean())], &["ok"])),
            ..GenerationConfig::default()
        };
        let messages = [Message::user("hi")];
        let body = encode_request(
            TurnRequest {
                model: DEFAULT_MODEL,
                messages: &messages,
                config: &cfg,
            },
            false,
        );
        assert_eq!(body["max_tokens"], 4096);
        let system = body["system"].as_str().unwrap();
        assert!(system.starts_with("You must respond with JSON matching this schema:\n"));

        let cfg = GenerationConfig {
            system_instruction: Some("Be terse.".into()),
            ..cfg
        };
        assert!(system_text(&cfg).unwrap().starts_with("Be terse.\n\nYou must respond"));
    }

    #[test]
    fn tool_turns_alternate_roles() {
        let call = ToolCall::new("toolu_1", "viewDocument", ToolArguments::default());
        let messages = [
            Message::user("read it"),
            Message::new(
                Role::Model,
                vec![Part::Text("Sure.".into()), Part::ToolCall(call)],
            ),
            Message::tool_results(vec![ToolResult {
                id: "toolu_1".into(),
                name: "viewDocument".into(),
                response: Default::default(),
            }]),
            Message::new(
                Role::User,
                vec![
                    Part::Text("Document retrieved from a.pdf".into()),
                    Part::Media(Media::new("application/pdf", vec![1])),
                    Part::Media(Media::new("text/csv", vec![2])),
                ],
            ),
        ];
        let out = encode_messages(&messages);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1]["content"][1]["type"], "tool_use");
        assert_eq!(out[1]["content"][1]["input"], json!({}));
        let merged = out[2]["content"].as_array().unwrap();
        assert_eq!(merged[0]["type"], "tool_result");
        assert_eq!(merged[0]["tool_use_id"], "toolu_1");
        assert_eq!(merged[2]["type"], "document");
        assert_eq!(merged[3]["text"], UNSUPPORTED_DOCUMENT_TEXT);
    }

    #[test]
    fn decode_thinking_and_tool_use() {
        let v = json!({
            "content": [
                {"type": "thinking", "thinking": "  plan  "},
                {"type": "tool_use", "id": "toolu_2", "name": "ls", "input": {"dir": "/"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 9, "output_tokens": 3}
        });
        let turn = decode_response(&v).unwrap();
        assert_eq!(turn.message.thoughts(), vec!["plan"]);
        assert_eq!(turn.finish_reason, FinishReason::ToolCalls);
        assert_eq!(turn.usage.unwrap().total, 12);
    }

    #[test]
    fn stream_decoder_assembles_events() {
        let mut decoder = MessagesStreamDecoder::default();
        let lines = [
            "event: message_start",
            r#"data: {"type":"message_start","message":{"usage":{"input_tokens":10,"output_tokens":1}}}"#,
            "event: content_block_start",
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_3","name":"ls","input":{}}}"#,
            "event: content_block_delta",
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"dir\":"}}"#,
            "event: message_delta",
            r#"data: {"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":15}}"#,
            "event: message_stop",
            r#"data: {"type":"message_stop"}"#,
        ];
        let mut deltas = Vec::new();
        for line in lines {
            deltas.extend(decoder.decode_line(line).unwrap());
        }
        assert!(decoder.is_done());
        deltas.extend(decoder.finish());

        assert!(matches!(
            &deltas[0],
            StreamDelta::ToolCall(f) if f.key == FragmentKey::Index(1) && f.name.as_deref() == Some("ls")
        ));
        assert!(matches!(
            &deltas[1],
            StreamDelta::ToolCall(f) if f.arguments == Some(ArgumentsFragment::Partial("{\"dir\":".into()))
        ));
        assert!(matches!(&deltas[2], StreamDelta::Finish { reason: FinishReason::ToolCalls, .. }));
        assert!(matches!(&deltas[3], StreamDelta::Usage(u) if u.input == 10 && u.output == 15));
    }

    #[test]
    fn stream_thinking_blocks_are_delimited() {
        let mut decoder = MessagesStreamDecoder::default();
        let lines = [
            "event: content_block_start",
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
            "event: content_block_delta",
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"first"}}"#,
            "event: content_block_start",
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"thinking","thinking":""}}"#,
            "event: content_block_delta",
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"thinking_delta","thinking":"second"}}"#,
        ];
        let mut deltas = Vec::new();
        for line in lines {
            deltas.extend(decoder.decode_line(line).unwrap());
        }
        assert_eq!(
            deltas,
            vec![
                StreamDelta::ThinkingBreak,
                StreamDelta::Thinking("first".into()),
                StreamDelta::ThinkingBreak,
                StreamDelta::Thinking("second".into()),
            ]
        );
    }

    #[test]
    fn stream_error_event() {
        let mut decoder = MessagesStreamDecoder::default();
        decoder.decode_line("event: error").unwrap();
        let err = decoder
            .decode_line(r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap_err();
        assert!(err.is_transient());
    }
}
