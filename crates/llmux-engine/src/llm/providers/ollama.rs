//! Ollama adapter (`/api/chat`).
//!
//! Ollama streams newline-delimited JSON.  Tool calls always arrive whole,
//! with arguments as native maps, so the stream decoder emits complete
//! fragments keyed by arrival position.  Small local models often echo tool
//! names with different casing or stray punctuation; [`normalize_tool_name`]
//! lets the executor still find the handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{UNSUPPORTED_DOCUMENT_TEXT, non_empty, parse_base_url, require_model, sampling};
use crate::config::{ModelDefaults, OllamaSettings};
use crate::error::{EngineError, Result};
use crate::init::LazyInit;
use crate::llm::adapter::{Adapter, DeltaStream};
use crate::llm::http::{self, LineDecoder};
use crate::llm::types::{
    ArgumentsFragment, FinishReason, FragmentKey, Message, ModelTurn, Part, Role, Status,
    StreamDelta, TokenUsage, ToolArguments, ToolCall, ToolCallFragment, TurnRequest,
};

const PROVIDER: &str = "ollama";
const MODEL_EXAMPLE: &str = "llama3.2";

/// Lowercase and keep only letters, digits, `_`, `-` and `.`.
pub fn normalize_tool_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect()
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

fn encode_messages(messages: &[Message], system: Option<&str>) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
        out.push(json!({"role": "system", "content": system}));
    }

    for message in messages {
        match message.role {
            Role::User => {
                let mut text = message.text();
                let mut images = Vec::new();
                for part in &message.parts {
                    if let Part::Media(media) = part {
                        if media.is_image() {
                            images.push(Value::String(media.to_base64()));
                        } else {
                            if !text.is_empty() {
                                text.push('\n');
                            }
                            text.push_str(UNSUPPORTED_DOCUMENT_TEXT);
                        }
                    }
                }
                let mut msg = json!({"role": "user", "content": text});
                if !images.is_empty() {
                    msg["images"] = Value::Array(images);
                }
                out.push(msg);
            }
            Role::Model => {
                let mut msg = json!({"role": "assistant", "content": message.text()});
                let calls: Vec<Value> = message
                    .tool_calls()
                    .into_iter()
                    .map(|call| {
                        json!({"function": {
                            "name": call.name,
                            "arguments": Value::Object(call.arguments.to_map_lossy()),
                        }})
                    })
                    .collect();
                if !calls.is_empty() {
                    msg["tool_calls"] = Value::Array(calls);
                }
                out.push(msg);
            }
            Role::Tool => out.extend(message.tool_results_iter().map(|result| {
                json!({
                    "role": "tool",
                    "tool_name": result.name,
                    "content": result.response_json(),
                })
            })),
        }
    }
    out
}

fn encode_request(request: TurnRequest<'_>, stream: bool) -> Value {
    let config = request.config;
    let mut body = json!({
        "model": request.model,
        "messages": encode_messages(request.messages, config.system_instruction.as_deref()),
        "stream": stream,
    });

    let mut options = serde_json::Map::new();
    if let Some(t) = config.temperature.filter(|t| *t > 0.0) {
        options.insert("temperature".into(), json!(sampling(t)));
    }
    if let Some(p) = config.top_p.filter(|p| *p > 0.0 && *p < 1.0) {
        options.insert("top_p".into(), json!(sampling(p)));
    }
    if let Some(max) = config.max_output_tokens {
        options.insert("num_predict".into(), json!(max));
    }
    if !options.is_empty() {
        body["options"] = Value::Object(options);
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
        body["format"] = schema.to_json_schema();
    }
    body
}

fn finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::MaxTokens,
        "" => FinishReason::Unspecified,
        other => FinishReason::Other(other.to_owned()),
    }
}

fn decode_usage(v: &Value) -> Option<TokenUsage> {
    let input = v["prompt_eval_count"].as_u64();
    let output = v["eval_count"].as_u64();
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(TokenUsage::new(input.unwrap_or(0), output.unwrap_or(0)))
}

fn arguments_of(v: &Value) -> ToolArguments {
    match v {
        Value::String(text) => ToolArguments::Json(text.clone()),
        other => ToolArguments::Value(other.clone()),
    }
}

fn check_error(v: &Value) -> Result<()> {
    match v["error"].as_str().filter(non_empty) {
        Some(message) => Err(EngineError::LlmRequestFailed {
            reason: format!("ollama error: {message}"),
        }),
        None => Ok(()),
    }
}

fn decode_response(v: &Value) -> Result<ModelTurn> {
    check_error(v)?;
    let message = v.get("message").ok_or(EngineError::NoCandidates)?;

    let mut parts = Vec::new();
    if let Some(thinking) = message["thinking"].as_str().filter(non_empty) {
        parts.push(Part::Thinking(thinking.to_owned()));
    }
    if let Some(text) = message["content"].as_str().filter(non_empty) {
        parts.push(Part::Text(text.to_owned()));
    }
    for call in message["tool_calls"].as_array().into_iter().flatten() {
        let function = &call["function"];
        parts.push(Part::ToolCall(ToolCall::new(
            call["id"].as_str().unwrap_or_default(),
            function["name"].as_str().unwrap_or_default(),
            arguments_of(&function["arguments"]),
        )));
    }

    Ok(ModelTurn {
        message: Message::new(Role::Model, parts),
        finish_reason: finish_reason(v["done_reason"].as_str().unwrap_or_default()),
        finish_message: String::new(),
        usage: decode_usage(v),
    })
}

/// Decodes NDJSON chat chunks.
#[derive(Debug, Default)]
struct NdjsonDecoder {
    next_call: u32,
    done: bool,
}

impl LineDecoder for NdjsonDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamDelta>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let v: Value = serde_json::from_str(line).map_err(|e| EngineError::LlmParseFailed {
            reason: format!("decoding ollama stream chunk: {e}"),
        })?;
        if let Some(message) = v["error"].as_str().filter(non_empty) {
            return Err(EngineError::LlmStreamError {
                reason: format!("ollama error: {message}"),
            });
        }

        let mut out = Vec::new();
        let message = &v["message"];
        if let Some(thinking) = message["thinking"].as_str().filter(non_empty) {
            out.push(StreamDelta::Thinking(thinking.to_owned()));
        }
        if let Some(text) = message["content"].as_str().filter(non_empty) {
            out.push(StreamDelta::Text(text.to_owned()));
        }
        for call in message["tool_calls"].as_array().into_iter().flatten() {
            let function = &call["function"];
            let arguments = match arguments_of(&function["arguments"]) {
                ToolArguments::Json(text) => ArgumentsFragment::Partial(text),
                ToolArguments::Value(value) => ArgumentsFragment::Complete(value),
            };
            out.push(StreamDelta::ToolCall(ToolCallFragment {
                key: FragmentKey::Index(self.next_call),
                id: call["id"].as_str().filter(non_empty).map(str::to_owned),
                name: function["name"].as_str().map(str::to_owned),
                arguments: Some(arguments),
            }));
            self.next_call += 1;
        }

        if v["done"].as_bool() == Some(true) {
            self.done = true;
            if let Some(usage) = decode_usage(&v) {
                out.push(StreamDelta::Usage(usage));
            }
            out.push(StreamDelta::Finish {
                reason: finish_reason(v["done_reason"].as_str().unwrap_or_default()),
                message: String::new(),
            });
        }
        Ok(out)
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
    endpoint: String,
}

pub struct OllamaAdapter {
    settings: OllamaSettings,
    defaults: ModelDefaults,
    timeout: Duration,
    connection: LazyInit<Connection>,
}

impl OllamaAdapter {
    pub fn new(settings: OllamaSettings, defaults: ModelDefaults, timeout: Duration) -> Self {
        Self {
            settings,
            defaults,
            timeout,
            connection: LazyInit::new(),
        }
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.connection.get_or_init(PROVIDER, || {
            let base = parse_base_url(PROVIDER, &self.settings.base_url)?;
            Ok(Connection {
                http: http::build_client(self.timeout)?,
                endpoint: format!("{base}/api/chat"),
            })
        })
    }

    fn post(&self, connection: &Connection, body: &Value) -> reqwest::RequestBuilder {
        tracing::debug!(url = %connection.endpoint, model = %body["model"], provider = PROVIDER, "sending LLM request");
        connection.http.post(&connection.endpoint).json(body)
    }
}

#[async_trait]
impl Adapter for OllamaAdapter {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn default_model(&self) -> String {
        self.defaults.model_name.clone().unwrap_or_default()
    }

    async fn invoke(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn> {
        require_model(PROVIDER, request.model, MODEL_EXAMPLE)?;
        let connection = self.connection()?;
        let body = encode_request(request, false);
        let v = http::send_for_json(self.post(&connection, &body), cancel).await?;
        decode_response(&v)
    }

    async fn stream(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        require_model(PROVIDER, request.model, MODEL_EXAMPLE)?;
        let connection = self.connection()?;
        let body = encode_request(request, true);
        let resp = http::send(self.post(&connection, &body), cancel).await?;
        Ok(http::delta_stream(
            resp,
            NdjsonDecoder::default(),
            cancel.clone(),
        ))
    }

    async fn count_tokens(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        require_model(PROVIDER, request.model, MODEL_EXAMPLE)?;
        let connection = self.connection()?;
        let mut body = encode_request(request, false);
        body["options"]["num_predict"] = json!(0);
        let v = http::send_for_json(self.post(&connection, &body), cancel).await?;
        check_error(&v)?;
        Ok(TokenUsage::new(
            v["prompt_eval_count"].as_u64().unwrap_or(0),
            0,
        ))
    }

    fn status(&self) -> Status {
        let model = self.default_model();
        let (configured, message) = match self.connection() {
            Ok(_) => (
                true,
                format!("Ollama configured (endpoint: {})", self.settings.base_url),
            ),
            Err(e) => (false, e.to_string()),
        };
        Status {
            configured,
            backend: PROVIDER.into(),
            model: self.defaults.describe(if model.is_empty() { "(unset)" } else { &model }),
            message,
        }
    }

    fn tool_name_normalizer(&self) -> Option<fn(&str) -> String> {
        Some(normalize_tool_name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
