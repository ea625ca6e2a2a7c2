//! Tool call execution.
//!
//! The executor runs the handlers for one model turn, in request order, and
//! turns their output into a tool-result message.  Two tools get special
//! treatment: [`VIEW_IMAGE`] and [`VIEW_DOCUMENT`] return base64 payloads that
//! must never be inlined into a tool-result message.  Their payload is
//! decoded, stripped from the result map, and queued as a separate user
//! message appended after the tool results.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::llm::types::{
    HandlerMap, JsonMap, Media, Message, Part, Role, ToolArguments, ToolCall, ToolResult,
};

/// Tool whose result carries an image payload.
pub const VIEW_IMAGE: &str = "viewImage";

/// Tool whose result carries a document payload.
pub const VIEW_DOCUMENT: &str = "viewDocument";

/// Error type returned by tool handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// A callable capability exposed to the model.
///
/// Handlers are shared across concurrent invocations and must not assume
/// exclusive access to anything they touch.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(
        &self,
        cancel: CancellationToken,
        args: JsonMap,
    ) -> std::result::Result<JsonMap, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(CancellationToken, JsonMap) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<JsonMap, HandlerError>> + Send,
{
    async fn call(
        &self,
        cancel: CancellationToken,
        args: JsonMap,
    ) -> std::result::Result<JsonMap, HandlerError> {
        (self.0)(cancel, args).await
    }
}

/// Wrap an async closure as a [`ToolHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(CancellationToken, JsonMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<JsonMap, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ---------------------------------------------------------------------------
// Argument decoding
// ---------------------------------------------------------------------------

/// Normalize tool-call arguments into an object.
///
/// JSON text, a native map, and empty/absent arguments are all accepted;
/// empty forms become `{}`.
pub fn decode_arguments(tool_name: &str, arguments: &ToolArguments) -> Result<JsonMap> {
    match arguments {
        ToolArguments::Json(text) => decode_json_text(tool_name, text),
        ToolArguments::Value(value) => decode_value(tool_name, value),
    }
}

fn decode_json_text(tool_name: &str, text: &str) -> Result<JsonMap> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(JsonMap::new());
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| EngineError::InvalidArguments {
            tool_name: tool_name.to_owned(),
            reason: e.to_string(),
        })?;
    decode_value(tool_name, &value)
}

fn decode_value(tool_name: &str, value: &Value) -> Result<JsonMap> {
    match value {
        Value::Null => Ok(JsonMap::new()),
        Value::Object(map) => Ok(map.clone()),
        // Some backends double-encode arguments as a JSON string.
        Value::String(text) => decode_json_text(tool_name, text),
        other => Err(EngineError::InvalidArguments {
            tool_name: tool_name.to_owned(),
            reason: format!("expected a JSON object, got {other}"),
        }),
    }
}

// ---------------------------------------------------------------------------
// Binary payloads
// ---------------------------------------------------------------------------

/// Binary content returned by [`VIEW_IMAGE`] or [`VIEW_DOCUMENT`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPayload {
    pub path: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub data: Vec<u8>,
}

impl ToolPayload {
    /// Path text safe to show to the model.
    pub fn display_path(&self) -> &str {
        let trimmed = self.path.trim();
        if trimmed.is_empty() { "tool payload" } else { trimmed }
    }

    fn media(&self) -> Media {
        Media::new(self.mime_type.clone(), self.data.clone())
    }

    /// Follow-up user message carrying an image.
    pub fn image_message(&self) -> Message {
        Message::new(
            Role::User,
            vec![
                Part::Text(format!("Image retrieved from {}", self.display_path())),
                Part::Media(self.media()),
            ],
        )
    }

    /// Follow-up user message carrying a document.
    pub fn document_message(&self) -> Message {
        Message::new(
            Role::User,
            vec![
                Part::Text(format!(
                    "Document retrieved from {} (MIME: {}, {} bytes)",
                    self.display_path(),
                    self.mime_type,
                    self.size_bytes
                )),
                Part::Media(self.media()),
            ],
        )
    }
}

/// Split a tool result into its binary payload and a sanitized map.
///
/// On error the sanitized map is still returned alongside the reason so
/// callers can log what the tool sent without its data fields.
pub fn extract_payload(
    result: &JsonMap,
) -> std::result::Result<(Option<ToolPayload>, JsonMap), (String, JsonMap)> {
    let mut sanitized = result.clone();

    if result.get("success").and_then(Value::as_bool) != Some(true) {
        strip_data_fields(&mut sanitized);
        return Ok((None, sanitized));
    }

    let encoded = match result.get("data_base64").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s,
        _ => {
            strip_data_fields(&mut sanitized);
            return Err(("missing base64-encoded payload".into(), sanitized));
        }
    };

    let mime_type = match result.get("mime_type").and_then(Value::as_str) {
        Some(m) if !m.is_empty() => m.to_owned(),
        _ => return Err(("missing MIME type".into(), sanitized)),
    };

    let size_bytes = match result.get("size_bytes") {
        None | Some(Value::Null) => 0,
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or_default(),
        Some(other) => {
            return Err((
                format!("invalid size_bytes: unexpected value {other}"),
                sanitized,
            ));
        }
    };

    let path = result
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let data = match BASE64.decode(encoded) {
        Ok(data) => data,
        Err(e) => return Err((format!("invalid base64 data: {e}"), sanitized)),
    };

    strip_data_fields(&mut sanitized);
    Ok((
        Some(ToolPayload {
            path,
            mime_type,
            size_bytes,
            data,
        }),
        sanitized,
    ))
}

fn strip_data_fields(map: &mut JsonMap) {
    map.remove("data_base64");
    map.remove("data_url");
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Messages produced by one round of tool execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecution {
    /// One result per call, in call order.
    pub results: Vec<ToolResult>,
    /// Media messages queued by payload-carrying tools.
    pub media_messages: Vec<Message>,
}

impl ToolExecution {
    /// The tool message followed by any media messages.
    pub fn into_messages(self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(1 + self.media_messages.len());
        messages.push(Message::tool_results(self.results));
        messages.extend(self.media_messages);
        messages
    }
}

/// Runs the handlers for one model turn.
pub struct ToolExecutor<'a> {
    handlers: &'a HandlerMap,
    normalizer: Option<fn(&str) -> String>,
}

impl<'a> ToolExecutor<'a> {
    pub fn new(handlers: &'a HandlerMap) -> Self {
        Self {
            handlers,
            normalizer: None,
        }
    }

    /// Fall back to normalized-name lookup for backends that mangle tool
    /// names.
    pub fn with_name_normalizer(mut self, normalizer: Option<fn(&str) -> String>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// The handler for `name` together with the key it is registered under.
    fn resolve(&self, name: &str) -> Option<(&'a str, &'a Arc<dyn ToolHandler>)> {
        if let Some((registered, handler)) = self.handlers.get_key_value(name) {
            return Some((registered.as_str(), handler));
        }
        let normalize = self.normalizer?;
        let wanted = normalize(name);
        if wanted.is_empty() {
            return None;
        }
        let mut candidates: Vec<(&'a String, &'a Arc<dyn ToolHandler>)> = self
            .handlers
            .iter()
            .filter(|(registered, _)| normalize(registered) == wanted)
            .collect();
        // Deterministic pick when two registered names collide.
        candidates.sort_by(|a, b| a.0.cmp(b.0));
        candidates
            .first()
            .map(|&(registered, handler)| (registered.as_str(), handler))
    }

    /// Execute every call sequentially, in request order.
    ///
    /// Any missing handler, argument error, handler failure, or bad payload
    /// aborts the whole turn.
    pub async fn execute(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Result<ToolExecution> {
        let mut results = Vec::with_capacity(calls.len());
        let mut media_messages = Vec::new();

        for call in calls {
            let (registered, handler) = self
                .resolve(&call.name)
                .ok_or_else(|| EngineError::NoHandler {
                    tool_name: call.name.clone(),
                })?;
            let args = decode_arguments(&call.name, &call.arguments)?;

            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            tracing::debug!(tool = %call.name, id = %call.id, "executing tool");
            let mut response = handler
                .call(cancel.clone(), args)
                .await
                .map_err(|e| EngineError::Handler {
                    tool_name: call.name.clone(),
                    reason: e.to_string(),
                })?;

            // Matched on the registered name; the model may echo a mangled one.
            if registered == VIEW_IMAGE || registered == VIEW_DOCUMENT {
                let (payload, sanitized) = extract_payload(&response).map_err(|(reason, _)| {
                    EngineError::InvalidToolPayload {
                        tool_name: call.name.clone(),
                        reason,
                    }
                })?;
                response = sanitized;
                if let Some(payload) = payload {
                    tracing::debug!(
                        tool = %call.name,
                        mime = %payload.mime_type,
                        bytes = payload.data.len(),
                        "queued tool media"
                    );
                    media_messages.push(if registered == VIEW_IMAGE {
                        payload.image_message()
                    } else {
                        payload.document_message()
                    });
                }
            }

            results.push(ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                response,
            });
        }

        Ok(ToolExecution {
            results,
            media_messages,
        })
    }
}

/// Convenience: build a handler map from `(name, handler)` pairs.
pub fn handler_map<I>(entries: I) -> HandlerMap
where
    I: IntoIterator<Item = (String, Arc<dyn ToolHandler>)>,
{
    entries.into_iter().collect::<HashMap<_, _>>()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
