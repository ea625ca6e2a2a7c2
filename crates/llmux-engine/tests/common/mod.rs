//! Shared fixtures for the engine integration tests.
//!
//! [`ScriptedAdapter`] replays a queue of model turns and records every
//! request it receives.  The same script drives both modes: `invoke` returns
//! the next turn whole, `stream` slices it into deltas the way a real
//! backend would.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use llmux_engine::llm::types::{ArgumentsFragment, FragmentKey, ToolCallFragment};
use llmux_engine::{
    Adapter, DeltaStream, EngineError, Event, EventBus, FinishReason, GenerationConfig, JsonMap,
    Message, ModelTurn, NotificationKind, Part, Result, Role, Status, StreamDelta, TokenUsage,
    ToolArguments, ToolCall, TurnRequest,
};

// ---------------------------------------------------------------------------
// Turn builders
// ---------------------------------------------------------------------------

pub fn turn(parts: Vec<Part>, finish_reason: FinishReason) -> ModelTurn {
    ModelTurn {
        message: Message::new(Role::Model, parts),
        finish_reason,
        finish_message: String::new(),
        usage: Some(TokenUsage::new(10, 5)),
    }
}

pub fn text_turn(text: &str) -> ModelTurn {
    turn(vec![Part::Text(text.into())], FinishReason::Stop)
}

/// A turn requesting `calls`, each given as `(id, name, json arguments)`.
pub fn tool_turn(calls: &[(&str, &str, Value)]) -> ModelTurn {
    let parts = calls
        .iter()
        .map(|(id, name, args)| {
            Part::ToolCall(ToolCall::new(
                *id,
                *name,
                ToolArguments::Json(args.to_string()),
            ))
        })
        .collect();
    turn(parts, FinishReason::ToolCalls)
}

pub fn obj(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

// ---------------------------------------------------------------------------
// Scripted adapter
// ---------------------------------------------------------------------------

/// One request as the adapter saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub model: String,
    pub messages: Vec<Message>,
    pub config: GenerationConfig,
    pub streamed: bool,
}

pub struct ScriptedAdapter {
    name: &'static str,
    default_model: String,
    script: Mutex<VecDeque<Result<ModelTurn>>>,
    requests: Mutex<Vec<Recorded>>,
    normalizer: Option<fn(&str) -> String>,
    /// Characters per streamed text delta.
    chunk_size: usize,
}

impl ScriptedAdapter {
    pub fn new(turns: Vec<ModelTurn>) -> Arc<Self> {
        Self::with_results(turns.into_iter().map(Ok).collect())
    }

    pub fn with_results(script: Vec<Result<ModelTurn>>) -> Arc<Self> {
        Arc::new(Self::build(script, None))
    }

    pub fn with_normalizer(turns: Vec<ModelTurn>, normalizer: fn(&str) -> String) -> Arc<Self> {
        Arc::new(Self::build(
            turns.into_iter().map(Ok).collect(),
            Some(normalizer),
        ))
    }

    fn build(script: Vec<Result<ModelTurn>>, normalizer: Option<fn(&str) -> String>) -> Self {
        Self {
            name: "scripted",
            default_model: "scripted-model".into(),
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            normalizer,
            chunk_size: 3,
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn record(&self, request: TurnRequest<'_>, streamed: bool) {
        self.requests.lock().unwrap().push(Recorded {
            model: request.model.to_owned(),
            messages: request.messages.to_vec(),
            config: request.config.clone(),
            streamed,
        });
    }

    fn next_turn(&self) -> Result<ModelTurn> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(EngineError::Internal("script exhausted".into())))
    }

    /// Slice a whole turn into the deltas a streaming backend would send.
    fn to_deltas(&self, turn: ModelTurn) -> Vec<StreamDelta> {
        let mut deltas = Vec::new();
        let mut call_index = 0u32;
        for part in turn.message.parts {
            match part {
                Part::Text(text) => {
                    let chars: Vec<char> = text.chars().collect();
                    for piece in chars.chunks(self.chunk_size) {
                        deltas.push(StreamDelta::Text(piece.iter().collect()));
                    }
                }
                Part::Thinking(text) => {
                    deltas.push(StreamDelta::ThinkingBreak);
                    let chars: Vec<char> = text.chars().collect();
                    for piece in chars.chunks(self.chunk_size) {
                        deltas.push(StreamDelta::Thinking(piece.iter().collect()));
                    }
                }
                Part::ToolCall(call) => {
                    let key = FragmentKey::Index(call_index);
                    call_index += 1;
                    match call.arguments {
                        ToolArguments::Json(text) => {
                            let mid = (0..=text.len() / 2)
                                .rev()
                                .find(|i| text.is_char_boundary(*i))
                                .unwrap_or(0);
                            let (head, tail) = text.split_at(mid);
                            deltas.push(StreamDelta::ToolCall(ToolCallFragment {
                                key: key.clone(),
                                id: Some(call.id),
                                name: Some(call.name),
                                arguments: Some(ArgumentsFragment::Partial(head.to_owned())),
                            }));
                            deltas.push(StreamDelta::ToolCall(ToolCallFragment {
                                key,
                                id: None,
                                name: None,
                                arguments: Some(ArgumentsFragment::Partial(tail.to_owned())),
                            }));
                        }
                        ToolArguments::Value(value) => {
                            deltas.push(StreamDelta::ToolCall(ToolCallFragment {
                                key,
                                id: Some(call.id),
                                name: Some(call.name),
                                arguments: Some(ArgumentsFragment::Complete(value)),
                            }));
                        }
                    }
                }
                Part::ToolResult(_) | Part::Media(_) => {}
            }
        }
        deltas.push(StreamDelta::Finish {
            reason: turn.finish_reason,
            message: turn.finish_message,
        });
        if let Some(usage) = turn.usage {
            deltas.push(StreamDelta::Usage(usage));
        }
        deltas
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn name(&self) -> &str {
        self.name
    }

    fn default_model(&self) -> String {
        self.default_model.clone()
    }

    async fn invoke(
        &self,
        request: TurnRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<ModelTurn> {
        self.record(request, false);
        self.next_turn()
    }

    async fn stream(
        &self,
        request: TurnRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        self.record(request, true);
        let deltas = self.to_deltas(self.next_turn()?);
        Ok(Box::pin(stream::iter(deltas.into_iter().map(Ok))))
    }

    async fn count_tokens(
        &self,
        request: TurnRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        let chars: usize = request.messages.iter().map(|m| m.text().len()).sum();
        Ok(TokenUsage {
            input: chars as u64,
            total: chars as u64,
            ..TokenUsage::default()
        })
    }

    fn status(&self) -> Status {
        Status {
            configured: true,
            backend: self.name.into(),
            model: self.default_model.clone(),
            message: "scripted".into(),
        }
    }

    fn tool_name_normalizer(&self) -> Option<fn(&str) -> String> {
        self.normalizer
    }
}

// ---------------------------------------------------------------------------
// Echo adapter
// ---------------------------------------------------------------------------

/// Stateless adapter whose answer depends only on the request.
///
/// The first turn asks the `echo` tool to repeat the user's text; the next
/// turn answers with whatever the tool returned.  Used to check that
/// concurrent invocations never see each other's history.
pub struct EchoAdapter;

#[async_trait]
impl Adapter for EchoAdapter {
    fn name(&self) -> &str {
        "echo"
    }

    fn default_model(&self) -> String {
        "echo-1".into()
    }

    async fn invoke(
        &self,
        request: TurnRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<ModelTurn> {
        tokio::task::yield_now().await;
        let last = request
            .messages
            .last()
            .ok_or_else(|| EngineError::Internal("empty history".into()))?;

        if let Some(result) = last.tool_results_iter().next() {
            let echoed = result.response["text"].as_str().unwrap_or_default();
            return Ok(text_turn(&format!("echo: {echoed}")));
        }
        Ok(tool_turn(&[(
            "call-1",
            "echo",
            json!({ "text": last.text() }),
        )]))
    }

    async fn stream(
        &self,
        _request: TurnRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        Err(EngineError::Internal("echo adapter does not stream".into()))
    }

    async fn count_tokens(
        &self,
        _request: TurnRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        Ok(TokenUsage::default())
    }

    fn status(&self) -> Status {
        Status {
            configured: true,
            backend: "echo".into(),
            model: "echo-1".into(),
            message: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Flood adapter
// ---------------------------------------------------------------------------

/// Streams `deltas` one-character text deltas, far more than the chunk
/// queue holds, and raises `dropped` once the engine lets go of the stream.
pub struct FloodAdapter {
    pub deltas: usize,
    pub dropped: Arc<AtomicBool>,
}

impl FloodAdapter {
    pub fn new(deltas: usize) -> Arc<Self> {
        Arc::new(Self {
            deltas,
            dropped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn was_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Adapter for FloodAdapter {
    fn name(&self) -> &str {
        "flood"
    }

    fn default_model(&self) -> String {
        "flood-1".into()
    }

    async fn invoke(
        &self,
        _request: TurnRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<ModelTurn> {
        Err(EngineError::Internal("flood adapter only streams".into()))
    }

    async fn stream(
        &self,
        _request: TurnRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        let flag = DropFlag(Arc::clone(&self.dropped));
        let deltas = stream::iter(0..self.deltas).map(move |_| {
            let _held = &flag;
            Ok(StreamDelta::Text("x".into()))
        });
        Ok(Box::pin(deltas))
    }

    async fn count_tokens(
        &self,
        _request: TurnRequest<'_>,
        _cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        Ok(TokenUsage::default())
    }

    fn status(&self) -> Status {
        Status {
            configured: true,
            backend: "flood".into(),
            model: "flood-1".into(),
            message: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Event helpers
// ---------------------------------------------------------------------------

/// Everything currently queued on `rx`.
pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<Arc<Event>>) -> Vec<Arc<Event>> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn notifications(events: &[Arc<Event>], wanted: NotificationKind) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event.as_ref() {
            Event::Notification { kind, message, .. } if *kind == wanted => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn usage_events(events: &[Arc<Event>]) -> Vec<(String, TokenUsage)> {
    events
        .iter()
        .filter_map(|event| match event.as_ref() {
            Event::TokenUsage { provider, usage, .. } => Some((provider.clone(), *usage)),
            _ => None,
        })
        .collect()
}

pub fn bus() -> EventBus {
    EventBus::new(1024)
}
