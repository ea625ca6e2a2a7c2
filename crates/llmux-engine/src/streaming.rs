//! Streaming generation.
//!
//! A streaming invocation runs the same tool loop as the blocking path, but
//! each model turn is an underlying backend stream.  A background task reads
//! deltas, forwards text as it arrives, and accumulates tool-call fragments.
//! When an underlying stream ends with tool calls pending, the task emits one
//! consolidated tool-call chunk, executes the handlers, and opens a fresh
//! underlying stream with the extended history.  The caller sees a single
//! continuous [`ChunkStream`].

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

use crate::compaction::compact_history;
use crate::error::{EngineError, Result};
use crate::llm::adapter::DeltaStream;
use crate::llm::types::{
    ArgumentsFragment, FinishReason, FragmentKey, GenerationConfig, Message, Part, Prompt, Role,
    StreamChunk, StreamDelta, TokenUsage, ToolArguments, ToolCall, ToolCallFragment, TurnRequest,
};
use crate::runtime::Engine;

/// Chunks buffered between the background task and the consumer.
const CHUNK_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Consumer side
// ---------------------------------------------------------------------------

/// The caller's view of a streaming generation.
///
/// Dropping or [closing](ChunkStream::close) the stream cancels the
/// background work.  After cancellation the next read reports end of stream.
pub struct ChunkStream {
    rx: mpsc::Receiver<Result<StreamChunk>>,
    cancel: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ChunkStream {
    /// A stream fed by an existing channel.  Used by wrappers that re-emit
    /// another stream's chunks.
    pub fn from_channel(rx: mpsc::Receiver<Result<StreamChunk>>, cancel: CancellationToken) -> Self {
        let cancelled = Box::pin(cancel.clone().cancelled_owned());
        Self {
            rx,
            cancel,
            cancelled,
        }
    }

    /// Receive the next chunk, or `None` once the stream is finished or
    /// cancelled.
    pub async fn recv(&mut self) -> Option<Result<StreamChunk>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Stop the background work.  Idempotent.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drain the stream, concatenating text.  The first error is returned.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(chunk) = self.recv().await {
            text.push_str(&chunk?.text);
        }
        Ok(text)
    }
}

impl Stream for ChunkStream {
    type Item = Result<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // Polled first so a pending reader is woken by cancellation too.
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Fragment accumulation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
    complete: Option<serde_json::Value>,
}

/// Reassembles streamed tool-call fragments into whole calls.
///
/// Fragments are grouped by [`FragmentKey`]; calls come out in the order
/// their first fragment arrived.  A fragment keyed by an empty id belongs to
/// the most recent call.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    order: Vec<FragmentKey>,
    calls: HashMap<FragmentKey, PendingCall>,
    latest: Option<FragmentKey>,
}

impl ToolCallAccumulator {
    pub fn push(&mut self, fragment: ToolCallFragment) {
        let key = match fragment.key {
            FragmentKey::Id(id) if id.is_empty() => self
                .latest
                .clone()
                .unwrap_or(FragmentKey::Id(String::new())),
            key => key,
        };

        if !self.calls.contains_key(&key) {
            self.order.push(key.clone());
        }
        let call = self.calls.entry(key.clone()).or_default();

        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            call.id = id;
        }
        if let Some(name) = fragment.name.filter(|name| !name.is_empty()) {
            call.name = name;
        }
        match fragment.arguments {
            Some(ArgumentsFragment::Partial(piece)) => call.arguments.push_str(&piece),
            Some(ArgumentsFragment::Complete(value)) => call.complete = Some(value),
            None => {}
        }
        self.latest = Some(key);
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Consolidated calls, in first-seen order.  Accumulated argument text is
    /// passed through as-is; the executor rejects it if it is not JSON.
    pub fn finish(mut self) -> Vec<ToolCall> {
        self.order
            .iter()
            .filter_map(|key| self.calls.remove(key))
            .map(|pending| {
                let arguments = match pending.complete {
                    Some(value) => ToolArguments::Value(value),
                    None => ToolArguments::Json(pending.arguments),
                };
                ToolCall::new(pending.id, pending.name, arguments)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Producer side
// ---------------------------------------------------------------------------

/// Everything one underlying stream produced.
#[derive(Debug, Default)]
struct Round {
    text: String,
    /// Reasoning segments, one per block the backend delimited.
    thoughts: Vec<String>,
    thought_open: bool,
    calls: Vec<ToolCall>,
    usage: Option<TokenUsage>,
    finish_reason: Option<FinishReason>,
    finish_message: String,
}

impl Round {
    fn push_thinking(&mut self, text: &str) {
        match self.thoughts.last_mut() {
            Some(open) if self.thought_open => open.push_str(text),
            _ => self.thoughts.push(text.to_owned()),
        }
        self.thought_open = true;
    }

    /// Close the open segment, returning it.
    fn close_thought(&mut self) -> Option<&str> {
        if !std::mem::take(&mut self.thought_open) {
            return None;
        }
        self.thoughts.last().map(String::as_str)
    }

    /// The last non-blank segment, which is what a blocking turn would answer.
    fn last_thought(&self) -> Option<&str> {
        self.thoughts
            .iter()
            .rev()
            .map(String::as_str)
            .find(|t| !t.trim().is_empty())
    }

    fn into_message(self) -> Message {
        let mut parts = Vec::with_capacity(self.thoughts.len() + 1 + self.calls.len());
        parts.extend(self.thoughts.into_iter().map(Part::Thinking));
        if !self.text.is_empty() {
            parts.push(Part::Text(self.text));
        }
        parts.extend(self.calls.into_iter().map(Part::ToolCall));
        Message::new(Role::Model, parts)
    }
}

struct Reconciler {
    engine: Engine,
    prompt: Prompt,
    model: String,
    config: GenerationConfig,
    history: Vec<Message>,
    tx: mpsc::Sender<Result<StreamChunk>>,
    cancel: CancellationToken,
    tool_used: bool,
}

/// Open the first underlying stream and hand the rest of the invocation to a
/// background task.
pub(crate) async fn start(
    engine: Engine,
    prompt: Prompt,
    cancel: &CancellationToken,
) -> Result<ChunkStream> {
    let token = cancel.child_token();
    let model = engine.resolve_model(&prompt);
    let config = engine.generation_config(&prompt);
    let history = vec![prompt.initial_message()];

    debug!(
        provider = engine.adapter().name(),
        model = %model,
        tools = config.functions.len(),
        "opening stream"
    );

    let first = engine
        .adapter()
        .stream(
            TurnRequest {
                model: &model,
                messages: &history,
                config: &config,
            },
            &token,
        )
        .await?;

    let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
    let reconciler = Reconciler {
        engine,
        prompt,
        model,
        config,
        history,
        tx: tx.clone(),
        cancel: token.clone(),
        tool_used: false,
    };

    tokio::spawn(async move {
        match reconciler.run(first).await {
            Ok(()) | Err(EngineError::Cancelled) => {}
            Err(e) => {
                warn!(error = %e, "stream failed");
                let _ = tx.send(Err(e)).await;
            }
        }
    });

    Ok(ChunkStream::from_channel(rx, token))
}

impl Reconciler {
    async fn run(mut self, mut deltas: DeltaStream) -> Result<()> {
        let limit = self.prompt.tool_iteration_limit();
        let mut iteration = 0usize;

        loop {
            let round = self.drain(&mut deltas).await?;
            let reason = round.finish_reason.clone().unwrap_or(FinishReason::Unspecified);
            self.engine.check_finish(&reason, &round.finish_message)?;

            if round.calls.is_empty() {
                return self.finish_answer(&round).await;
            }

            self.send(StreamChunk::tool_calls(round.calls.clone())).await?;
            debug!(
                iteration,
                calls = ?round.calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "stream requested tools"
            );

            let execution = {
                let executor = self.engine.tool_executor(&self.prompt);
                executor.execute(&round.calls, &self.cancel).await?
            };
            self.tool_used = true;

            compact_history(&mut self.history);
            self.history.push(round.into_message());
            self.history.extend(execution.into_messages());

            iteration += 1;
            if iteration >= limit {
                warn!(limit, "tool iteration budget exhausted");
                return Err(EngineError::MaxIterationsExceeded {
                    max_iterations: limit,
                });
            }

            deltas = self
                .engine
                .adapter()
                .stream(
                    TurnRequest {
                        model: &self.model,
                        messages: &self.history,
                        config: &self.config,
                    },
                    &self.cancel,
                )
                .await?;
        }
    }

    /// Read one underlying stream to its end.
    async fn drain(&mut self, deltas: &mut DeltaStream) -> Result<Round> {
        let mut round = Round::default();
        let mut calls = ToolCallAccumulator::default();
        let show_thoughts = self.engine.options().show_thoughts;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                next = deltas.next() => next,
            };
            let Some(delta) = next else { break };

            match delta? {
                StreamDelta::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.close_thought(&mut round);
                    round.text.push_str(&text);
                    self.send(StreamChunk::text(text)).await?;
                }
                StreamDelta::Thinking(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    round.push_thinking(&text);
                    if show_thoughts {
                        self.send(StreamChunk::thinking(text)).await?;
                    }
                }
                StreamDelta::ThinkingBreak => self.close_thought(&mut round),
                StreamDelta::ToolCall(fragment) => {
                    self.close_thought(&mut round);
                    calls.push(fragment);
                }
                StreamDelta::Usage(usage) => round.usage = Some(usage),
                StreamDelta::Finish { reason, message } => {
                    round.finish_reason = Some(reason);
                    if !message.is_empty() {
                        round.finish_message = message;
                    }
                }
            }
        }
        self.close_thought(&mut round);

        if let Some(usage) = round.usage {
            self.engine.publish_usage(usage);
            self.send(StreamChunk::usage(usage)).await?;
        }
        round.calls = calls.finish();
        Ok(round)
    }

    /// Close out a turn that requested no tools.
    async fn finish_answer(&self, round: &Round) -> Result<()> {
        if !round.text.trim().is_empty() {
            return Ok(());
        }
        // Also sent when the thinking chunks already went out; text carries the answer.
        if let Some(thought) = round.last_thought() {
            return self.send(StreamChunk::text(thought)).await;
        }
        if self.tool_used {
            Ok(())
        } else {
            Err(EngineError::EmptyResponse)
        }
    }

    /// Publishes a finished reasoning segment as a thought notification.
    fn close_thought(&self, round: &mut Round) {
        if let Some(thought) = round.close_thought() {
            self.engine.publish_thought(thought);
        }
    }

    /// Waits for queue space unless the invocation is cancelled first.  A
    /// closed receiver means the consumer went away.
    async fn send(&self, chunk: StreamChunk) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            sent = self.tx.send(Ok(chunk)) => sent.map_err(|_| EngineError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn partial(key: FragmentKey, id: Option<&str>, name: Option<&str>, args: &str) -> ToolCallFragment {
        ToolCallFragment {
            key,
            id: id.map(str::to_owned),
            name: name.map(str::to_owned),
            arguments: Some(ArgumentsFragment::Partial(args.to_owned())),
        }
    }

    #[test]
    fn index_keyed_fragments_interleave() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(partial(FragmentKey::Index(0), Some("a"), Some("readFile"), "{\"pa"));
        acc.push(partial(FragmentKey::Index(1), Some("b"), Some("listDir"), "{}"));
        acc.push(partial(FragmentKey::Index(0), None, None, "th\":\"x\"}"));

        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[0].name, "readFile");
        assert_eq!(
            calls[0].arguments,
            ToolArguments::Json("{\"path\":\"x\"}".into())
        );
        assert_eq!(calls[1].name, "listDir");
    }

    #[test]
    fn empty_id_continues_latest_call() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(partial(FragmentKey::Id("call_1".into()), Some("call_1"), Some("search"), "{\"q\":"));
        acc.push(partial(FragmentKey::Id(String::new()), None, None, "\"rust\"}"));
        acc.push(partial(FragmentKey::Id("call_2".into()), Some("call_2"), Some("open"), ""));
        acc.push(partial(FragmentKey::Id(String::new()), None, None, "{}"));

        let calls = acc.finish();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, ToolArguments::Json("{\"q\":\"rust\"}".into()));
        assert_eq!(calls[1].id, "call_2");
        assert_eq!(calls[1].arguments, ToolArguments::Json("{}".into()));
    }

    #[test]
    fn complete_arguments_win_over_text() {
        let mut acc = ToolCallAccumulator::default();
        acc.push(ToolCallFragment {
            key: FragmentKey::Index(0),
            id: None,
            name: Some("ls".into()),
            arguments: Some(ArgumentsFragment::Complete(json!({"dir": "/"}))),
        });
        let calls = acc.finish();
        assert_eq!(calls[0].arguments, ToolArguments::Value(json!({"dir": "/"})));
        assert_eq!(calls[0].id, "");
    }

    #[test]
    fn empty_accumulator() {
        let acc = ToolCallAccumulator::default();
        assert!(acc.is_empty());
        assert!(acc.finish().is_empty());
    }

    #[test]
    fn round_message_orders_parts() {
        let round = Round {
            text: "checking".into(),
            thoughts: vec!["plan".into(), "then act".into()],
            calls: vec![ToolCall::new("1", "ls", ToolArguments::default())],
            ..Round::default()
        };
        let msg = round.into_message();
        assert_eq!(msg.role, Role::Model);
        assert_eq!(msg.parts[0], Part::Thinking("plan".into()));
        assert_eq!(msg.parts[1], Part::Thinking("then act".into()));
        assert_eq!(msg.parts[2], Part::Text("checking".into()));
        assert!(msg.has_tool_calls());
    }

    #[test]
    fn thinking_splits_at_breaks_and_other_deltas() {
        let mut round = Round::default();
        round.push_thinking("fir");
        round.push_thinking("st");
        assert_eq!(round.close_thought(), Some("first"));
        assert_eq!(round.close_thought(), None);
        round.push_thinking("second");
        round.push_thinking("  ");
        round.close_thought();
        round.push_thinking(" \n");
        assert_eq!(round.thoughts, vec!["first", "second  ", " \n"]);
        assert_eq!(round.last_thought(), Some("second  "));
    }

    #[tokio::test]
    async fn pending_poll_wakes_on_cancel() {
        let (_tx, rx) = mpsc::channel::<Result<StreamChunk>>(4);
        let cancel = CancellationToken::new();
        let mut stream = ChunkStream::from_channel(rx, cancel.clone());
        let reader = tokio::spawn(async move { stream.next().await.is_none() });
        tokio::task::yield_now().await;
        cancel.cancel();
        let ended = tokio::time::timeout(std::time::Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(ended);
    }

    #[tokio::test]
    async fn closed_stream_reads_as_finished() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = ChunkStream::from_channel(rx, CancellationToken::new());
        tx.send(Ok(StreamChunk::text("a"))).await.unwrap();
        stream.close();
        assert!(stream.recv().await.is_none());
        assert!(stream.is_closed());
    }
}
