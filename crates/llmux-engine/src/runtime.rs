//! The tool-calling loop.
//!
//! [`Engine`] drives one backend through a bounded sequence of model turns.
//! Each turn sends the full history; when the model answers with tool calls
//! the handlers run, their results are appended, and the loop continues until
//! the model produces a final answer or the iteration budget runs out.
//!
//! The engine holds no per-invocation state.  History, the iteration counter
//! and the "a tool has run" flag all live on the stack of a single call, so
//! one engine can serve any number of concurrent invocations.

use std::sync::Arc;

use async_trait::async_trait;
use llmux_kernel::{EventBus, NotificationKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compaction::compact_history;
use crate::config::ModelDefaults;
use crate::error::{BlockReason, EngineError, Result};
use crate::llm::adapter::Adapter;
use crate::llm::types::{
    FinishReason, GenerationConfig, Message, Prompt, Status, TokenUsage, ToolCall, TurnRequest,
};
use crate::streaming::{self, ChunkStream};
use crate::tools::ToolExecutor;

/// Warning published when a turn hits the output-token ceiling.
pub const TRUNCATION_WARNING: &str = "Response truncated: reached maximum output tokens";

// ---------------------------------------------------------------------------
// Gen trait
// ---------------------------------------------------------------------------

/// The public generation contract.
///
/// Implemented by [`Engine`], by the [`crate::multiplexer::Multiplexer`] that
/// routes between engines, and by [`crate::retry::Retrying`].
#[async_trait]
pub trait Gen: Send + Sync {
    /// Run the tool loop to completion and return the final text.
    ///
    /// # Errors
    ///
    /// Returns the first fatal condition: configuration, transport, content
    /// policy, handler failure, or [`EngineError::MaxIterationsExceeded`].
    async fn generate(&self, prompt: &Prompt, cancel: &CancellationToken) -> Result<String>;

    /// Run the tool loop, delivering output incrementally.
    ///
    /// Errors raised before the first byte arrives are returned directly;
    /// later ones are delivered through the stream.
    async fn generate_stream(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream>;

    /// Count the prompt's input tokens.
    async fn count_tokens(&self, prompt: &Prompt, cancel: &CancellationToken)
    -> Result<TokenUsage>;

    /// Report configuration state.  Never performs network I/O.
    fn status(&self) -> Status;
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Debug toggles that change what the engine reports, never what it returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineOptions {
    /// Publish model reasoning as [`NotificationKind::Thought`] and forward it
    /// in stream chunks.
    pub show_thoughts: bool,
    /// Log per-turn request summaries at `info`.
    pub debug: bool,
    /// Log every usage report at `info`.
    pub token_debug: bool,
}

/// Tool-calling orchestrator bound to one adapter.
#[derive(Clone)]
pub struct Engine {
    adapter: Arc<dyn Adapter>,
    bus: EventBus,
    defaults: ModelDefaults,
    options: EngineOptions,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("adapter", &self.adapter.name())
            .field("defaults", &self.defaults)
            .field("options", &self.options)
            .finish()
    }
}

impl Engine {
    pub fn new(adapter: Arc<dyn Adapter>, bus: EventBus, defaults: ModelDefaults) -> Self {
        Self {
            adapter,
            bus,
            defaults,
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapter
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// The model a prompt targets: its own when set, else the adapter's.
    pub fn resolve_model(&self, prompt: &Prompt) -> String {
        let requested = prompt.model_name.trim();
        if requested.is_empty() {
            self.adapter.default_model()
        } else {
            requested.to_owned()
        }
    }

    /// Merge the prompt's sampling settings over the configured defaults.
    /// Non-positive prompt values mean "use the default".
    pub fn generation_config(&self, prompt: &Prompt) -> GenerationConfig {
        let instruction = prompt.instruction.trim();
        GenerationConfig {
            system_instruction: (!instruction.is_empty()).then(|| prompt.instruction.clone()),
            temperature: Some(if prompt.temperature > 0.0 {
                prompt.temperature
            } else {
                self.defaults.temperature
            }),
            top_p: Some(if prompt.top_p > 0.0 {
                prompt.top_p
            } else {
                self.defaults.top_p
            }),
            max_output_tokens: if prompt.max_tokens > 0 {
                Some(prompt.max_tokens as u32)
            } else {
                (self.defaults.max_tokens > 0).then_some(self.defaults.max_tokens)
            },
            response_schema: prompt.response_schema.clone(),
            functions: prompt.functions.clone(),
        }
    }

    pub(crate) fn tool_executor<'a>(&self, prompt: &'a Prompt) -> ToolExecutor<'a> {
        ToolExecutor::new(&prompt.handlers).with_name_normalizer(self.adapter.tool_name_normalizer())
    }

    // -- Event helpers -------------------------------------------------------

    pub(crate) fn publish_usage(&self, usage: TokenUsage) {
        if self.options.token_debug {
            info!(
                provider = self.adapter.name(),
                input = usage.input,
                output = usage.output,
                total = usage.total,
                cached = usage.cached,
                "token usage"
            );
        }
        self.bus.publish_usage(self.adapter.name(), usage);
    }

    pub(crate) fn notify(&self, kind: NotificationKind, message: impl Into<String>) {
        self.bus.notify(kind, message);
    }

    pub(crate) fn publish_thought(&self, thought: &str) {
        if self.options.show_thoughts && !thought.trim().is_empty() {
            self.notify(NotificationKind::Thought, format!("Thinking: {thought}"));
        }
    }

    /// Turn a finish reason into an error, a warning, or nothing.
    pub(crate) fn check_finish(&self, reason: &FinishReason, message: &str) -> Result<()> {
        let blocked = match reason {
            FinishReason::Safety => BlockReason::Safety,
            FinishReason::Recitation => BlockReason::Recitation,
            FinishReason::Blocklist => BlockReason::Blocklist,
            FinishReason::ProhibitedContent => BlockReason::ProhibitedContent,
            FinishReason::Spii => BlockReason::Spii,
            FinishReason::MalformedFunctionCall => {
                return Err(EngineError::MalformedFunctionCall {
                    message: message.to_owned(),
                });
            }
            FinishReason::MaxTokens => {
                warn!(provider = self.adapter.name(), "{TRUNCATION_WARNING}");
                self.notify(NotificationKind::Warning, TRUNCATION_WARNING);
                return Ok(());
            }
            FinishReason::Stop
            | FinishReason::ToolCalls
            | FinishReason::Other(_)
            | FinishReason::Unspecified => return Ok(()),
        };
        Err(EngineError::ContentBlocked {
            reason: blocked,
            message: message.to_owned(),
        })
    }

    // -- Blocking loop -------------------------------------------------------

    async fn run(&self, prompt: &Prompt, cancel: &CancellationToken) -> Result<String> {
        let model = self.resolve_model(prompt);
        let config = self.generation_config(prompt);
        let limit = prompt.tool_iteration_limit();
        let executor = self.tool_executor(prompt);

        let mut history = vec![prompt.initial_message()];
        let mut tool_used = false;
        let mut iteration = 0usize;

        info!(
            provider = self.adapter.name(),
            model = %model,
            tools = config.functions.len(),
            limit,
            "starting generation"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if self.options.debug {
                info!(iteration, messages = history.len(), "sending turn");
            }

            let request = TurnRequest {
                model: &model,
                messages: &history,
                config: &config,
            };
            let turn = self.adapter.invoke(request, cancel).await?;

            if let Some(usage) = turn.usage {
                self.publish_usage(usage);
            }
            self.check_finish(&turn.finish_reason, &turn.finish_message)?;
            for thought in turn.message.thoughts() {
                self.publish_thought(thought);
            }

            if !turn.has_tool_calls() {
                return final_answer(&turn.message, tool_used);
            }

            let calls: Vec<ToolCall> = turn.message.tool_calls().into_iter().cloned().collect();
            let commentary = turn.message.text();
            if !commentary.trim().is_empty() {
                self.notify(NotificationKind::Info, commentary);
            }
            debug!(
                iteration,
                calls = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "model requested tools"
            );

            let execution = executor.execute(&calls, cancel).await?;
            tool_used = true;

            compact_history(&mut history);
            history.push(turn.message);
            history.extend(execution.into_messages());

            iteration += 1;
            if iteration >= limit {
                warn!(limit, "tool iteration budget exhausted");
                return Err(EngineError::MaxIterationsExceeded {
                    max_iterations: limit,
                });
            }
        }
    }
}

/// The text a turn without tool calls resolves to.
fn final_answer(message: &Message, tool_used: bool) -> Result<String> {
    let text = message.text();
    if !text.trim().is_empty() {
        return Ok(text);
    }
    if let Some(thought) = message.thoughts().into_iter().rev().find(|t| !t.trim().is_empty()) {
        return Ok(thought.to_owned());
    }
    if tool_used {
        Ok(String::new())
    } else {
        Err(EngineError::EmptyResponse)
    }
}

#[async_trait]
impl Gen for Engine {
    async fn generate(&self, prompt: &Prompt, cancel: &CancellationToken) -> Result<String> {
        self.run(prompt, cancel).await
    }

    async fn generate_stream(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        streaming::start(self.clone(), prompt.clone(), cancel).await
    }

    async fn count_tokens(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        let model = self.resolve_model(prompt);
        let config = self.generation_config(prompt);
        let history = [prompt.initial_message()];
        let usage = self
            .adapter
            .count_tokens(
                TurnRequest {
                    model: &model,
                    messages: &history,
                    config: &config,
                },
                cancel,
            )
            .await?;
        self.publish_usage(usage);
        Ok(usage)
    }

    fn status(&self) -> Status {
        self.adapter.status()
    }
}
