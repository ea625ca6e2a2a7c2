//! The backend adapter contract.
//!
//! An [`Adapter`] speaks exactly one backend's wire protocol.  It owns no
//! conversation state: the orchestrator hands it the full message history on
//! every call and gets back a normalized [`ModelTurn`] or a stream of
//! [`StreamDelta`]s.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::llm::types::{ModelTurn, Status, StreamDelta, TokenUsage, TurnRequest};

/// Incremental output of one underlying streaming request.
pub type DeltaStream = BoxStream<'static, Result<StreamDelta>>;

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Provider key, e.g. `"ollama"`.
    fn name(&self) -> &str;

    /// Model used when the prompt names none.
    fn default_model(&self) -> String;

    /// One blocking round trip.
    async fn invoke(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ModelTurn>;

    /// Open a fresh underlying stream for one model turn.
    async fn stream(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream>;

    /// Prompt-token count for `request`.  Best effort; some backends estimate.
    async fn count_tokens(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TokenUsage>;

    /// Report configuration state.  Never performs network I/O.
    fn status(&self) -> Status;

    /// Canonicalizes tool names for backends whose models mangle them.
    /// Consulted only when an exact handler lookup fails.
    fn tool_name_normalizer(&self) -> Option<fn(&str) -> String> {
        None
    }
}
