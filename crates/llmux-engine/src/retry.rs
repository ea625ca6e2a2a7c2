//! Retry middleware.
//!
//! [`Retrying`] wraps any [`Gen`] and repeats a whole invocation when it
//! fails with a transient transport error.  Configuration, content-policy,
//! handler and budget errors are returned immediately.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetrySettings;
use crate::error::{EngineError, Result};
use crate::llm::types::{Prompt, Status, TokenUsage};
use crate::runtime::Gen;
use crate::streaming::ChunkStream;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A [`Gen`] that retries transient failures with exponential backoff.
#[derive(Debug)]
pub struct Retrying<G> {
    inner: G,
    settings: RetrySettings,
}

impl<G: Gen> Retrying<G> {
    pub fn new(inner: G, settings: RetrySettings) -> Self {
        Self { inner, settings }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    /// Total attempts, counting the first one.
    fn attempts(&self) -> u32 {
        self.settings.max_retries.max(1)
    }

    /// Sleep for `delay` unless cancelled first.
    async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
macro_rules! with_retries {
    ($self:ident, $cancel:ident, $what:literal, $op:expr) => {{
        let attempts = $self.attempts();
        let mut delay = $self.settings.initial_backoff;
        let mut attempt = 1;
        loop {
            match $op.await {
                Ok(value) => break Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        attempt,
                        attempts,
                        delay = ?delay,
                        error = %e,
                        operation = $what,
                        "transient failure, retrying"
                    );
                    Self::pause(delay, $cancel).await?;
                    delay = (delay * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

#[async_trait]
impl<G: Gen> Gen for Retrying<G> {
    async fn generate(&self, prompt: &Prompt, cancel: &CancellationToken) -> Result<String> {
        with_retries!(self, cancel, "generation", self.inner.generate(prompt, cancel))
    }

    /// Only opening the stream is retried; failures after the first chunk
    /// reach the consumer unchanged.
    async fn generate_stream(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream> {
        with_retries!(
            self,
            cancel,
            "stream open",
            self.inner.generate_stream(prompt, cancel)
        )
    }

    async fn count_tokens(
        &self,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        with_retries!(
            self,
            cancel,
            "token count",
            self.inner.count_tokens(prompt, cancel)
        )
    }

    fn status(&self) -> Status {
        self.inner.status()
    }
}
