//! Shared HTTP plumbing for the backend adapters.
//!
//! Every adapter sends JSON over `reqwest` and either reads a JSON body back
//! or consumes a line-oriented stream (SSE or NDJSON).  The helpers here make
//! both cancellable and map transport failures onto [`EngineError`].

use std::collections::VecDeque;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::llm::adapter::DeltaStream;
use crate::llm::types::StreamDelta;

/// Build the shared HTTP client.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::LlmRequestFailed {
            reason: format!("failed to build HTTP client: {e}"),
        })
}

/// Send `request`, racing it against `cancel`.  Non-success statuses are
/// turned into [`EngineError::LlmRequestFailed`] carrying the body text.
pub async fn send(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<reqwest::Response> {
    let resp = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        resp = request.send() => resp.map_err(|e| EngineError::LlmRequestFailed {
            reason: e.to_string(),
        })?,
    };

    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    Err(EngineError::LlmRequestFailed {
        reason: format!("API returned {status}: {text}"),
    })
}

/// Send `request` and parse the response body as JSON.
pub async fn send_for_json(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<Value> {
    let resp = send(request, cancel).await?;
    let text = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        text = resp.text() => text.map_err(|e| EngineError::LlmRequestFailed {
            reason: format!("failed to read response body: {e}"),
        })?,
    };
    serde_json::from_str(&text).map_err(|e| EngineError::LlmParseFailed {
        reason: format!("invalid JSON response: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Line streams
// ---------------------------------------------------------------------------

/// Turns one line of a streaming response into normalized deltas.
pub trait LineDecoder: Send + 'static {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamDelta>>;

    /// Deltas to emit once the body ends.
    fn finish(&mut self) -> Vec<StreamDelta> {
        Vec::new()
    }

    /// Whether the decoder saw an explicit end-of-stream marker.
    fn is_done(&self) -> bool {
        false
    }
}

struct LineState<D> {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<StreamDelta>,
    decoder: D,
    finished: bool,
    cancel: CancellationToken,
}

impl<D: LineDecoder> LineState<D> {
    fn decode(&mut self, raw: &[u8]) -> Result<()> {
        let text = std::str::from_utf8(raw).map_err(|e| EngineError::LlmStreamError {
            reason: format!("invalid UTF-8 in stream: {e}"),
        })?;
        let line = text.trim_end_matches(['\r', '\n']);
        self.pending.extend(self.decoder.decode_line(line)?);
        if self.decoder.is_done() {
            self.close();
        }
        Ok(())
    }

    fn close(&mut self) {
        self.finished = true;
        self.pending.extend(self.decoder.finish());
    }

    /// Read until at least one delta is pending or the body ends.
    async fn advance(&mut self) -> Result<()> {
        while self.pending.is_empty() && !self.finished {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                self.decode(&line)?;
                continue;
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
                next = self.bytes.next() => next,
            };

            match next {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    return Err(EngineError::LlmStreamError {
                        reason: format!("stream read error: {e}"),
                    });
                }
                None => {
                    let rest = std::mem::take(&mut self.buffer);
                    if !rest.is_empty() {
                        self.decode(&rest)?;
                    }
                    if !self.finished {
                        self.close();
                    }
                }
            }
        }
        Ok(())
    }
}

/// Decode a streaming response body line by line.
///
/// The stream ends after the body ends, after the decoder reports an
/// end-of-stream marker, or after the first error.
pub fn delta_stream<D: LineDecoder>(
    response: reqwest::Response,
    decoder: D,
    cancel: CancellationToken,
) -> DeltaStream {
    let state = LineState {
        bytes: response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()))
            .boxed(),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        decoder,
        finished: false,
        cancel,
    };

    stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        if let Err(e) = state.advance().await {
            return Some((Err(e), None));
        }
        let delta = state.pending.pop_front()?;
        Some((Ok(delta), Some(state)))
    })
    .boxed()
}
