//! LM Studio adapter.
//!
//! LM Studio serves the OpenAI Chat Completions format on a local port with
//! no authentication.  Streamed tool-call arguments are correlated by call
//! id rather than by array index.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use tokio_util::sync::CancellationToken;

use super::openai::{ChatCompletions, Dialect};
use super::{header_value, require_model};
use crate::config::{LmStudioSettings, ModelDefaults};
use crate::error::Result;
use crate::init::LazyInit;
use crate::llm::adapter::{Adapter, DeltaStream};
use crate::llm::types::{ModelTurn, Status, TokenUsage, TurnRequest};

const PROVIDER: &str = "lmstudio";

pub struct LmStudioAdapter {
    settings: LmStudioSettings,
    defaults: ModelDefaults,
    timeout: Duration,
    connection: LazyInit<ChatCompletions>,
}

impl LmStudioAdapter {
    pub fn new(settings: LmStudioSettings, defaults: ModelDefaults, timeout: Duration) -> Self {
        Self {
            settings,
            defaults,
            timeout,
            connection: LazyInit::new(),
        }
    }

    fn connection(&self) -> Result<Arc<ChatCompletions>> {
        self.connection.get_or_init(PROVIDER, || {
            let mut headers = HeaderMap::new();
            if let Some(key) = &self.settings.api_key {
                headers.insert(
                    AUTHORIZATION,
                    header_value(PROVIDER, &format!("Bearer {}", key.expose()))?,
                );
            }
            ChatCompletions::new(
                PROVIDER,
                Dialect::LmStudio,
                &self.settings.base_url,
                headers,
                self.timeout,
            )
        })
    }
}

#[async_trait]
impl Adapter for LmStudioAdapter {
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
        require_model(PROVIDER, request.model, "qwen2.5-7b-instruct")?;
        self.connection()?.invoke(request, cancel).await
    }

    async fn stream(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<DeltaStream> {
        require_model(PROVIDER, request.model, "qwen2.5-7b-instruct")?;
        self.connection()?.stream(request, cancel).await
    }

    async fn count_tokens(
        &self,
        request: TurnRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TokenUsage> {
        require_model(PROVIDER, request.model, "qwen2.5-7b-instruct")?;
        self.connection()?.evaluate_prompt(request, cancel).await
    }

    fn status(&self) -> Status {
        let model = self.default_model();
        let (configured, message) = match self.connection() {
            Ok(_) => (
                true,
                format!("LM Studio configured (endpoint: {})", self.settings.base_url),
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
}
