use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use watira_core::context::ModelContext;
use watira_core::errors::GatewayError;
use watira_core::messages::{AssistantContent, AssistantMessage, Message};
use watira_core::provider::{GenerateOptions, ModelProvider, ProviderHealth, ProviderStream};
use watira_core::stream::ProviderEvent;
use watira_core::tools::{ToolCall, ToolDefinition};

/// Normalized output of one model generation.
///
/// A stream yields any number of `TokenDelta`s followed by exactly one of the
/// other variants, then ends.
#[derive(Clone, Debug)]
pub enum ModelEvent {
    TokenDelta(String),
    ToolInvoked {
        message: AssistantMessage,
        calls: Vec<ToolCall>,
    },
    TurnComplete {
        message: AssistantMessage,
    },
    Error(GatewayError),
}

impl ModelEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::TokenDelta(_))
    }
}

pub type ModelStream = Pin<Box<dyn Stream<Item = ModelEvent> + Send>>;

#[derive(Clone, Debug)]
pub struct AdapterConfig {
    pub system_prompt: Option<String>,
    pub options: GenerateOptions,
    /// Covers the whole generation, from opening the stream to its last event.
    pub deadline: Duration,
    /// Re-invocations after a transient failure, only while nothing has been
    /// streamed yet.
    pub retries: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            options: GenerateOptions::default(),
            deadline: Duration::from_secs(120),
            retries: 1,
        }
    }
}

pub struct ModelAdapter {
    provider: Arc<dyn ModelProvider>,
    config: AdapterConfig,
}

impl ModelAdapter {
    pub fn new(provider: Arc<dyn ModelProvider>, config: AdapterConfig) -> Self {
        Self { provider, config }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn provider_health(&self) -> Option<ProviderHealth> {
        self.provider.health()
    }

    /// Start a generation over `history`. Nothing is sent until the returned
    /// stream is first polled.
    pub fn generate(
        &self,
        history: Vec<Message>,
        tools: Vec<ToolDefinition>,
        cancel: CancellationToken,
    ) -> ModelStream {
        let mut context = ModelContext::new(history, tools);
        context.system_prompt = self.config.system_prompt.clone();

        let generation = Generation {
            provider: Arc::clone(&self.provider),
            options: self.config.options.clone(),
            context,
            inner: None,
            timeout: self.config.deadline,
            deadline: None,
            cancel,
            retries_left: self.config.retries,
            emitted: false,
            seen_calls: Vec::new(),
            finished: false,
        };

        Box::pin(futures::stream::unfold(generation, |mut generation| async move {
            let event = generation.next_event().await?;
            Some((event, generation))
        }))
    }
}

struct Generation {
    provider: Arc<dyn ModelProvider>,
    options: GenerateOptions,
    context: ModelContext,
    inner: Option<ProviderStream>,
    timeout: Duration,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    retries_left: u32,
    emitted: bool,
    seen_calls: Vec<ToolCall>,
    finished: bool,
}

impl Generation {
    async fn next_event(&mut self) -> Option<ModelEvent> {
        if self.finished {
            return None;
        }
        let timeout = self.timeout;
        let deadline = *self.deadline.get_or_insert_with(|| Instant::now() + timeout);
        let cancel = self.cancel.clone();

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => ModelEvent::Error(GatewayError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => ModelEvent::Error(GatewayError::Timeout(timeout)),
            event = self.advance() => event,
        };

        if event.is_terminal() {
            self.finished = true;
            self.inner = None;
        } else {
            self.emitted = true;
        }
        Some(event)
    }

    async fn advance(&mut self) -> ModelEvent {
        loop {
            let error = match self.pull().await {
                Ok(Some(event)) => return event,
                Ok(None) => continue,
                Err(error) => error,
            };
            if self.emitted || self.retries_left == 0 || !error.is_retryable() {
                return ModelEvent::Error(error);
            }
            self.retries_left -= 1;
            warn!(
                error = %error,
                kind = error.error_kind(),
                "model stream failed before any output, re-invoking"
            );
            self.inner = None;
            self.seen_calls.clear();
        }
    }

    /// One step of the provider stream. `Ok(None)` means the raw event
    /// carried nothing for the caller.
    async fn pull(&mut self) -> Result<Option<ModelEvent>, GatewayError> {
        if self.inner.is_none() {
            let stream = self.provider.stream(&self.context, &self.options).await?;
            debug!(provider = self.provider.name(), "model stream opened");
            self.inner = Some(stream);
        }
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };

        match inner.next().await {
            Some(ProviderEvent::Start) => Ok(None),
            Some(ProviderEvent::TextDelta { delta }) if delta.is_empty() => Ok(None),
            Some(ProviderEvent::TextDelta { delta }) => Ok(Some(ModelEvent::TokenDelta(delta))),
            Some(ProviderEvent::ToolCallEnd { tool_call }) => {
                self.seen_calls.push(tool_call);
                Ok(None)
            }
            Some(ProviderEvent::Done { mut message, .. }) => {
                if message.tool_calls().is_empty() && !self.seen_calls.is_empty() {
                    message.content.extend(
                        std::mem::take(&mut self.seen_calls)
                            .into_iter()
                            .map(AssistantContent::ToolCall),
                    );
                }
                let calls: Vec<ToolCall> = message.tool_calls().into_iter().cloned().collect();
                if calls.is_empty() {
                    Ok(Some(ModelEvent::TurnComplete { message }))
                } else {
                    Ok(Some(ModelEvent::ToolInvoked { message, calls }))
                }
            }
            Some(ProviderEvent::Error { error }) => Err(error),
            None => Err(GatewayError::StreamInterrupted(
                "provider stream ended without completion".into(),
            )),
        }
    }
}
