use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;

use watira_core::context::ModelContext;
use watira_core::errors::GatewayError;
use watira_core::messages::{AssistantContent, AssistantMessage, StopReason};
use watira_core::provider::{GenerateOptions, ModelProvider, ProviderStream};
use watira_core::stream::ProviderEvent;
use watira_core::tools::ToolCall;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of ProviderEvents.
    Stream(Vec<ProviderEvent>),
    /// Yield events with a pause before each one.
    Paced(Duration, Vec<ProviderEvent>),
    /// Return an error from the stream() call itself.
    Error(GatewayError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A complete text reply delivered as a single delta.
    pub fn stream_text(text: &str) -> Self {
        Self::Stream(vec![
            ProviderEvent::Start,
            ProviderEvent::TextDelta {
                delta: text.to_string(),
            },
            ProviderEvent::Done {
                message: AssistantMessage::text(text),
                stop_reason: StopReason::EndTurn,
            },
        ])
    }

    /// A reply that requests the given tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        let mut events = vec![ProviderEvent::Start];
        events.extend(calls.iter().cloned().map(|tool_call| ProviderEvent::ToolCallEnd { tool_call }));
        events.push(ProviderEvent::Done {
            message: AssistantMessage {
                content: calls.into_iter().map(AssistantContent::ToolCall).collect(),
                usage: None,
                stop_reason: Some(StopReason::ToolUse),
            },
            stop_reason: StopReason::ToolUse,
        });
        Self::Stream(events)
    }

    /// A stream that ends with an error event.
    pub fn stream_error(error: GatewayError) -> Self {
        Self::Stream(vec![ProviderEvent::Start, ProviderEvent::Error { error }])
    }

    /// Wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
    contexts: Mutex<Vec<ModelContext>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Contexts received so far, in call order.
    pub fn contexts(&self) -> Vec<ModelContext> {
        self.contexts.lock().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(
        &self,
        context: &ModelContext,
        _options: &GenerateOptions,
    ) -> Result<ProviderStream, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.contexts.lock().push(context.clone());

        let next = self.responses.lock().pop_front();
        let Some(response) = next else {
            return Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, unrolling nested delays iteratively.
async fn resolve_response(response: MockResponse) -> Result<ProviderStream, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(events) => return Ok(Box::pin(stream::iter(events))),
            MockResponse::Paced(pause, events) => {
                let paced = stream::iter(events).then(move |event| async move {
                    tokio::time::sleep(pause).await;
                    event
                });
                return Ok(Box::pin(paced));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn text_response() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("hello world")]);
        let stream = mock
            .stream(&ModelContext::default(), &GenerateOptions::default())
            .await
            .unwrap();
        let events: Vec<ProviderEvent> = stream.collect().await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ProviderEvent::Start));
        assert!(matches!(&events[1], ProviderEvent::TextDelta { delta } if delta == "hello world"));
        assert!(matches!(events[2], ProviderEvent::Done { .. }));
    }

    #[tokio::test]
    async fn tool_call_response() {
        let call = ToolCall::new("read_email", serde_json::json!({}));
        let mock = MockProvider::new(vec![MockResponse::tool_calls(vec![call.clone()])]);
        let stream = mock
            .stream(&ModelContext::default(), &GenerateOptions::default())
            .await
            .unwrap();
        let events: Vec<ProviderEvent> = stream.collect().await;
        assert!(matches!(&events[1], ProviderEvent::ToolCallEnd { tool_call } if *tool_call == call));
        let ProviderEvent::Done { message, stop_reason } = &events[2] else {
            panic!("expected Done");
        };
        assert_eq!(*stop_reason, StopReason::ToolUse);
        assert_eq!(message.tool_calls(), vec![&call]);
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockProvider::new(vec![MockResponse::Error(
            GatewayError::AuthenticationFailed("bad".into()),
        )]);
        let result = mock
            .stream(&ModelContext::default(), &GenerateOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sequential_responses_and_recorded_contexts() {
        let mock = MockProvider::new(vec![
            MockResponse::stream_text("first"),
            MockResponse::stream_text("second"),
        ]);
        let ctx = ModelContext::new(vec![watira_core::Message::user_text("q")], Vec::new());

        assert!(mock.stream(&ctx, &GenerateOptions::default()).await.is_ok());
        assert_eq!(mock.call_count(), 1);
        assert!(mock.stream(&ctx, &GenerateOptions::default()).await.is_ok());
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.contexts().len(), 2);
        assert_eq!(mock.contexts()[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_responses() {
        let mock = MockProvider::new(vec![MockResponse::stream_text("only one")]);
        let _ = mock
            .stream(&ModelContext::default(), &GenerateOptions::default())
            .await;
        let result = mock
            .stream(&ModelContext::default(), &GenerateOptions::default())
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn provider_properties() {
        let mock = MockProvider::new(vec![]);
        assert_eq!(mock.name(), "mock");
        assert_eq!(mock.model(), "mock-model");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_response() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(50),
            MockResponse::stream_text("after delay"),
        )]);

        let start = tokio::time::Instant::now();
        let stream = mock
            .stream(&ModelContext::default(), &GenerateOptions::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));

        let events: Vec<ProviderEvent> = stream.collect().await;
        assert_eq!(events.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn paced_stream_waits_between_events() {
        let mock = MockProvider::new(vec![MockResponse::Paced(
            Duration::from_secs(1),
            vec![ProviderEvent::Start, ProviderEvent::TextDelta { delta: "x".into() }],
        )]);
        let start = tokio::time::Instant::now();
        let stream = mock
            .stream(&ModelContext::default(), &GenerateOptions::default())
            .await
            .unwrap();
        let events: Vec<ProviderEvent> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn delayed_error() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(20),
            MockResponse::Error(GatewayError::RateLimited { retry_after: None }),
        )]);
        let result = mock
            .stream(&ModelContext::default(), &GenerateOptions::default())
            .await;
        match result {
            Err(GatewayError::RateLimited { .. }) => {}
            Err(other) => panic!("expected RateLimited, got: {other:?}"),
            Ok(_) => panic!("expected error"),
        }
    }
}
