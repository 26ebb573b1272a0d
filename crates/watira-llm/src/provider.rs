use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument, warn};

use watira_core::context::ModelContext;
use watira_core::errors::GatewayError;
use watira_core::provider::{GenerateOptions, ModelProvider, ProviderStream};
use watira_core::stream::ProviderEvent;

use crate::converter::{self, GenerationDefaults};
use crate::sse::{self, GeminiSseParser};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection settings for [`GeminiProvider`].
#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: SecretString,
    /// Time allowed for response headers to arrive.
    pub request_timeout: Duration,
    /// Maximum silence between stream chunks.
    pub idle_timeout: Duration,
    pub defaults: GenerationDefaults,
}

impl GeminiConfig {
    pub fn new(model: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            api_key,
            request_timeout: Duration::from_secs(40),
            idle_timeout: SSE_IDLE_TIMEOUT,
            defaults: GenerationDefaults::default(),
        }
    }
}

/// Streaming client for a Gemini-style `streamGenerateContent` endpoint.
pub struct GeminiProvider {
    client: Client,
    config: GeminiConfig,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }

    fn build_request(
        &self,
        context: &ModelContext,
        options: &GenerateOptions,
    ) -> reqwest::RequestBuilder {
        let body = converter::build_request_body(context, options, &self.config.defaults);
        self.client
            .post(self.endpoint())
            .header("x-goog-api-key", self.config.api_key.expose_secret())
            .header("accept", "text/event-stream")
            .json(&body)
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, context, options), fields(model = %self.config.model, messages = context.messages.len()))]
    async fn stream(
        &self,
        context: &ModelContext,
        options: &GenerateOptions,
    ) -> Result<ProviderStream, GatewayError> {
        let req = self.build_request(context, options);

        let resp = match tokio::time::timeout(self.config.request_timeout, req.send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(GatewayError::NetworkError(e.to_string())),
            Err(_) => return Err(GatewayError::Timeout(self.config.request_timeout)),
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            debug!(status, "provider returned error status");
            return Err(match GatewayError::from_status(status, body.clone()) {
                GatewayError::RateLimited { .. } => GatewayError::RateLimited {
                    retry_after: retry_after.or_else(|| retry_info_delay(&body)),
                },
                other => other,
            });
        }

        let stream = SseStream::with_idle_timeout(resp.bytes_stream(), self.config.idle_timeout);
        Ok(Box::pin(stream))
    }
}

/// Delay from a `google.rpc.RetryInfo` detail in an error body, e.g.
/// `{"error":{"details":[{"@type":"...RetryInfo","retryDelay":"12s"}]}}`.
fn retry_info_delay(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value["error"]["details"]
        .as_array()?
        .iter()
        .filter(|d| d["@type"].as_str().is_some_and(|t| t.ends_with("google.rpc.RetryInfo")))
        .find_map(|d| d["retryDelay"].as_str())
        .and_then(|raw| raw.strip_suffix('s'))
        .and_then(|secs| secs.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Wraps a byte stream from reqwest and yields ProviderEvents.
/// Emits an error if no data arrives within `idle_duration`.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: GeminiSseParser,
    /// Raw bytes; decoded only once a whole frame has arrived.
    buffer: BytesMut,
    pending: std::collections::VecDeque<ProviderEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    closed: bool,
}

impl SseStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: GeminiSseParser::new(),
            buffer: BytesMut::with_capacity(8192),
            pending: std::collections::VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            closed: false,
        }
    }

    fn drain_frames(&mut self, raw: &[u8]) {
        let text = match std::str::from_utf8(raw) {
            Ok(s) => s.replace("\r\n", "\n"),
            Err(e) => {
                warn!(error = %e, "skipping SSE frame with invalid UTF-8");
                return;
            }
        };
        for (_, data) in sse::parse_sse_lines(&text) {
            self.pending.extend(self.parser.parse_chunk(&data));
        }
    }

    /// Pop the next event, closing the stream after a terminal one.
    fn next_pending(&mut self) -> Option<ProviderEvent> {
        let event = self.pending.pop_front()?;
        if event.is_terminal() {
            self.closed = true;
            self.pending.clear();
        }
        Some(event)
    }
}

/// End offset of the first complete frame (blank line, `\n\n` or `\r\n\r\n`).
fn frame_end(buf: &[u8]) -> Option<usize> {
    buf.iter().enumerate().find_map(|(i, &b)| {
        if b != b'\n' {
            return None;
        }
        match &buf[i + 1..] {
            [b'\n', ..] => Some(i + 2),
            [b'\r', b'\n', ..] => Some(i + 3),
            _ => None,
        }
    })
}

impl Stream for SseStream {
    type Item = ProviderEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.next_pending() {
            return Poll::Ready(Some(event));
        }
        if self.closed {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    self.buffer.extend_from_slice(&bytes);
                    while let Some(end) = frame_end(&self.buffer) {
                        let frame = self.buffer.split_to(end);
                        self.drain_frames(&frame);
                    }

                    if let Some(event) = self.next_pending() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.closed = true;
                    return Poll::Ready(Some(ProviderEvent::Error {
                        error: GatewayError::StreamInterrupted(e.to_string()),
                    }));
                }
                Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let remaining = self.buffer.split();
                        self.drain_frames(&remaining);
                    }
                    self.closed = true;
                    // A missing Done is reported by the consumer, not here.
                    return Poll::Ready(self.next_pending());
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.closed = true;
                        return Poll::Ready(Some(ProviderEvent::Error {
                            error: GatewayError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
