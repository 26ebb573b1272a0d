use serde::Deserialize;
use serde_json::Value;

use watira_core::errors::GatewayError;
use watira_core::messages::{AssistantContent, AssistantMessage, StopReason, TokenUsage};
use watira_core::stream::ProviderEvent;
use watira_core::tools::ToolCall;

/// Finish reasons that mean the provider refused to answer.
const BLOCKED_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "IMAGE_SAFETY",
];

/// State machine over `streamGenerateContent?alt=sse` chunks.
///
/// Each chunk is a full `GenerateContentResponse` carrying the next slice of
/// the candidate. Text parts are forwarded as deltas, function calls arrive
/// whole, and the chunk carrying `finishReason` closes the message.
pub struct GeminiSseParser {
    started: bool,
    finished: bool,
    text: String,
    tool_calls: Vec<ToolCall>,
    input_tokens: u32,
    output_tokens: u32,
}

impl Default for GeminiSseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl GeminiSseParser {
    pub fn new() -> Self {
        Self {
            started: false,
            finished: false,
            text: String::new(),
            tool_calls: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Parse one SSE `data:` payload into zero or more provider events.
    pub fn parse_chunk(&mut self, data: &str) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        if self.finished || data.trim().is_empty() {
            return events;
        }

        if !self.started {
            self.started = true;
            events.push(ProviderEvent::Start);
        }

        let chunk: ChunkPayload = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.finished = true;
                events.push(ProviderEvent::Error {
                    error: GatewayError::StreamInterrupted(format!("malformed chunk: {e}")),
                });
                return events;
            }
        };

        if let Some(err) = chunk.error {
            self.finished = true;
            events.push(ProviderEvent::Error {
                error: classify_error(&err),
            });
            return events;
        }

        if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
            self.finished = true;
            events.push(ProviderEvent::Error {
                error: GatewayError::Blocked(reason),
            });
            return events;
        }

        if let Some(usage) = chunk.usage_metadata {
            self.input_tokens = usage.prompt_token_count.unwrap_or(self.input_tokens);
            self.output_tokens = usage.candidates_token_count.unwrap_or(self.output_tokens);
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return events;
        };

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text {
                if !text.is_empty() {
                    self.text.push_str(&text);
                    events.push(ProviderEvent::TextDelta { delta: text });
                }
            }
            if let Some(fc) = part.function_call {
                let args = match fc.args {
                    Value::Null => Value::Object(serde_json::Map::new()),
                    other => other,
                };
                let tool_call = ToolCall::new(fc.name, args);
                self.tool_calls.push(tool_call.clone());
                events.push(ProviderEvent::ToolCallEnd { tool_call });
            }
        }

        if let Some(reason) = candidate.finish_reason {
            self.finished = true;
            events.push(self.finish(&reason));
        }

        events
    }

    pub fn token_usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }

    fn finish(&self, reason: &str) -> ProviderEvent {
        if BLOCKED_REASONS.contains(&reason) {
            return ProviderEvent::Error {
                error: GatewayError::Blocked(reason.to_string()),
            };
        }
        let stop_reason = match reason {
            _ if !self.tool_calls.is_empty() => StopReason::ToolUse,
            "STOP" => StopReason::EndTurn,
            "MAX_TOKENS" => StopReason::MaxTokens,
            other => {
                return ProviderEvent::Error {
                    error: GatewayError::InvalidRequest(format!(
                        "generation stopped: {other}"
                    )),
                }
            }
        };
        let message = self.build_assistant_message(stop_reason);
        ProviderEvent::Done {
            message,
            stop_reason,
        }
    }

    fn build_assistant_message(&self, stop_reason: StopReason) -> AssistantMessage {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(AssistantContent::Text {
                text: self.text.clone(),
            });
        }
        content.extend(self.tool_calls.iter().cloned().map(AssistantContent::ToolCall));

        AssistantMessage {
            content,
            usage: Some(self.token_usage()),
            stop_reason: Some(stop_reason),
        }
    }
}

fn classify_error(err: &ErrorPayload) -> GatewayError {
    match err.status.as_deref() {
        Some("RESOURCE_EXHAUSTED") => GatewayError::RateLimited { retry_after: None },
        Some("UNAVAILABLE") => GatewayError::Unavailable,
        _ => GatewayError::from_status(err.code.unwrap_or(500), err.message.clone()),
    }
}

/// Parse raw SSE text into (event_type, data) pairs. Frames without an
/// `event:` line are reported as `message`.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut data_lines: Vec<&str> = Vec::new();

    let mut flush = |event: &mut String, data: &mut Vec<&str>| {
        if !data.is_empty() {
            let name = if event.is_empty() { "message".to_string() } else { event.clone() };
            events.push((name, data.join("\n")));
        }
        event.clear();
        data.clear();
    };

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            flush(&mut current_event, &mut data_lines);
        } else if let Some(event) = line.strip_prefix("event:") {
            current_event = event.trim_start().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }

    // Trailing frame without blank line
    flush(&mut current_event, &mut data_lines);

    events
}

// --- Deserialization types for Gemini stream chunks ---

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ChunkPayload {
    #[serde(default)]
    candidates: Vec<CandidatePayload>,
    usage_metadata: Option<UsagePayload>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ErrorPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePayload {
    content: Option<ContentPayload>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ContentPayload {
    #[serde(default)]
    parts: Vec<PartPayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartPayload {
    text: Option<String>,
    function_call: Option<FunctionCallPayload>,
}

#[derive(Deserialize)]
struct FunctionCallPayload {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsagePayload {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    code: Option<u16>,
    #[serde(default)]
    message: String,
    status: Option<String>,
}
