use crate::errors::GatewayError;
use crate::messages::{AssistantMessage, StopReason};
use crate::tools::ToolCall;

/// Raw events emitted by a provider stream. Ordering contract:
///
/// Start → (TextDelta | ToolCallEnd)* → Done
///
/// Error may end the stream at any point.
#[derive(Clone, Debug)]
pub enum ProviderEvent {
    Start,
    TextDelta { delta: String },
    ToolCallEnd { tool_call: ToolCall },
    Done { message: AssistantMessage, stop_reason: StopReason },
    Error { error: GatewayError },
}

impl ProviderEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
