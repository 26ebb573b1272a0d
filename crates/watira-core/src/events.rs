use serde::{Deserialize, Serialize};

use crate::ids::SessionId;
use crate::messages::TokenUsage;
use crate::tools::{ToolCall, ToolResult};

/// Live events delivered to the caller for one turn, in production order.
///
/// Every stream that reaches a consumer ends with exactly one `Done` or
/// `Error`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Session {
        session_id: SessionId,
        created: bool,
    },
    TokenDelta {
        delta: String,
    },
    ToolInvoked {
        call: ToolCall,
    },
    ToolResolved {
        result: ToolResult,
    },
    TurnComplete {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    Error {
        reason: ErrorReason,
        message: String,
    },
    Done {
        session_id: SessionId,
    },
}

/// Failure classification carried by `StreamEvent::Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    NotFound,
    ValidationFailure,
    TransientFailure,
    ToolLoopLimitExceeded,
    Timeout,
    ModelFailure,
    Internal,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ValidationFailure => "validation_failure",
            Self::TransientFailure => "transient_failure",
            Self::ToolLoopLimitExceeded => "tool_loop_limit_exceeded",
            Self::Timeout => "timeout",
            Self::ModelFailure => "model_failure",
            Self::Internal => "internal",
        }
    }
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::TokenDelta { .. } => "token_delta",
            Self::ToolInvoked { .. } => "tool_invoked",
            Self::ToolResolved { .. } => "tool_resolved",
            Self::TurnComplete { .. } => "turn_complete",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = StreamEvent::TokenDelta { delta: "hi".into() };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token_delta");
        assert_eq!(json["delta"], "hi");
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let events = vec![
            StreamEvent::Session { session_id: SessionId::new(), created: true },
            StreamEvent::TokenDelta { delta: String::new() },
            StreamEvent::ToolInvoked {
                call: ToolCall::new("read_email", serde_json::json!({})),
            },
            StreamEvent::TurnComplete { text: "x".into(), usage: None },
            StreamEvent::Error { reason: ErrorReason::Timeout, message: "slow".into() },
            StreamEvent::Done { session_id: SessionId::new() },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[test]
    fn error_reason_wire_names() {
        let json = serde_json::to_value(ErrorReason::ToolLoopLimitExceeded).unwrap();
        assert_eq!(json, "tool_loop_limit_exceeded");
        assert_eq!(ErrorReason::ToolLoopLimitExceeded.as_str(), "tool_loop_limit_exceeded");
    }

    #[test]
    fn only_done_and_error_are_terminal() {
        assert!(StreamEvent::Done { session_id: SessionId::new() }.is_terminal());
        assert!(StreamEvent::Error {
            reason: ErrorReason::Internal,
            message: String::new()
        }
        .is_terminal());
        assert!(!StreamEvent::TurnComplete { text: String::new(), usage: None }.is_terminal());
    }
}
