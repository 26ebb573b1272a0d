use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;
use crate::tools::{ArtifactRef, ToolCall, ToolResult};

/// Text substituted for rendered artifacts when history is replayed to the model.
pub const VISUAL_PLACEHOLDER: &str = "Here is the visual";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "user")]
    User(UserMessage),
    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),
    #[serde(rename = "tool_result")]
    ToolResult(ToolResultMessage),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<AssistantContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub is_error: bool,
    pub content: Vec<ToolResultContent>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AssistantContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_call")]
    ToolCall(ToolCall),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolResultContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "artifact")]
    Artifact(ArtifactRef),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    /// Generation was cut short by a disconnect; the text is partial.
    Interrupted,
}

/// Who produced a turn. Stored as a plain string column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One appended entry of a session's history. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub sequence: u64,
    pub role: Role,
    pub message: Message,
    pub created_at: DateTime<Utc>,
}

// --- Convenience constructors ---

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User(UserMessage { text: text.into() })
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Message::Assistant(AssistantMessage::text(text))
    }

    pub fn role(&self) -> Role {
        match self {
            Self::User(_) => Role::User,
            Self::Assistant(_) => Role::Assistant,
            Self::ToolResult(_) => Role::Tool,
        }
    }

    /// Build the tool turn recorded for a dispatched call.
    pub fn from_tool_result(tool_name: &str, result: &ToolResult) -> Self {
        let mut content = Vec::new();
        let text = if result.success {
            match &result.payload {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            }
        } else {
            result.error.clone().unwrap_or_else(|| "tool failed".into())
        };
        if !text.is_empty() {
            content.push(ToolResultContent::Text { text });
        }
        content.extend(result.artifacts.iter().cloned().map(ToolResultContent::Artifact));

        Message::ToolResult(ToolResultMessage {
            tool_call_id: result.call_id.clone(),
            tool_name: tool_name.to_string(),
            is_error: !result.success,
            content,
        })
    }

    /// Plain-text rendering used for titles and history listings.
    pub fn text(&self) -> String {
        match self {
            Self::User(m) => m.text.clone(),
            Self::Assistant(m) => m.text_content(),
            Self::ToolResult(m) => m.text_content(),
        }
    }
}

impl AssistantMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![AssistantContent::Text { text: text.into() }],
            usage: None,
            stop_reason: Some(StopReason::EndTurn),
        }
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|c| match c {
                AssistantContent::ToolCall(tc) => Some(tc),
                _ => None,
            })
            .collect()
    }

    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.content
            .iter()
            .any(|c| matches!(c, AssistantContent::ToolCall(_)))
    }
}

impl ToolResultMessage {
    /// Text seen by the model. Artifacts collapse to a placeholder.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolResultContent::Text { text } => text.clone(),
                ToolResultContent::Artifact(a) => {
                    format!("{VISUAL_PLACEHOLDER} ({})", a.fingerprint)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn user_text_message() {
        let msg = Message::user_text("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["text"], "hello");
        assert_eq!(msg.role(), Role::User);
    }

    #[test]
    fn assistant_text_message() {
        let msg = Message::assistant_text("world");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][0]["text"], "world");
    }

    #[test]
    fn assistant_tool_calls_extracted() {
        let call = ToolCall::new("send_email", serde_json::json!({"to": "x@y.com"}));
        let msg = AssistantMessage {
            content: vec![
                AssistantContent::Text { text: "sending".into() },
                AssistantContent::ToolCall(call.clone()),
            ],
            usage: None,
            stop_reason: Some(StopReason::ToolUse),
        };
        assert!(msg.has_tool_calls());
        assert_eq!(msg.tool_calls(), vec![&call]);
        assert_eq!(msg.text_content(), "sending");
    }

    #[test]
    fn tool_result_message_from_success() {
        let call_id = ToolCallId::new();
        let result = ToolResult::success(
            call_id.clone(),
            serde_json::json!({"status": "sent"}),
            Vec::new(),
            Duration::from_millis(5),
        );
        let msg = Message::from_tool_result("send_email", &result);
        let Message::ToolResult(tr) = &msg else {
            panic!("expected tool result");
        };
        assert_eq!(tr.tool_call_id, call_id);
        assert!(!tr.is_error);
        assert_eq!(tr.text_content(), r#"{"status":"sent"}"#);
        assert_eq!(msg.role(), Role::Tool);
    }

    #[test]
    fn tool_result_message_from_failure() {
        let result = ToolResult::failure(ToolCallId::new(), "unsupported tool: fly", Duration::ZERO);
        let msg = Message::from_tool_result("fly", &result);
        let Message::ToolResult(tr) = msg else {
            panic!("expected tool result");
        };
        assert!(tr.is_error);
        assert_eq!(tr.text_content(), "unsupported tool: fly");
    }

    #[test]
    fn artifacts_collapse_to_placeholder() {
        let msg = ToolResultMessage {
            tool_call_id: ToolCallId::new(),
            tool_name: "render_visual".into(),
            is_error: false,
            content: vec![ToolResultContent::Artifact(ArtifactRef {
                fingerprint: "abc123".into(),
                mime_type: "image/svg+xml".into(),
            })],
        };
        assert_eq!(msg.text_content(), "Here is the visual (abc123)");
    }

    #[test]
    fn role_display_and_parse() {
        for role in [Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
        }
        assert!("system".parse::<Role>().is_err());
    }
}
