use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::{RunId, SessionId, ToolCallId};

/// A model-requested action. `id` correlates the request with its result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            arguments,
        }
    }
}

/// Pointer to a cached artifact produced by a tool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub fingerprint: String,
    pub mime_type: String,
}

/// What a handler returns on success.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    pub payload: serde_json::Value,
    pub artifacts: Vec<ArtifactRef>,
}

impl ToolOutput {
    pub fn json(payload: serde_json::Value) -> Self {
        Self {
            payload,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// Structured outcome of a dispatched call, paired 1:1 with its `ToolCall`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: ToolCallId,
    pub success: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolResult {
    pub fn success(
        call_id: ToolCallId,
        payload: serde_json::Value,
        artifacts: Vec<ArtifactRef>,
        duration: Duration,
    ) -> Self {
        Self {
            call_id,
            success: true,
            payload,
            error: None,
            artifacts,
            duration,
        }
    }

    pub fn failure(call_id: ToolCallId, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            call_id,
            success: false,
            payload: serde_json::Value::Null,
            error: Some(error.into()),
            artifacts: Vec::new(),
            duration,
        }
    }
}

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub cancel: CancellationToken,
}

/// Tool schema declared to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Implemented by each capability the dispatcher can route to.
///
/// Handlers must validate `args` fully before performing any external side
/// effect and report problems as [`ToolError::InvalidArguments`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("{0}")]
    Disabled(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    /// Parse `args` into a typed argument struct, mapping serde errors.
    pub fn parse_args<T: serde::de::DeserializeOwned>(
        args: serde_json::Value,
    ) -> Result<T, ToolError> {
        serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
    }
}

/// Serde helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
