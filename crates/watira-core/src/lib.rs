//! Shared domain types for the Watira workspace.
//!
//! Everything that crosses a crate boundary lives here: branded ids, the
//! conversation model, tool call/result types, the provider trait and both
//! event vocabularies (raw provider events and the wire `StreamEvent`).

pub mod context;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod stream;
pub mod tools;

pub use context::ModelContext;
pub use errors::GatewayError;
pub use events::{ErrorReason, StreamEvent};
pub use ids::{RunId, SessionId, ToolCallId};
pub use messages::{Message, Role, Turn};
pub use provider::{GenerateOptions, ModelProvider, ProviderHealth, ProviderStream};
pub use stream::ProviderEvent;
pub use tools::{Tool, ToolCall, ToolContext, ToolDefinition, ToolError, ToolResult};
