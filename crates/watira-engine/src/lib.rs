pub mod adapter;
pub mod cache;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod mail;
pub mod orchestrator;
pub mod render;
pub mod tools;
pub mod truncate;

pub use adapter::{AdapterConfig, ModelAdapter, ModelEvent};
pub use cache::{Artifact, ArtifactCache, CacheConfig};
pub use dispatcher::{DispatchStatus, Dispatched, ToolDispatcher};
pub use error::{CacheError, TurnError};
pub use fingerprint::Fingerprint;
pub use mail::{DisabledMailbox, GmailConfig, GmailMailbox, Mailbox, MemoryMailbox};
pub use orchestrator::{Orchestrator, OrchestratorConfig, TurnInput, TurnOutcome, TurnState};
pub use render::{Renderer, SvgRenderer};
pub use tools::{create_default_dispatcher, SearchConfig, ToolDeps};
