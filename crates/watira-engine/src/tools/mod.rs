pub mod read_email;
pub mod render_visual;
pub mod search_documents;
pub mod send_email;

use std::sync::Arc;
use std::time::Duration;

use watira_store::DispatchRepo;

use crate::cache::ArtifactCache;
use crate::dispatcher::ToolDispatcher;
use crate::mail::Mailbox;
use crate::render::Renderer;

pub use search_documents::SearchConfig;

/// Everything the built-in tools need from the rest of the process.
pub struct ToolDeps {
    pub cache: Arc<ArtifactCache>,
    pub mailbox: Arc<dyn Mailbox>,
    pub renderer: Arc<dyn Renderer>,
    pub default_recipient: Option<String>,
    pub search: SearchConfig,
    pub ledger: Option<DispatchRepo>,
    pub tool_timeout: Duration,
}

/// Create a ToolDispatcher with all built-in tools.
pub fn create_default_dispatcher(deps: ToolDeps) -> ToolDispatcher {
    let mut dispatcher = ToolDispatcher::new().with_tool_timeout(deps.tool_timeout);
    if let Some(ledger) = deps.ledger {
        dispatcher = dispatcher.with_ledger(ledger);
    }

    // Email
    dispatcher.register(Arc::new(send_email::SendEmailTool::new(
        Arc::clone(&deps.mailbox),
        Arc::clone(&deps.cache),
        deps.default_recipient,
    )));
    dispatcher.register(Arc::new(read_email::ReadEmailTool::new(deps.mailbox)));

    // Visuals
    dispatcher.register(Arc::new(render_visual::RenderVisualTool::new(
        Arc::clone(&deps.cache),
        deps.renderer,
    )));

    // Knowledge
    dispatcher.register(Arc::new(search_documents::SearchDocumentsTool::new(
        deps.search,
        deps.cache,
    )));

    dispatcher
}
