use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::OnceCell;
use tracing::{debug, error, instrument, warn};

use watira_core::tools::{Tool, ToolCall, ToolContext, ToolDefinition, ToolError, ToolResult};
use watira_core::ToolCallId;
use watira_store::DispatchRepo;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// How a dispatch ended. Failures of the tool itself are `Completed` with an
/// unsuccessful result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchStatus {
    Completed,
    /// Served from the ledger without running the handler.
    Replayed,
    TimedOut,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct Dispatched {
    pub result: ToolResult,
    pub status: DispatchStatus,
}

type Slot = Arc<OnceCell<Dispatched>>;

/// Routes tool calls to handlers by name.
///
/// The handler table is fixed once the dispatcher is shared. Invocation never
/// fails outward: unknown tools, invalid arguments, handler errors, panics
/// and timeouts all come back as unsuccessful [`ToolResult`]s.
pub struct ToolDispatcher {
    handlers: HashMap<String, Arc<dyn Tool>>,
    ledger: Option<DispatchRepo>,
    inflight: DashMap<ToolCallId, Slot>,
    tool_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            ledger: None,
            inflight: DashMap::new(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Record successful results so a replayed call id is answered without
    /// repeating the side effect.
    pub fn with_ledger(mut self, ledger: DispatchRepo) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.handlers.insert(name, tool);
    }

    pub fn tool_timeout(&self) -> Duration {
        self.tool_timeout
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Declarations sent to the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.handlers.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn invoke(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        self.dispatch(call, ctx).await.result
    }

    /// Invoke with the outcome classification the orchestrator needs.
    #[instrument(skip_all, fields(tool = %call.name, call_id = %call.id))]
    pub async fn dispatch(&self, call: &ToolCall, ctx: &ToolContext) -> Dispatched {
        if let Some(result) = self.recorded(&call.id) {
            debug!("replaying recorded result");
            return Dispatched {
                result,
                status: DispatchStatus::Replayed,
            };
        }

        let slot: Slot = Arc::clone(self.inflight.entry(call.id.clone()).or_default().value());
        let mut ran = false;
        let ran_flag = &mut ran;
        let dispatched = slot
            .get_or_init(|| async move {
                // Another caller may have finished and recorded this id
                // between the check above and taking the slot.
                if let Some(result) = self.recorded(&call.id) {
                    return Dispatched {
                        result,
                        status: DispatchStatus::Replayed,
                    };
                }
                *ran_flag = true;
                self.execute(call, ctx).await
            })
            .await
            .clone();

        if ran && dispatched.result.success {
            self.record(ctx, call, &dispatched.result);
        }
        // Without a ledger the completed slot is the only record of a success.
        if !dispatched.result.success || self.ledger.is_some() {
            self.inflight.remove_if(&call.id, |_, current| Arc::ptr_eq(current, &slot));
        }

        if ran {
            dispatched
        } else {
            Dispatched {
                status: DispatchStatus::Replayed,
                ..dispatched
            }
        }
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Dispatched {
        let start = Instant::now();
        let Some(tool) = self.handlers.get(&call.name) else {
            warn!(tool = %call.name, "unsupported tool requested");
            return completed(ToolResult::failure(
                call.id.clone(),
                format!("unsupported tool: {}", call.name),
                start.elapsed(),
            ));
        };

        let run = AssertUnwindSafe(tool.execute(call.arguments.clone(), ctx)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            r = tokio::time::timeout(self.tool_timeout, run) => Some(r),
        };
        let duration = start.elapsed();

        match outcome {
            Some(Ok(Ok(Ok(output)))) => completed(ToolResult::success(
                call.id.clone(),
                output.payload,
                output.artifacts,
                duration,
            )),
            Some(Ok(Ok(Err(ToolError::Cancelled)))) | None => Dispatched {
                result: ToolResult::failure(call.id.clone(), "cancelled", duration),
                status: DispatchStatus::Cancelled,
            },
            Some(Ok(Ok(Err(e)))) => {
                debug!(error = %e, "tool returned error");
                completed(ToolResult::failure(call.id.clone(), e.to_string(), duration))
            }
            Some(Ok(Err(panic))) => {
                error!(
                    tool = %call.name,
                    panic = %panic_message(&panic),
                    "tool panicked during execution"
                );
                completed(ToolResult::failure(
                    call.id.clone(),
                    "internal error: tool crashed",
                    duration,
                ))
            }
            Some(Err(_)) => {
                warn!(
                    tool = %call.name,
                    timeout_secs = self.tool_timeout.as_secs(),
                    "tool timed out"
                );
                Dispatched {
                    result: ToolResult::failure(
                        call.id.clone(),
                        format!("tool timed out after {}s", self.tool_timeout.as_secs()),
                        duration,
                    ),
                    status: DispatchStatus::TimedOut,
                }
            }
        }
    }

    fn recorded(&self, call_id: &ToolCallId) -> Option<ToolResult> {
        let ledger = self.ledger.as_ref()?;
        match ledger.get(call_id) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "dispatch ledger read failed");
                None
            }
        }
    }

    fn record(&self, ctx: &ToolContext, call: &ToolCall, result: &ToolResult) {
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.record(&ctx.session_id, &call.name, result) {
                warn!(error = %e, "dispatch ledger write failed");
            }
        }
    }
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn completed(result: ToolResult) -> Dispatched {
    Dispatched {
        result,
        status: DispatchStatus::Completed,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
