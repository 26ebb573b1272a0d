use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use watira_core::errors::GatewayError;
use watira_core::events::StreamEvent;
use watira_core::messages::{AssistantContent, AssistantMessage, Message, StopReason, Turn};
use watira_core::provider::ProviderHealth;
use watira_core::tools::{ToolCall, ToolContext, ToolResult};
use watira_core::{RunId, SessionId};
use watira_store::SessionRepo;

use crate::adapter::{ModelAdapter, ModelEvent};
use crate::dispatcher::{DispatchStatus, ToolDispatcher};
use crate::error::TurnError;

/// Lifecycle of one user turn.
///
/// `Idle → Generating → {ToolPending → Generating}* → Completing → Done`.
/// `Errored` and `Cancelled` are reachable from every non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Generating,
    ToolPending,
    Completing,
    Done,
    Errored,
    Cancelled,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Idle, Generating)
            | (Generating, ToolPending)
            | (Generating, Completing)
            | (ToolPending, Generating)
            | (Completing, Done) => true,
            (from, Errored | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Tool calls dispatched per user turn before the turn errors.
    pub max_tool_round_trips: u32,
    /// Turns of history sent to the model.
    pub history_window: usize,
    pub append_retries: u32,
    pub append_retry_delay: Duration,
    pub title_max_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_round_trips: 5,
            history_window: 20,
            append_retries: 3,
            append_retry_delay: Duration::from_millis(100),
            title_max_chars: 50,
        }
    }
}

/// Everything needed to run one turn on an already resolved session.
#[derive(Clone, Debug)]
pub struct TurnInput {
    pub session_id: SessionId,
    /// Whether the session was created for this turn.
    pub created: bool,
    pub run_id: RunId,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub state: TurnState,
    /// Every state the turn passed through, starting with `Idle`.
    pub trace: Vec<TurnState>,
    pub tool_calls: u32,
}

pub struct Orchestrator {
    sessions: Arc<SessionRepo>,
    adapter: ModelAdapter,
    dispatcher: Arc<ToolDispatcher>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionRepo>,
        adapter: ModelAdapter,
        dispatcher: Arc<ToolDispatcher>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            sessions,
            adapter,
            dispatcher,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRepo> {
        &self.sessions
    }

    pub fn model_health(&self) -> Option<ProviderHealth> {
        self.adapter.provider_health()
    }

    /// Resolve the session a turn runs on, creating one titled after the
    /// first message when no id is given.
    pub fn open_session(
        &self,
        session_id: Option<&SessionId>,
        first_message: &str,
    ) -> Result<(SessionId, bool), TurnError> {
        match session_id {
            Some(id) => match self.sessions.get(id) {
                Ok(record) => Ok((record.id, false)),
                Err(e) if e.is_not_found() => Err(TurnError::SessionNotFound(id.clone())),
                Err(e) => Err(e.into()),
            },
            None => {
                let title = derive_title(first_message, self.config.title_max_chars);
                let record = self.sessions.create(&title)?;
                Ok((record.id, true))
            }
        }
    }

    /// Run one turn to completion, streaming events into `events`.
    ///
    /// Exactly one `done` or `error` event is sent unless the turn is
    /// cancelled, in which case neither is. Dropping the receiver cancels the
    /// turn.
    #[instrument(skip_all, fields(session_id = %input.session_id, run_id = %input.run_id))]
    pub async fn run_turn(
        &self,
        input: TurnInput,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let watcher = {
            let events = events.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = events.closed() => cancel.cancel(),
                    _ = cancel.cancelled() => {}
                }
            })
        };

        let mut run = TurnRun {
            session_id: input.session_id.clone(),
            run_id: input.run_id.clone(),
            state: TurnState::Idle,
            trace: vec![TurnState::Idle],
            tool_calls: 0,
            partial: String::new(),
            events,
            cancel: cancel.clone(),
        };

        run.emit(StreamEvent::Session {
            session_id: input.session_id.clone(),
            created: input.created,
        })
        .await;

        let result = self.drive(&mut run, input.message).await;
        match result {
            Ok(()) => {
                run.transition(TurnState::Done);
                info!(tool_calls = run.tool_calls, "turn complete");
                run.emit(StreamEvent::Done {
                    session_id: run.session_id.clone(),
                })
                .await;
            }
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                self.persist_interrupted(&mut run).await;
                run.transition(TurnState::Cancelled);
                info!("turn cancelled");
            }
            Err(e) => {
                run.transition(TurnState::Errored);
                let reason = e.reason();
                warn!(error = %e, reason = reason.as_str(), "turn failed");
                run.emit(StreamEvent::Error {
                    reason,
                    message: e.to_string(),
                })
                .await;
            }
        }

        watcher.abort();
        TurnOutcome {
            state: run.state,
            trace: run.trace,
            tool_calls: run.tool_calls,
        }
    }

    async fn drive(&self, run: &mut TurnRun, message: String) -> Result<(), TurnError> {
        run.transition(TurnState::Generating);
        self.append(&run.session_id, &Message::user_text(message)).await?;
        let tools = self.dispatcher.definitions();

        loop {
            let history = self.history(&run.session_id)?;
            let mut stream = self
                .adapter
                .generate(history, tools.clone(), run.cancel.child_token());

            let terminal = loop {
                match stream.next().await {
                    Some(ModelEvent::TokenDelta(delta)) => {
                        run.partial.push_str(&delta);
                        run.emit(StreamEvent::TokenDelta { delta }).await;
                    }
                    Some(event) => break event,
                    None => {
                        break ModelEvent::Error(GatewayError::StreamInterrupted(
                            "model stream ended without a terminal event".into(),
                        ))
                    }
                }
            };

            match terminal {
                ModelEvent::TurnComplete { message } => {
                    run.transition(TurnState::Completing);
                    let text = message.text_content();
                    let usage = message.usage.clone();
                    self.append(&run.session_id, &Message::Assistant(message)).await?;
                    run.partial.clear();
                    run.emit(StreamEvent::TurnComplete { text, usage }).await;
                    return Ok(());
                }
                ModelEvent::ToolInvoked { message, calls } => {
                    run.transition(TurnState::ToolPending);
                    self.append(&run.session_id, &Message::Assistant(message)).await?;
                    run.partial.clear();
                    self.resolve_calls(run, &calls).await?;
                    run.transition(TurnState::Generating);
                }
                ModelEvent::Error(e) => return Err(e.into()),
                ModelEvent::TokenDelta(_) => {
                    return Err(TurnError::Internal("unexpected token after terminal".into()))
                }
            }
        }
    }

    /// Dispatch each call in order, appending one tool turn per call. Calls
    /// that are never dispatched still get a closing tool turn so history
    /// stays well formed.
    async fn resolve_calls(&self, run: &mut TurnRun, calls: &[ToolCall]) -> Result<(), TurnError> {
        let limit = self.config.max_tool_round_trips;
        for (i, call) in calls.iter().enumerate() {
            if run.cancel.is_cancelled() {
                self.close_out(run, &calls[i..], "cancelled").await?;
                return Err(TurnError::Cancelled);
            }
            if run.tool_calls >= limit {
                warn!(limit, tool = %call.name, "tool loop limit reached");
                self.close_out(run, &calls[i..], "tool loop limit exceeded").await?;
                return Err(TurnError::ToolLoopLimitExceeded(limit));
            }

            run.emit(StreamEvent::ToolInvoked { call: call.clone() }).await;
            run.tool_calls += 1;
            let ctx = ToolContext {
                session_id: run.session_id.clone(),
                run_id: run.run_id.clone(),
                cancel: run.cancel.child_token(),
            };
            let dispatched = self.dispatcher.dispatch(call, &ctx).await;
            debug!(tool = %call.name, status = ?dispatched.status, success = dispatched.result.success, "tool resolved");

            self.append(&run.session_id, &Message::from_tool_result(&call.name, &dispatched.result))
                .await?;
            match dispatched.status {
                DispatchStatus::Cancelled => {
                    self.close_out(run, &calls[i + 1..], "cancelled").await?;
                    return Err(TurnError::Cancelled);
                }
                DispatchStatus::TimedOut => {
                    run.emit(StreamEvent::ToolResolved {
                        result: dispatched.result,
                    })
                    .await;
                    self.close_out(run, &calls[i + 1..], "cancelled").await?;
                    return Err(TurnError::Timeout {
                        what: "tool call",
                        after: self.dispatcher.tool_timeout(),
                    });
                }
                DispatchStatus::Completed | DispatchStatus::Replayed => {
                    run.emit(StreamEvent::ToolResolved {
                        result: dispatched.result,
                    })
                    .await;
                }
            }
        }
        Ok(())
    }

    async fn close_out(&self, run: &TurnRun, calls: &[ToolCall], detail: &str) -> Result<(), TurnError> {
        for call in calls {
            let result = ToolResult::failure(call.id.clone(), detail, Duration::ZERO);
            self.append(&run.session_id, &Message::from_tool_result(&call.name, &result))
                .await?;
        }
        Ok(())
    }

    /// Keep whatever text streamed before a cancellation.
    async fn persist_interrupted(&self, run: &mut TurnRun) {
        if run.partial.is_empty() {
            return;
        }
        let message = Message::Assistant(AssistantMessage {
            content: vec![AssistantContent::Text {
                text: std::mem::take(&mut run.partial),
            }],
            usage: None,
            stop_reason: Some(StopReason::Interrupted),
        });
        if let Err(e) = self.append(&run.session_id, &message).await {
            warn!(error = %e, "failed to persist interrupted reply");
        }
    }

    fn history(&self, session_id: &SessionId) -> Result<Vec<Message>, TurnError> {
        let turns = self
            .sessions
            .recent_turns(session_id, self.config.history_window)?;
        Ok(turns.into_iter().map(|t| t.message).collect())
    }

    /// Append with bounded retries on transient store errors. A failed
    /// append leaves nothing behind.
    async fn append(&self, session_id: &SessionId, message: &Message) -> Result<Turn, TurnError> {
        let mut attempt = 0;
        loop {
            match self.sessions.append(session_id, message) {
                Ok(turn) => return Ok(turn),
                Err(e) if e.is_transient() && attempt < self.config.append_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "transient append failure, retrying");
                    tokio::time::sleep(self.config.append_retry_delay * attempt).await;
                }
                Err(e) if e.is_not_found() => {
                    return Err(TurnError::SessionNotFound(session_id.clone()))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

struct TurnRun {
    session_id: SessionId,
    run_id: RunId,
    state: TurnState,
    trace: Vec<TurnState>,
    tool_calls: u32,
    /// Text streamed since the last persisted assistant turn.
    partial: String,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl TurnRun {
    fn transition(&mut self, next: TurnState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {next:?}",
            self.state
        );
        debug!(from = ?self.state, to = ?next, "turn state");
        self.state = next;
        self.trace.push(next);
    }

    async fn emit(&mut self, event: StreamEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event consumer gone, cancelling turn");
            self.cancel.cancel();
        }
    }
}

/// Session title: the trimmed first message, cut to `max_chars` characters
/// with `...` appended when it was longer.
pub fn derive_title(message: &str, max_chars: usize) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut title: String = trimmed.chars().take(max_chars).collect();
    title.push_str("...");
    title
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use watira_core::events::ErrorReason;
    use watira_core::messages::Role;
    use watira_core::tools::{Tool, ToolError, ToolOutput};
    use watira_llm::{MockProvider, MockResponse};
    use watira_store::Database;

    use crate::adapter::AdapterConfig;

    struct FakeSendEmail {
        sent: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl Tool for FakeSendEmail {
        fn name(&self) -> &str {
            "send_email"
        }
        fn description(&self) -> &str {
            "Send an email"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(self.delay).await;
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::json(json!({"status": "sent"})))
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        mock: Arc<MockProvider>,
        sent: Arc<AtomicUsize>,
    }

    fn harness(responses: Vec<MockResponse>, config: OrchestratorConfig, tool_delay: Duration) -> Harness {
        harness_on(Database::in_memory().unwrap(), responses, config, tool_delay)
    }

    fn harness_on(
        db: Database,
        responses: Vec<MockResponse>,
        config: OrchestratorConfig,
        tool_delay: Duration,
    ) -> Harness {
        let sessions = Arc::new(SessionRepo::new(db));
        let mock = Arc::new(MockProvider::new(responses));
        let adapter = ModelAdapter::new(mock.clone(), AdapterConfig::default());
        let sent = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = ToolDispatcher::new().with_tool_timeout(Duration::from_secs(5));
        dispatcher.register(Arc::new(FakeSendEmail {
            sent: Arc::clone(&sent),
            delay: tool_delay,
        }));
        Harness {
            orchestrator: Orchestrator::new(sessions, adapter, Arc::new(dispatcher), config),
            mock,
            sent,
        }
    }

    async fn run(h: &Harness, session_id: Option<&SessionId>, message: &str) -> (TurnOutcome, Vec<StreamEvent>, SessionId) {
        let (id, created) = h.orchestrator.open_session(session_id, message).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let input = TurnInput {
            session_id: id.clone(),
            created,
            run_id: RunId::new(),
            message: message.to_string(),
        };
        let outcome = h.orchestrator.run_turn(input, tx, CancellationToken::new()).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (outcome, events, id)
    }

    fn roles(h: &Harness, id: &SessionId) -> Vec<Role> {
        let session = h.orchestrator.sessions().load(id).unwrap();
        session.turns.iter().map(|t| t.role).collect()
    }

    fn terminal_count(events: &[StreamEvent]) -> usize {
        events.iter().filter(|e| e.is_terminal()).count()
    }

    #[tokio::test]
    async fn hello_turn() {
        let h = harness(
            vec![MockResponse::stream_text("Hello! How can I help?")],
            OrchestratorConfig::default(),
            Duration::ZERO,
        );
        let (outcome, events, id) = run(&h, None, "hello").await;

        assert_eq!(outcome.state, TurnState::Done);
        assert_eq!(
            outcome.trace,
            vec![TurnState::Idle, TurnState::Generating, TurnState::Completing, TurnState::Done]
        );
        assert!(matches!(&events[0], StreamEvent::Session { created: true, .. }));
        assert!(matches!(&events[1], StreamEvent::TokenDelta { delta } if delta == "Hello! How can I help?"));
        assert!(matches!(&events[2], StreamEvent::TurnComplete { text, .. } if text == "Hello! How can I help?"));
        assert!(matches!(&events[3], StreamEvent::Done { session_id } if *session_id == id));
        assert_eq!(terminal_count(&events), 1);

        assert_eq!(roles(&h, &id), vec![Role::User, Role::Assistant]);
        let session = h.orchestrator.sessions().load(&id).unwrap();
        assert_eq!(session.record.title, "hello");
        assert_eq!(session.turns[0].sequence, 0);
        assert_eq!(session.turns[1].sequence, 1);
    }

    #[tokio::test]
    async fn send_email_turn() {
        let call = ToolCall::new("send_email", json!({"subject": "Hi", "body": "Hello"}));
        let h = harness(
            vec![
                MockResponse::tool_calls(vec![call.clone()]),
                MockResponse::stream_text("Your email has been sent."),
            ],
            OrchestratorConfig::default(),
            Duration::ZERO,
        );
        let (outcome, events, id) = run(&h, None, "email my manager").await;

        assert_eq!(outcome.state, TurnState::Done);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(
            outcome.trace,
            vec![
                TurnState::Idle,
                TurnState::Generating,
                TurnState::ToolPending,
                TurnState::Generating,
                TurnState::Completing,
                TurnState::Done
            ]
        );
        assert_eq!(h.sent.load(Ordering::SeqCst), 1);

        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            kinds,
            vec!["session", "tool_invoked", "tool_resolved", "token_delta", "turn_complete", "done"]
        );
        assert_eq!(
            roles(&h, &id),
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );

        // Second model call saw the tool result.
        let contexts = h.mock.contexts();
        assert_eq!(contexts[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn tool_loop_limit_stops_before_sixth_dispatch() {
        let mut responses: Vec<MockResponse> = (0..6)
            .map(|_| MockResponse::tool_calls(vec![ToolCall::new("send_email", json!({}))]))
            .collect();
        responses.push(MockResponse::stream_text("never reached"));
        let h = harness(responses, OrchestratorConfig::default(), Duration::ZERO);

        let (outcome, events, id) = run(&h, None, "spam").await;

        assert_eq!(outcome.state, TurnState::Errored);
        assert_eq!(outcome.tool_calls, 5);
        assert_eq!(h.sent.load(Ordering::SeqCst), 5);
        assert_eq!(h.mock.call_count(), 6);
        assert_eq!(invoked_count(&events), 5);
        let last = events.last().unwrap();
        assert!(matches!(
            last,
            StreamEvent::Error { reason: ErrorReason::ToolLoopLimitExceeded, .. }
        ));
        assert_eq!(terminal_count(&events), 1);

        // The sixth call is closed out without running.
        let session = h.orchestrator.sessions().load(&id).unwrap();
        let Message::ToolResult(last_turn) = &session.turns.last().unwrap().message else {
            panic!("expected a closing tool result");
        };
        assert!(last_turn.is_error);
        assert_eq!(last_turn.content.len(), 1);
    }

    #[tokio::test]
    async fn model_failure_is_single_error_event() {
        let h = harness(
            vec![MockResponse::Error(GatewayError::AuthenticationFailed("bad key".into()))],
            OrchestratorConfig::default(),
            Duration::ZERO,
        );
        let (outcome, events, id) = run(&h, None, "hi").await;

        assert_eq!(outcome.state, TurnState::Errored);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { reason: ErrorReason::ModelFailure, .. })
        ));
        assert_eq!(terminal_count(&events), 1);
        assert_eq!(roles(&h, &id), vec![Role::User]);
    }

    #[tokio::test]
    async fn existing_session_keeps_history() {
        let h = harness(
            vec![MockResponse::stream_text("first"), MockResponse::stream_text("second")],
            OrchestratorConfig::default(),
            Duration::ZERO,
        );
        let (_, _, id) = run(&h, None, "one").await;
        let (outcome, events, same) = run(&h, Some(&id), "two").await;

        assert_eq!(same, id);
        assert_eq!(outcome.state, TurnState::Done);
        assert!(matches!(&events[0], StreamEvent::Session { created: false, .. }));
        assert_eq!(roles(&h, &id).len(), 4);
        assert_eq!(h.mock.contexts()[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let h = harness(Vec::new(), OrchestratorConfig::default(), Duration::ZERO);
        let missing = SessionId::new();
        let err = h.orchestrator.open_session(Some(&missing), "hi").unwrap_err();
        assert!(matches!(err, TurnError::SessionNotFound(_)));
        assert_eq!(err.reason(), ErrorReason::NotFound);
    }

    #[tokio::test]
    async fn session_deleted_mid_turn_errors_once() {
        let h = harness(
            vec![MockResponse::delayed(
                Duration::from_millis(50),
                MockResponse::stream_text("too late"),
            )],
            OrchestratorConfig::default(),
            Duration::ZERO,
        );
        let (id, created) = h.orchestrator.open_session(None, "hi").unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let input = TurnInput {
            session_id: id.clone(),
            created,
            run_id: RunId::new(),
            message: "hi".into(),
        };

        let sessions = Arc::clone(h.orchestrator.sessions());
        let turn = h.orchestrator.run_turn(input, tx, CancellationToken::new());
        let deleter = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sessions.delete(&id).unwrap();
        };
        let (outcome, ()) = tokio::join!(turn, deleter);

        assert_eq!(outcome.state, TurnState::Errored);
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(terminal_count(&events), 1);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { reason: ErrorReason::NotFound, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_generating_keeps_partial_text() {
        let h = harness(
            vec![MockResponse::Paced(
                Duration::from_secs(1),
                vec![
                    watira_core::ProviderEvent::Start,
                    watira_core::ProviderEvent::TextDelta { delta: "Par".into() },
                    watira_core::ProviderEvent::TextDelta { delta: "tial".into() },
                    watira_core::ProviderEvent::TextDelta { delta: " never".into() },
                ],
            )],
            OrchestratorConfig::default(),
            Duration::ZERO,
        );
        let (id, created) = h.orchestrator.open_session(None, "write a poem").unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let input = TurnInput {
            session_id: id.clone(),
            created,
            run_id: RunId::new(),
            message: "write a poem".into(),
        };

        let turn = h.orchestrator.run_turn(input, tx, cancel.clone());
        let canceller = async {
            let mut seen = 0;
            while let Some(event) = rx.recv().await {
                if matches!(event, StreamEvent::TokenDelta { .. }) {
                    seen += 1;
                    if seen == 2 {
                        cancel.cancel();
                    }
                }
                assert!(!event.is_terminal(), "cancelled turn sent {event:?}");
            }
        };
        let (outcome, ()) = tokio::join!(turn, canceller);

        assert_eq!(outcome.state, TurnState::Cancelled);
        let session = h.orchestrator.sessions().load(&id).unwrap();
        assert_eq!(session.turns.len(), 2);
        let Message::Assistant(reply) = &session.turns[1].message else {
            panic!("expected interrupted assistant turn");
        };
        assert_eq!(reply.text_content(), "Partial");
        assert_eq!(reply.stop_reason, Some(StopReason::Interrupted));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_tool_closes_out_calls() {
        let first = ToolCall::new("send_email", json!({}));
        let second = ToolCall::new("send_email", json!({}));
        let h = harness(
            vec![MockResponse::tool_calls(vec![first, second])],
            OrchestratorConfig::default(),
            Duration::from_secs(3),
        );
        let (id, created) = h.orchestrator.open_session(None, "send two").unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let input = TurnInput {
            session_id: id.clone(),
            created,
            run_id: RunId::new(),
            message: "send two".into(),
        };

        let turn = h.orchestrator.run_turn(input, tx, cancel.clone());
        let canceller = async {
            while let Some(event) = rx.recv().await {
                if matches!(event, StreamEvent::ToolInvoked { .. }) {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    cancel.cancel();
                }
            }
        };
        let (outcome, ()) = tokio::join!(turn, canceller);

        assert_eq!(outcome.state, TurnState::Cancelled);
        assert_eq!(h.sent.load(Ordering::SeqCst), 0);
        assert_eq!(
            roles(&h, &id),
            vec![Role::User, Role::Assistant, Role::Tool, Role::Tool]
        );
        let session = h.orchestrator.sessions().load(&id).unwrap();
        for turn in &session.turns[2..] {
            assert_eq!(turn.message.text(), "cancelled");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_consumer_cancels_turn() {
        let h = harness(
            vec![MockResponse::Paced(
                Duration::from_secs(1),
                vec![
                    watira_core::ProviderEvent::Start,
                    watira_core::ProviderEvent::TextDelta { delta: "a".into() },
                    watira_core::ProviderEvent::TextDelta { delta: "b".into() },
                ],
            )],
            OrchestratorConfig::default(),
            Duration::ZERO,
        );
        let (id, created) = h.orchestrator.open_session(None, "hi").unwrap();
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let input = TurnInput {
            session_id: id,
            created,
            run_id: RunId::new(),
            message: "hi".into(),
        };
        let outcome = h.orchestrator.run_turn(input, tx, CancellationToken::new()).await;
        assert_eq!(outcome.state, TurnState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn tool_timeout_errors_turn() {
        let h = harness(
            vec![MockResponse::tool_calls(vec![ToolCall::new("send_email", json!({}))])],
            OrchestratorConfig::default(),
            Duration::from_secs(60),
        );
        let (outcome, events, _) = run(&h, None, "slow").await;
        assert_eq!(outcome.state, TurnState::Errored);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { reason: ErrorReason::Timeout, .. })
        ));
        assert_eq!(terminal_count(&events), 1);
    }

    fn invoked_count(events: &[StreamEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ToolInvoked { .. }))
            .count()
    }

    #[tokio::test]
    async fn calls_past_the_limit_are_never_announced() {
        let calls = vec![
            ToolCall::new("send_email", json!({"to": "a"})),
            ToolCall::new("send_email", json!({"to": "b"})),
        ];
        let config = OrchestratorConfig {
            max_tool_round_trips: 1,
            ..Default::default()
        };
        let h = harness(vec![MockResponse::tool_calls(calls)], config, Duration::ZERO);

        let (outcome, events, id) = run(&h, None, "send both").await;

        assert_eq!(outcome.state, TurnState::Errored);
        assert_eq!(h.sent.load(Ordering::SeqCst), 1);
        assert_eq!(invoked_count(&events), 1);
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds, vec!["session", "tool_invoked", "tool_resolved", "error"]);
        assert_eq!(
            roles(&h, &id),
            vec![Role::User, Role::Assistant, Role::Tool, Role::Tool]
        );
    }

    /// File-backed harness whose store fails fast when another connection
    /// holds the write lock.
    fn locked_harness(config: OrchestratorConfig) -> (Harness, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("watira-append-{}", uuid::Uuid::now_v7()));
        let path = dir.join("watira.db");
        let db = Database::open(&path).unwrap();
        db.with_conn(|c| Ok(c.busy_timeout(Duration::ZERO)?)).unwrap();
        let h = harness_on(
            db,
            vec![MockResponse::stream_text("stored")],
            config,
            Duration::ZERO,
        );
        (h, path)
    }

    fn hold_write_lock(path: &std::path::Path) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        conn
    }

    async fn run_opened(h: &Harness, id: &SessionId, created: bool, message: &str) -> (TurnOutcome, Vec<StreamEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let input = TurnInput {
            session_id: id.clone(),
            created,
            run_id: RunId::new(),
            message: message.to_string(),
        };
        let outcome = h.orchestrator.run_turn(input, tx, CancellationToken::new()).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn exhausted_append_retries_end_in_one_error() {
        let config = OrchestratorConfig {
            append_retries: 2,
            append_retry_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let (h, path) = locked_harness(config);
        let (id, created) = h.orchestrator.open_session(None, "hello").unwrap();

        let locker = hold_write_lock(&path);
        let (outcome, events) = run_opened(&h, &id, created, "hello").await;
        locker.execute_batch("ROLLBACK").unwrap();

        assert_eq!(outcome.state, TurnState::Errored);
        assert_eq!(terminal_count(&events), 1);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Error { reason: ErrorReason::TransientFailure, .. })
        ));
        assert_eq!(h.mock.call_count(), 0);
        assert!(roles(&h, &id).is_empty());
    }

    #[tokio::test]
    async fn append_recovers_once_the_lock_clears() {
        let config = OrchestratorConfig {
            append_retries: 5,
            append_retry_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let (h, path) = locked_harness(config);
        let (id, created) = h.orchestrator.open_session(None, "hello").unwrap();

        let locker = hold_write_lock(&path);
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            locker.execute_batch("ROLLBACK").unwrap();
        });
        let (outcome, events) = run_opened(&h, &id, created, "hello").await;
        release.join().unwrap();

        assert_eq!(outcome.state, TurnState::Done);
        assert_eq!(terminal_count(&events), 1);
        assert_eq!(roles(&h, &id), vec![Role::User, Role::Assistant]);
    }

    #[test]
    fn transitions() {
        use TurnState::*;
        assert!(Idle.can_transition_to(Generating));
        assert!(Generating.can_transition_to(ToolPending));
        assert!(ToolPending.can_transition_to(Generating));
        assert!(Completing.can_transition_to(Done));
        assert!(ToolPending.can_transition_to(Errored));
        assert!(Idle.can_transition_to(Cancelled));
        assert!(!Done.can_transition_to(Errored));
        assert!(!Idle.can_transition_to(Completing));
        assert!(!ToolPending.can_transition_to(Completing));
    }

    #[test]
    fn titles() {
        assert_eq!(derive_title("  hello  ", 50), "hello");
        let long = "a".repeat(60);
        assert_eq!(derive_title(&long, 50), format!("{}...", "a".repeat(50)));
        assert_eq!(derive_title(&"é".repeat(51), 50).chars().count(), 53);
    }
}
