use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use watira_engine::{ArtifactCache, Orchestrator};
use watira_telemetry::SqliteLogSink;

use crate::handlers;
use crate::runs::{self, ActiveRuns};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Time allowed to produce response headers. SSE bodies are not bounded.
    pub request_timeout_secs: u64,
    pub keep_alive_secs: u64,
    /// Capacity of each turn's event channel.
    pub event_buffer: usize,
    pub idle_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            request_timeout_secs: 30,
            keep_alive_secs: 15,
            event_buffer: 64,
            idle_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub cache: Arc<ArtifactCache>,
    pub runs: Arc<ActiveRuns>,
    pub config: Arc<ServerConfig>,
    /// Persisted warn+ logs, present when SQLite logging is on.
    pub logs: Option<Arc<SqliteLogSink>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, cache: Arc<ArtifactCache>, config: ServerConfig) -> Self {
        Self {
            orchestrator,
            cache,
            runs: Arc::new(ActiveRuns::new()),
            config: Arc::new(config),
            logs: None,
        }
    }

    pub fn with_logs(mut self, logs: Option<Arc<SqliteLogSink>>) -> Self {
        self.logs = logs;
        self
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.request_timeout_secs);
    Router::new()
        .route("/health", get(handlers::health))
        .route("/chat", post(handlers::chat))
        .route("/conversations", get(handlers::list_conversations))
        .route(
            "/conversations/{id}",
            get(handlers::get_conversation)
                .put(handlers::rename_conversation)
                .delete(handlers::delete_conversation),
        )
        .route("/conversations/{id}/abort", post(handlers::abort_conversation))
        .route("/artifacts/{fingerprint}", get(handlers::get_artifact))
        .route("/logs", get(handlers::list_logs))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, start serving and launch the idle-session sweeper.
pub async fn start(state: AppState) -> Result<ServerHandle, std::io::Error> {
    let config = Arc::clone(&state.config);
    let runs = Arc::clone(&state.runs);

    let sweeper = runs::start_sweeper(
        Arc::clone(state.orchestrator.sessions()),
        Arc::clone(&runs),
        config.idle_ttl,
        config.sweep_interval,
    );

    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "Watira server started");

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        runs,
        shutdown,
        server,
        sweeper,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    runs: Arc<ActiveRuns>,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Cancel in-flight turns, stop accepting connections and wait for the
    /// server task to finish.
    pub async fn shutdown(self) {
        self.runs.abort_all();
        self.shutdown.cancel();
        self.sweeper.abort();
        let _ = self.server.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watira_core::tools::ToolCall;
    use watira_engine::{
        create_default_dispatcher, AdapterConfig, CacheConfig, MemoryMailbox, ModelAdapter,
        OrchestratorConfig, SearchConfig, SvgRenderer, ToolDeps,
    };
    use watira_llm::{MockProvider, MockResponse, ReliableProvider};
    use watira_store::{Database, SessionRepo};

    async fn start_with(responses: Vec<MockResponse>) -> (ServerHandle, AppState, Arc<MemoryMailbox>) {
        start_with_logs(responses, None).await
    }

    async fn start_with_logs(
        responses: Vec<MockResponse>,
        logs: Option<Arc<SqliteLogSink>>,
    ) -> (ServerHandle, AppState, Arc<MemoryMailbox>) {
        let db = Database::in_memory().unwrap();
        let sessions = Arc::new(SessionRepo::new(db));
        let cache = Arc::new(ArtifactCache::new(CacheConfig::default()));
        let mailbox = Arc::new(MemoryMailbox::new());
        let dispatcher = create_default_dispatcher(ToolDeps {
            cache: Arc::clone(&cache),
            mailbox: mailbox.clone(),
            renderer: Arc::new(SvgRenderer::default()),
            default_recipient: Some("me@example.com".into()),
            search: SearchConfig::default(),
            ledger: None,
            tool_timeout: Duration::from_secs(5),
        });
        let provider = ReliableProvider::with_defaults(MockProvider::new(responses));
        let adapter = ModelAdapter::new(Arc::new(provider), AdapterConfig::default());
        let orchestrator = Arc::new(Orchestrator::new(
            sessions,
            adapter,
            Arc::new(dispatcher),
            OrchestratorConfig::default(),
        ));

        let state = AppState::new(
            orchestrator,
            cache,
            ServerConfig {
                host: "127.0.0.1".into(),
                port: 0, // Random port
                ..Default::default()
            },
        )
        .with_logs(logs);
        let handle = start(state.clone()).await.unwrap();
        (handle, state, mailbox)
    }

    fn url(handle: &ServerHandle, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", handle.port)
    }

    /// Event names in order, from a complete SSE body.
    fn event_names(body: &str) -> Vec<String> {
        body.lines()
            .filter_map(|l| l.strip_prefix("event: ").or_else(|| l.strip_prefix("event:")))
            .map(|s| s.trim().to_string())
            .collect()
    }

    fn event_data(body: &str, name: &str) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        let mut current = None;
        for line in body.lines() {
            if let Some(ev) = line.strip_prefix("event:") {
                current = Some(ev.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                if current.as_deref() == Some(name) {
                    out.push(serde_json::from_str(data.trim()).unwrap());
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let (handle, _, _) = start_with(vec![]).await;
        assert!(handle.port > 0);

        let resp = reqwest::get(url(&handle, "/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["activeRuns"], 0);
        assert_eq!(body["model"]["circuit"], "closed");
        assert_eq!(body["model"]["consecutiveFailures"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn chat_streams_a_complete_turn() {
        let (handle, state, _) = start_with(vec![MockResponse::stream_text("Hi there!")]).await;

        let resp = reqwest::Client::new()
            .post(url(&handle, "/chat"))
            .json(&json!({"message": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        let body = resp.text().await.unwrap();

        let names = event_names(&body);
        assert_eq!(names.first().map(String::as_str), Some("session"));
        assert!(names.iter().any(|n| n == "token_delta"));
        assert_eq!(names.iter().filter(|n| *n == "turn_complete").count(), 1);
        assert_eq!(names.last().map(String::as_str), Some("done"));

        let session = &event_data(&body, "session")[0];
        assert_eq!(session["created"], true);
        let id = session["session_id"].as_str().unwrap().to_string();

        let convo: serde_json::Value = reqwest::get(url(&handle, &format!("/conversations/{id}")))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(convo["turns"].as_array().unwrap().len(), 2);
        assert_eq!(convo["title"], "hello");

        assert_eq!(state.runs.count(), 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn chat_with_tool_call_sends_email() {
        let (handle, _, mailbox) = start_with(vec![
            MockResponse::tool_calls(vec![ToolCall::new(
                "send_email",
                json!({"subject": "Report", "body": "Attached."}),
            )]),
            MockResponse::stream_text("Sent it."),
        ])
        .await;

        let body = reqwest::Client::new()
            .post(url(&handle, "/chat"))
            .json(&json!({"message": "email me the report"}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        let names = event_names(&body);
        assert!(names.iter().any(|n| n == "tool_invoked"));
        assert!(names.iter().any(|n| n == "tool_resolved"));
        assert_eq!(names.last().map(String::as_str), Some("done"));
        assert_eq!(mailbox.sent().len(), 1);
        assert_eq!(mailbox.sent()[0].to, "me@example.com");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn empty_message_rejected_without_session() {
        let (handle, state, _) = start_with(vec![]).await;

        let resp = reqwest::Client::new()
            .post(url(&handle, "/chat"))
            .json(&json!({"message": "   "}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"error": "empty message"}));
        assert!(state.orchestrator.sessions().list(10, 0).unwrap().is_empty());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let (handle, _, _) = start_with(vec![]).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(url(&handle, "/chat"))
            .json(&json!({"session_id": "sess_missing", "message": "hi"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client.get(url(&handle, "/conversations/sess_missing")).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(url(&handle, "/conversations/sess_missing/abort"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn conversation_rename_list_delete() {
        let (handle, state, _) = start_with(vec![]).await;
        let client = reqwest::Client::new();
        let record = state.orchestrator.sessions().create("first").unwrap();

        let resp = client
            .put(url(&handle, &format!("/conversations/{}", record.id)))
            .json(&json!({"title": "Renamed"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let renamed: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(renamed["title"], "Renamed");

        let list: serde_json::Value = client
            .get(url(&handle, "/conversations"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list["conversations"].as_array().unwrap().len(), 1);

        // an in-flight turn blocks deletion
        let guard = state.runs.start(record.id.clone(), CancellationToken::new());
        let resp = client
            .delete(url(&handle, &format!("/conversations/{}", record.id)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        drop(guard);

        let resp = client
            .delete(url(&handle, &format!("/conversations/{}", record.id)))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
        assert!(state.orchestrator.sessions().get(&record.id).is_err());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn abort_cancels_in_flight_run() {
        let (handle, state, _) = start_with(vec![]).await;
        let record = state.orchestrator.sessions().create("busy").unwrap();
        let token = CancellationToken::new();
        let _guard = state.runs.start(record.id.clone(), token.clone());

        let body: serde_json::Value = reqwest::Client::new()
            .post(url(&handle, &format!("/conversations/{}/abort", record.id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["aborted"], 1);
        assert!(token.is_cancelled());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn serves_rendered_artifacts() {
        let (handle, _, _) = start_with(vec![
            MockResponse::tool_calls(vec![ToolCall::new(
                "render_visual",
                json!({"kind": "bar_chart", "labels": ["a", "b"], "values": [1, 2]}),
            )]),
            MockResponse::stream_text("Here you go."),
        ])
        .await;
        let client = reqwest::Client::new();

        let body = client
            .post(url(&handle, "/chat"))
            .json(&json!({"message": "chart please"}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let resolved = &event_data(&body, "tool_resolved")[0];
        let artifact_url = resolved["result"]["payload"]["url"].as_str().unwrap().to_string();

        let resp = client.get(url(&handle, &artifact_url)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()["content-type"], "image/svg+xml");
        assert!(resp.text().await.unwrap().starts_with("<svg"));

        let resp = client.get(url(&handle, "/artifacts/not-a-fingerprint")).send().await.unwrap();
        assert_eq!(resp.status(), 400);
        let resp = client
            .get(url(&handle, &format!("/artifacts/{}", "0".repeat(64))))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn logs_route_filters_persisted_warnings() {
        use tracing_subscriber::layer::SubscriberExt;
        use watira_telemetry::SqliteLogLayer;

        let path = std::env::temp_dir()
            .join(format!("watira-server-logs-{}", watira_core::RunId::new()))
            .join("logs.db");
        let sink = Arc::new(SqliteLogSink::new(&path).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("turn", session_id = "sess_logs");
            let _enter = span.enter();
            tracing::warn!(attempt = 1u64, "append retry");
            tracing::error!("turn failed");
        });

        let (handle, _, _) = start_with_logs(vec![], Some(sink)).await;

        let body: serde_json::Value = reqwest::get(url(&handle, "/logs?session_id=sess_logs&level=error"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let logs = body["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["message"], "turn failed");
        assert_eq!(logs[0]["session_id"], "sess_logs");

        let body: serde_json::Value = reqwest::get(url(&handle, "/logs?limit=1"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["logs"].as_array().unwrap().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn logs_route_is_404_without_persistence() {
        let (handle, _, _) = start_with(vec![]).await;
        let resp = reqwest::get(url(&handle, "/logs")).await.unwrap();
        assert_eq!(resp.status(), 404);
        handle.shutdown().await;
    }
}
