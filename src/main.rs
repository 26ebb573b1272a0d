use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use watira_core::provider::GenerateOptions;
use watira_engine::{
    create_default_dispatcher, AdapterConfig, ArtifactCache, CacheConfig, DisabledMailbox,
    GmailConfig, GmailMailbox, Mailbox, ModelAdapter, Orchestrator, OrchestratorConfig,
    SearchConfig, SvgRenderer, ToolDeps,
};
use watira_llm::converter::GenerationDefaults;
use watira_llm::{GeminiConfig, GeminiProvider, ReliableConfig, ReliableProvider};
use watira_server::{AppState, ServerConfig};
use watira_settings::WatiraSettings;
use watira_store::{ArtifactRepo, Database, DispatchRepo, SessionRepo};
use watira_telemetry::{LogFormat, TelemetryConfig};

const MODEL_API_KEY_ENV: &str = "WATIRA_MODEL_API_KEY";
const EMAIL_TOKEN_ENV: &str = "WATIRA_EMAIL_TOKEN";
const SEARCH_TOKEN_ENV: &str = "WATIRA_SEARCH_TOKEN";

/// Streaming conversational gateway.
#[derive(Debug, Parser)]
#[command(name = "watira", version, about)]
struct Cli {
    /// Settings file (default: ~/.watira/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database file.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => watira_settings::load_settings_from_path(path),
        None => watira_settings::load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(db) = &cli.db {
        settings.database.path = db.display().to_string();
    }
    watira_settings::init_settings(settings).context("failed to install settings")?;
    let settings = watira_settings::get_settings();

    let telemetry = watira_telemetry::init_telemetry(telemetry_config(settings));
    tracing::info!("Starting Watira server");

    let db_path = watira_settings::resolve_path(&settings.database.path);
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let provider = model_provider(settings)?;
    let mailbox = mailbox(settings)?;

    let mut cache = ArtifactCache::new(cache_config(settings));
    if settings.cache.persist {
        cache = cache.with_repo(ArtifactRepo::new(db.clone()));
    }
    let cache = Arc::new(cache);

    let dispatcher = create_default_dispatcher(ToolDeps {
        cache: Arc::clone(&cache),
        mailbox,
        renderer: Arc::new(SvgRenderer::default()),
        default_recipient: settings.email.default_recipient.clone(),
        search: search_config(settings),
        ledger: Some(DispatchRepo::new(db.clone())),
        tool_timeout: Duration::from_millis(settings.orchestrator.tool_timeout_ms),
    });
    tracing::info!(tools = ?dispatcher.names(), "tools registered");

    let adapter = ModelAdapter::new(
        provider,
        AdapterConfig {
            system_prompt: settings.model.system_prompt.clone(),
            options: GenerateOptions {
                max_output_tokens: Some(settings.model.max_output_tokens),
                temperature: Some(settings.model.temperature),
                ..Default::default()
            },
            deadline: Duration::from_millis(settings.orchestrator.model_timeout_ms),
            retries: settings.orchestrator.model_retries,
        },
    );

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(SessionRepo::new(db)),
        adapter,
        Arc::new(dispatcher),
        OrchestratorConfig {
            max_tool_round_trips: settings.orchestrator.max_tool_round_trips,
            history_window: settings.orchestrator.history_window,
            append_retries: settings.orchestrator.append_retries,
            append_retry_delay: Duration::from_millis(settings.orchestrator.append_retry_delay_ms),
            title_max_chars: settings.sessions.title_max_chars,
        },
    ));

    let server_config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        request_timeout_secs: settings.server.request_timeout_secs,
        keep_alive_secs: settings.server.keep_alive_secs,
        event_buffer: settings.server.event_buffer,
        idle_ttl: Duration::from_secs(settings.sessions.idle_ttl_secs),
        sweep_interval: Duration::from_secs(settings.sessions.sweep_interval_secs),
    };
    let state = AppState::new(orchestrator, cache, server_config).with_logs(telemetry.logs());
    let handle = watira_server::start(state)
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "Watira server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

fn telemetry_config(settings: &WatiraSettings) -> TelemetryConfig {
    TelemetryConfig {
        log_level: settings.logging.level.parse().unwrap_or(Level::INFO),
        format: match settings.logging.format.as_str() {
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Json,
        },
        log_to_sqlite: settings.logging.log_to_sqlite,
        log_db_path: watira_settings::resolve_path("database/logs.db"),
        ..Default::default()
    }
}

fn model_provider(
    settings: &WatiraSettings,
) -> anyhow::Result<Arc<dyn watira_core::ModelProvider>> {
    let api_key = std::env::var(MODEL_API_KEY_ENV)
        .with_context(|| format!("{MODEL_API_KEY_ENV} is not set"))?;
    let model = &settings.model;

    let gemini = GeminiProvider::new(GeminiConfig {
        base_url: model.base_url.clone(),
        request_timeout: Duration::from_millis(model.request_timeout_ms),
        idle_timeout: Duration::from_millis(model.idle_timeout_ms),
        defaults: GenerationDefaults {
            max_output_tokens: model.max_output_tokens,
            temperature: model.temperature,
        },
        ..GeminiConfig::new(model.model.clone(), SecretString::from(api_key))
    })?;

    let reliable = ReliableProvider::new(
        gemini,
        ReliableConfig {
            max_retries: model.max_retries,
            base_delay: Duration::from_millis(model.base_retry_delay_ms),
            circuit_breaker_threshold: model.circuit_breaker_threshold,
            circuit_breaker_cooldown: Duration::from_millis(model.circuit_breaker_cooldown_ms),
            ..Default::default()
        },
    );
    tracing::info!(model = %model.model, "model provider configured");
    Ok(Arc::new(reliable))
}

fn mailbox(settings: &WatiraSettings) -> anyhow::Result<Arc<dyn Mailbox>> {
    let email = &settings.email;
    if !email.enabled {
        tracing::info!("email disabled");
        return Ok(Arc::new(DisabledMailbox));
    }
    let Ok(token) = std::env::var(EMAIL_TOKEN_ENV) else {
        tracing::warn!("email enabled but {EMAIL_TOKEN_ENV} is not set; email disabled");
        return Ok(Arc::new(DisabledMailbox));
    };
    let gmail = GmailMailbox::new(GmailConfig {
        api_base: email.api_base.clone(),
        token: SecretString::from(token),
        sender: email.sender.clone(),
        timeout: Duration::from_millis(email.timeout_ms),
    })?;
    Ok(Arc::new(gmail))
}

fn search_config(settings: &WatiraSettings) -> SearchConfig {
    let search = &settings.search;
    SearchConfig {
        endpoint: search.enabled.then(|| search.endpoint.clone()).flatten(),
        token: std::env::var(SEARCH_TOKEN_ENV).ok().map(SecretString::from),
        page_size: search.page_size,
        timeout: Duration::from_millis(search.timeout_ms),
    }
}

fn cache_config(settings: &WatiraSettings) -> CacheConfig {
    let cache = &settings.cache;
    CacheConfig {
        max_entries: cache.max_entries,
        max_bytes: usize::try_from(cache.max_bytes).unwrap_or(usize::MAX),
        max_age: (cache.max_age_secs > 0).then(|| Duration::from_secs(cache.max_age_secs)),
        compute_timeout: Duration::from_millis(cache.compute_timeout_ms),
        persisted_max_entries: cache.persisted_max_entries,
    }
}
