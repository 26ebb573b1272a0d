//! Settings type definitions.
//!
//! Every section is `#[serde(rename_all = "camelCase", default)]`, so a
//! settings file only needs the keys it changes.

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// { "server": { "port": 9100 }, "orchestrator": { "maxToolRoundTrips": 3 } }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatiraSettings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub model: ModelSettings,
    pub orchestrator: OrchestratorSettings,
    pub sessions: SessionSettings,
    pub cache: CacheSettings,
    pub email: EmailSettings,
    pub search: SearchSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Timeout for non-streaming requests.
    pub request_timeout_secs: u64,
    /// Interval between SSE keep-alive comments.
    pub keep_alive_secs: u64,
    /// Buffered events per turn before the producer waits on the client.
    pub event_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9091,
            request_timeout_secs: 30,
            keep_alive_secs: 15,
            event_buffer: 64,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// SQLite file path. Relative paths resolve against `~/.watira`.
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: "database/watira.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    pub base_url: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f64,
    /// Connect/response timeout on the HTTP client.
    pub request_timeout_ms: u64,
    /// Maximum silence between streamed chunks.
    pub idle_timeout_ms: u64,
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.0-flash".to_string(),
            max_output_tokens: 8192,
            temperature: 0.4,
            request_timeout_ms: 40_000,
            idle_timeout_ms: 60_000,
            max_retries: 3,
            base_retry_delay_ms: 1_000,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 30_000,
            system_prompt: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorSettings {
    /// Tool calls dispatched per turn before the turn fails.
    pub max_tool_round_trips: u32,
    /// Deadline for one model generation, first byte to last.
    pub model_timeout_ms: u64,
    /// Deadline for one tool dispatch.
    pub tool_timeout_ms: u64,
    /// Most recent turns replayed to the model.
    pub history_window: usize,
    /// Extra attempts for a session append that fails transiently.
    pub append_retries: u32,
    pub append_retry_delay_ms: u64,
    /// Re-invocations of the model after a retryable failure with no output.
    pub model_retries: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_tool_round_trips: 5,
            model_timeout_ms: 120_000,
            tool_timeout_ms: 60_000,
            history_window: 20,
            append_retries: 3,
            append_retry_delay_ms: 100,
            model_retries: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Idle time after which a session may be reclaimed. Zero disables expiry.
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Characters of the first message used as the default title.
    pub title_max_chars: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 30 * 24 * 3600,
            sweep_interval_secs: 600,
            title_max_chars: 50,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub max_bytes: u64,
    /// Entries older than this count as misses. Zero disables age expiry.
    pub max_age_secs: u64,
    pub compute_timeout_ms: u64,
    /// Write artifacts through to the database.
    pub persist: bool,
    /// Rows kept in the artifacts table after pruning.
    pub persisted_max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 128,
            max_bytes: 64 * 1024 * 1024,
            max_age_secs: 24 * 3600,
            compute_timeout_ms: 30_000,
            persist: true,
            persisted_max_entries: 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailSettings {
    pub enabled: bool,
    pub api_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Recipient used when the model omits one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_recipient: Option<String>,
    pub timeout_ms: u64,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: "https://gmail.googleapis.com/gmail/v1/users/me".to_string(),
            sender: None,
            default_recipient: None,
            timeout_ms: 20_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchSettings {
    pub enabled: bool,
    /// Full `:search` endpoint of the document search service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub page_size: u32,
    pub timeout_ms: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            page_size: 5,
            timeout_ms: 40_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
    pub log_to_sqlite: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            log_to_sqlite: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let settings: WatiraSettings =
            serde_json::from_str(r#"{"server": {"port": 9100}}"#).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.orchestrator.max_tool_round_trips, 5);
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(WatiraSettings::default()).unwrap();
        assert!(json["orchestrator"].get("maxToolRoundTrips").is_some());
        assert!(json["cache"].get("computeTimeoutMs").is_some());
        assert!(json["email"].get("defaultRecipient").is_none());
    }
}
