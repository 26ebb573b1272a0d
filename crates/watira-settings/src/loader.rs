//! Settings loading with deep merge and environment variable overrides.
//!
//! 1. Start with compiled [`WatiraSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `WATIRA_*` environment variable overrides
//! 4. Validate cross-field constraints

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::WatiraSettings;

/// `~/.watira`, or `/tmp/.watira` without a home directory.
pub fn watira_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".watira")
}

/// Resolve the path to the settings file (`~/.watira/settings.json`).
pub fn settings_path() -> PathBuf {
    watira_home().join("settings.json")
}

/// Resolve a configured path: absolute paths pass through, relative ones
/// land under `~/.watira`.
pub fn resolve_path(path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        watira_home().join(p)
    }
}

pub fn load_settings() -> Result<WatiraSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<WatiraSettings> {
    let mut settings = merge_file(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<WatiraSettings> {
    let parse = |source: serde_json::Error| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let defaults = serde_json::to_value(WatiraSettings::default()).map_err(parse)?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(parse)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    serde_json::from_value(merged).map_err(parse)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key; arrays and primitives are replaced; nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Reject settings that cannot work together.
pub fn validate(settings: &WatiraSettings) -> Result<()> {
    let invalid = |field: &'static str, reason: &'static str| -> Result<()> {
        Err(SettingsError::Invalid { field, reason })
    };
    if settings.cache.max_entries == 0 {
        return invalid("cache.maxEntries", "must be > 0");
    }
    if settings.cache.max_bytes == 0 {
        return invalid("cache.maxBytes", "must be > 0");
    }
    if settings.orchestrator.history_window == 0 {
        return invalid("orchestrator.historyWindow", "must be > 0");
    }
    if settings.search.enabled && settings.search.endpoint.is_none() {
        return invalid("search.endpoint", "required when search is enabled");
    }
    Ok(())
}

/// Apply environment variable overrides. Invalid values are logged and
/// ignored.
pub fn apply_env_overrides(settings: &mut WatiraSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_u16("WATIRA_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("WATIRA_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_string("WATIRA_DB_PATH") {
        settings.database.path = v;
    }

    // ── Model ───────────────────────────────────────────────────────
    if let Some(v) = read_env_string("WATIRA_MODEL") {
        settings.model.model = v;
    }
    if let Some(v) = read_env_string("WATIRA_MODEL_BASE_URL") {
        settings.model.base_url = v;
    }

    // ── Orchestrator ────────────────────────────────────────────────
    if let Some(v) = read_env_u64("WATIRA_MAX_TOOL_ROUND_TRIPS", 0, 100) {
        settings.orchestrator.max_tool_round_trips = v as u32;
    }
    if let Some(v) = read_env_u64("WATIRA_MODEL_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.orchestrator.model_timeout_ms = v;
    }
    if let Some(v) = read_env_u64("WATIRA_TOOL_TIMEOUT_MS", 100, 3_600_000) {
        settings.orchestrator.tool_timeout_ms = v;
    }
    if let Some(v) = read_env_usize("WATIRA_HISTORY_WINDOW", 1, 10_000) {
        settings.orchestrator.history_window = v;
    }

    // ── Sessions & cache ────────────────────────────────────────────
    if let Some(v) = read_env_u64("WATIRA_SESSION_TTL_SECS", 0, u64::MAX) {
        settings.sessions.idle_ttl_secs = v;
    }
    if let Some(v) = read_env_usize("WATIRA_CACHE_MAX_ENTRIES", 1, 1_000_000) {
        settings.cache.max_entries = v;
    }
    if let Some(v) = read_env_u64("WATIRA_CACHE_MAX_BYTES", 1024, u64::MAX) {
        settings.cache.max_bytes = v;
    }

    // ── Email & search ──────────────────────────────────────────────
    if let Some(v) = read_env_bool("WATIRA_EMAIL_ENABLED") {
        settings.email.enabled = v;
    }
    if let Some(v) = read_env_string("WATIRA_EMAIL_SENDER") {
        settings.email.sender = Some(v);
    }
    if let Some(v) = read_env_string("WATIRA_DEFAULT_RECIPIENT") {
        settings.email.default_recipient = Some(v);
    }
    if let Some(v) = read_env_string("WATIRA_SEARCH_ENDPOINT") {
        settings.search.endpoint = Some(v);
        settings.search.enabled = true;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = read_env_string("WATIRA_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
