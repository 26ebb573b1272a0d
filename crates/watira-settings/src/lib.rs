//! # watira-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`WatiraSettings::default()`]
//! 2. **User file**: `~/.watira/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `WATIRA_*` overrides

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, load_settings, load_settings_from_path, resolve_path, settings_path, watira_home,
};
pub use types::*;

use std::sync::OnceLock;

static SETTINGS: OnceLock<WatiraSettings> = OnceLock::new();

/// Get the global settings, loading them on first access. Falls back to
/// compiled defaults if loading fails.
pub fn get_settings() -> &'static WatiraSettings {
    SETTINGS.get_or_init(|| load_settings().unwrap_or_default())
}

/// Install explicitly loaded settings. Fails if the global was already
/// initialized, including implicitly by [`get_settings`].
pub fn init_settings(settings: WatiraSettings) -> Result<()> {
    SETTINGS
        .set(settings)
        .map_err(|_| SettingsError::AlreadyInitialized)
}
