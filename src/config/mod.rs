//! Engine Configuration Module
//!
//! Provides process-wide settings loaded from a TOML file with environment
//! overrides, replacing scattered hardcoded thresholds with operator-tunable
//! values.
//!
//! ## Loading Order
//!
//! 1. `AEGIS_CONFIG` environment variable (path to TOML file)
//! 2. `aegis.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(Settings::load());
//!
//! // Anywhere in the codebase:
//! let sigma = config::get().detection.sigma_threshold;
//! ```

mod settings;

pub use settings::*;

use std::sync::OnceLock;

/// Global engine settings, initialized once at startup.
static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Initialize the global settings.
///
/// Must be called exactly once before any calls to `get()`.
pub fn init(settings: Settings) {
    if SETTINGS.set(settings).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global settings.
///
/// Panics if `init()` has not been called. A missing config is a fatal
/// startup error, not a recoverable condition.
#[allow(clippy::expect_used)]
pub fn get() -> &'static Settings {
    SETTINGS
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

/// Check whether the config has been initialized.
///
/// Useful for tests and optional config paths.
pub fn is_initialized() -> bool {
    SETTINGS.get().is_some()
}
