//! Tracing subscriber initialization.
//!
//! Library code only emits `tracing` events. Binaries and tests that want to
//! see them call [`init_tracing`] once at startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `TALLY_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "tally_storage=info,warn";

/// Logging configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Filter directives used when no env filter is set
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create TelemetryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TALLY_LOG_JSON`: `true` for JSON output (default: false)
    /// - `TALLY_LOG_DEFAULT`: fallback filter directives (default: `tally_storage=info,warn`)
    pub fn from_env() -> Self {
        let json = std::env::var("TALLY_LOG_JSON")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);
        let default_filter =
            std::env::var("TALLY_LOG_DEFAULT").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
        Self {
            json,
            default_filter,
        }
    }
}

/// Install a global subscriber.
///
/// Filter directives come from `TALLY_LOG`, then `RUST_LOG`, then the
/// configured default. Returns `false` when a subscriber was already
/// installed, which makes repeated calls from tests harmless.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    let env_filter = EnvFilter::try_from_env("TALLY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let json_layer = config.json.then(|| tracing_subscriber::fmt::layer().json());
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer());

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(json = config.json, "Tracing initialized");
    }
    installed
}
