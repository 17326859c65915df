//! Shared tracing configuration for the rexec workspace.
//!
//! Binaries, integration tests and benches install their `tracing`
//! subscriber through this crate so that the session, transport and device
//! layers all log with the same filter and output format.
//!
//! ```no_run
//! use rexec_tracing::{init_global_tracing, TracingConfig};
//!
//! init_global_tracing(&TracingConfig::from_env()).expect("tracing");
//! ```

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;

pub use tracing::{debug, error, info, trace, warn};

#[doc(hidden)]
pub use tracing as __tracing;

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Environment variable selecting a preset (`local`, `ci` or `perf`).
pub const ENV_PROFILE: &str = "REXEC_TRACING_PROFILE";
/// Environment variable overriding the filter directives.
pub const ENV_DIRECTIVES: &str = "REXEC_TRACING_DIRECTIVES";
/// Environment variable selecting the output format.
pub const ENV_FORMAT: &str = "REXEC_TRACING_FORMAT";
/// Environment variable holding the performance span threshold.
pub const ENV_PERF_THRESHOLD_US: &str = "REXEC_PERF_THRESHOLD_US";

/// Configuration describing how the shared tracing subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Filter directives such as `rexec_core=debug,info`. When absent the
    /// subscriber falls back to `RUST_LOG` and then to [`default_directive`].
    ///
    /// [`default_directive`]: TracingConfig::default_directive
    pub directives: Option<String>,
    /// Directive used when nothing else resolves to a valid filter.
    pub default_directive: String,
    /// Whether event targets (module paths) are printed.
    pub include_targets: bool,
    /// ANSI colouring. Disabled for CI and JSON output.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Output format of the formatter layer.
    pub output: TracingOutput,
    /// Minimum duration in microseconds before a performance span is logged.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, coloured output for interactive use.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            performance_threshold_us: None,
        }
    }

    /// JSON output without colour codes, suited to log collectors.
    pub fn for_ci() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Json,
            performance_threshold_us: None,
        }
    }

    /// Debug-level session and device logs with span close events, for
    /// profiling transfers and kernel launches.
    pub fn for_performance() -> Self {
        Self {
            directives: Some("rexec_core=debug,rexec_device=debug,info".to_string()),
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: false,
            span_events: FmtSpan::CLOSE,
            output: TracingOutput::Compact,
            performance_threshold_us: None,
        }
    }

    /// Build a configuration from environment hints.
    ///
    /// # Environment Variables
    ///
    /// - `REXEC_TRACING_PROFILE` - `local` (default), `ci` or `perf`
    /// - `REXEC_TRACING_DIRECTIVES` - overrides the filter directives
    /// - `REXEC_TRACING_FORMAT` - `pretty`, `compact` or `json`
    /// - `REXEC_PERF_THRESHOLD_US` - minimum duration of logged performance spans
    pub fn from_env() -> Self {
        let profile = env::var(ENV_PROFILE)
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "perf" | "performance" => Self::for_performance(),
            _ => Self::for_local(),
        };

        if let Ok(directives) = env::var(ENV_DIRECTIVES) {
            if !directives.trim().is_empty() {
                config.directives = Some(directives);
            }
        }

        if let Ok(format) = env::var(ENV_FORMAT) {
            if let Some(parsed) = TracingOutput::from_env_value(&format) {
                config.output = parsed;
                if matches!(config.output, TracingOutput::Json) {
                    config.ansi = false;
                }
            }
        }

        if let Ok(threshold) = env::var(ENV_PERF_THRESHOLD_US) {
            if let Ok(threshold_us) = threshold.trim().parse::<u64>() {
                config.performance_threshold_us = Some(threshold_us);
            }
        }

        config
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

/// Output format of the formatter layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Pretty,
    Compact,
    Json,
}

impl TracingOutput {
    /// Parse the value of `REXEC_TRACING_FORMAT`.
    pub fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" | "text" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Errors surfaced while installing the shared subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    /// The directive string could not be parsed.
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),
    /// A global subscriber is already installed.
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build a subscriber from `config` without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let filter = config.resolve_filter()?;
    let layer = format_layer(config);
    Ok(Registry::default().with(layer).with(filter))
}

fn format_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let base = tracing_fmt::layer()
        .with_target(config.include_targets)
        .with_span_events(config.span_events.clone());

    match config.output {
        TracingOutput::Pretty => Box::new(base.pretty().with_ansi(config.ansi)),
        TracingOutput::Compact => Box::new(base.compact().with_ansi(config.ansi)),
        TracingOutput::Json => Box::new(base.json().with_ansi(false)),
    }
}

/// Install the configured subscriber as the process-wide default.
///
/// Also applies the configured performance span threshold.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?.try_init()?;
    performance::set_span_threshold_us(config.performance_threshold_us);
    Ok(())
}

/// Install a test-writer subscriber, ignoring the error raised when another
/// test already installed one.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialises tests that mutate process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn reset_env() {
        for key in [ENV_PROFILE, ENV_DIRECTIVES, ENV_FORMAT, ENV_PERF_THRESHOLD_US, "RUST_LOG"] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_rejects_invalid_directive() {
        let _guard = ENV_LOCK.lock().unwrap();
        reset_env();
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        assert!(matches!(build_subscriber(&config), Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    fn test_builds_every_output_format() {
        let _guard = ENV_LOCK.lock().unwrap();
        reset_env();
        for output in [TracingOutput::Pretty, TracingOutput::Compact, TracingOutput::Json] {
            let config = TracingConfig {
                output,
                ..TracingConfig::default()
            };
            assert!(build_subscriber(&config).is_ok());
        }
    }

    #[test]
    fn test_from_env_profile_and_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        reset_env();
        env::set_var(ENV_PROFILE, "ci");
        env::set_var(ENV_DIRECTIVES, "rexec_core=trace");
        env::set_var(ENV_PERF_THRESHOLD_US, "250");

        let config = TracingConfig::from_env();
        assert_eq!(config.output, TracingOutput::Json);
        assert!(!config.ansi);
        assert_eq!(config.directives.as_deref(), Some("rexec_core=trace"));
        assert_eq!(config.performance_threshold_us, Some(250));
        reset_env();
    }

    #[test]
    fn test_json_format_disables_ansi() {
        let _guard = ENV_LOCK.lock().unwrap();
        reset_env();
        env::set_var(ENV_FORMAT, "json");
        let config = TracingConfig::from_env();
        assert_eq!(config.output, TracingOutput::Json);
        assert!(!config.ansi);
        reset_env();
    }

    #[test]
    fn test_unknown_format_is_ignored() {
        assert_eq!(TracingOutput::from_env_value("yaml"), None);
        assert_eq!(TracingOutput::from_env_value(" Compact "), Some(TracingOutput::Compact));
    }
}
