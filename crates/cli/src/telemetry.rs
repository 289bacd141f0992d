// Logging setup for the CLI
//
// Design Decision: Logs go to stderr so `--output json` on stdout stays machine-readable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter when neither RUST_LOG nor LOG_LEVEL is set
pub const DEFAULT_LOG_FILTER: &str = "claimq=info,claimq_durable=info";

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// Log filter directive
    pub log_filter: String,
    /// Emit one JSON object per line instead of human-readable text
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env(log_format: &str) -> Self {
        Self::resolve(
            std::env::var("RUST_LOG").ok(),
            std::env::var("LOG_LEVEL").ok(),
            log_format,
        )
    }

    fn resolve(rust_log: Option<String>, log_level: Option<String>, log_format: &str) -> Self {
        let log_filter = rust_log
            .or(log_level)
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        Self {
            log_filter,
            json: log_format.eq_ignore_ascii_case("json"),
        }
    }
}

/// Install the global subscriber
pub fn init(config: TelemetryConfig) {
    let filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter)
            .boxed()
    };

    // A subscriber may already be set (tests); keep the existing one.
    let _ = tracing_subscriber::registry().with(layer).try_init();
}
