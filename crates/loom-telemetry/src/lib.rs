mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Logging configuration for the session client.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Default filter directive. Overridden by RUST_LOG.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// When set, persist warn+ records to this SQLite file.
    pub sink_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
            sink_path: None,
        }
    }
}

/// Handle to the optional persistent sink, for querying records back.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init(config: LogConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let (sqlite_layer, sqlite_sink) = match &config.sink_path {
        Some(path) => match SqliteLogSink::new(path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                let layer = SqliteLogLayer::new(sink.clone());
                (Some(layer), Some(sink))
            }
            Err(e) => {
                eprintln!("loom-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        },
        None => (None, None),
    };

    if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).with(sqlite_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).with(sqlite_layer).init();
    }

    TelemetryGuard { log_sink: sqlite_sink }
}
