use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Targets that are far too chatty at `debug` for PTZ troubleshooting.
const QUIET_TARGETS: &[&str] = &["tokio=warn", "runtime=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format (default for development)
    #[default]
    Pretty,
    /// Compact single-line text
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }

    /// Read `LOG_FORMAT`, falling back to [`LogFormat::Pretty`].
    pub fn from_env() -> Self {
        Self::parse(&env::var("LOG_FORMAT").unwrap_or_default())
    }
}

/// Configuration for structured logging
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Name attached to the init event and used for the log file prefix
    pub service_name: String,
    pub service_version: String,
    /// Filter used when `RUST_LOG` is not set
    pub default_filter: String,
    /// Emit span open/close events
    pub enable_span_events: bool,
    /// When set, a daily rolling JSON log is written here as well as stdout
    pub log_dir: Option<String>,
}

impl LogConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            format: LogFormat::from_env(),
            service_name: service_name.into(),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            default_filter: "info".to_string(),
            enable_span_events: env::var("LOG_SPAN_EVENTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            log_dir: env::var("LOG_DIR").ok().filter(|dir| !dir.is_empty()),
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn with_span_events(mut self, enable: bool) -> Self {
        self.enable_span_events = enable;
        self
    }

    pub fn with_file_logging(mut self, log_dir: impl Into<String>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    fn span_events(&self) -> FmtSpan {
        if self.enable_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

fn build_filter(default_filter: &str) -> EnvFilter {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    for directive in QUIET_TARGETS {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global subscriber described by `config`.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process when file logging is enabled. Calling this
/// twice is harmless: the second subscriber is discarded.
pub fn init_structured_logging(config: LogConfig) -> Option<WorkerGuard> {
    let filter = build_filter(&config.default_filter);
    let span_events = config.span_events();

    let (file_layer, guard) = match config.log_dir.as_deref() {
        Some(dir) => {
            let appender =
                tracing_appender::rolling::daily(dir, format!("{}.log", config.service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_writer(io::stdout),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_span_events(span_events)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_span_events(span_events)
                    .with_target(true)
                    .with_line_number(true),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("global subscriber already installed, keeping it");
        return guard;
    }

    tracing::info!(
        service.name = %config.service_name,
        service.version = %config.service_version,
        format = ?config.format,
        file_logging = config.log_dir.is_some(),
        "structured logging initialized"
    );

    guard
}

/// Initialize logging for `service_name` with everything else from the environment
pub fn init_with_service(service_name: impl Into<String>) -> Option<WorkerGuard> {
    init_structured_logging(LogConfig::new(service_name))
}
