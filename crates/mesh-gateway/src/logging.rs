use std::str::FromStr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info,mesh_core=debug,hyper=warn,reqwest=warn";
const FORMAT_VAR: &str = "MESH_LOG_FORMAT";

/// Output format for the node's log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event, for log shippers
    #[default]
    Json,
    /// Multi-line human readable output
    Pretty,
    /// Single-line human readable output
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

impl LogFormat {
    /// Unset or unrecognised values fall back to JSON
    fn from_env() -> (Self, Option<String>) {
        match std::env::var(FORMAT_VAR) {
            Ok(raw) => match raw.parse() {
                Ok(format) => (format, None),
                Err(e) => (LogFormat::default(), Some(e)),
            },
            Err(_) => (LogFormat::default(), None),
        }
    }
}

/// `RUST_LOG` wins over the built-in filter
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    match format {
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Pretty => layer.pretty().with_file(true).with_line_number(true).boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

/// Install the global subscriber; later calls are ignored
pub fn init_logging(format: LogFormat) {
    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(format))
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(format = ?format, "Logging initialized");
    }
}

/// Read the format from `MESH_LOG_FORMAT` and install the subscriber
pub fn init_from_env() {
    let (format, rejected) = LogFormat::from_env();
    init_logging(format);
    if let Some(reason) = rejected {
        tracing::warn!(reason = %reason, "Ignoring {}", FORMAT_VAR);
    }
}
