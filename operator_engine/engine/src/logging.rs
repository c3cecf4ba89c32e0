use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{EngineError, EngineResult};

pub const LOG_FILE_PREFIX: &str = "operator.log";

/// Initialize tracing with stderr and a daily rolling file under `log_dir`.
/// The file layer writes JSON when `json_format` is set, logfmt otherwise.
///
/// Level filtering follows `RUST_LOG`, defaulting to `info`. Keep the returned
/// guard alive for the life of the process or buffered lines are lost.
pub fn init_logging(log_dir: impl AsRef<Path>, json_format: bool) -> EngineResult<WorkerGuard> {
    // {log_dir}/operator.log.{date}
    let file_appender = rolling::daily(log_dir.as_ref(), LOG_FILE_PREFIX);
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    // stderr so command output on stdout stays machine readable
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true);

    let file_layer = if json_format {
        fmt::layer()
            .json()
            .with_writer(non_blocking_file)
            .with_current_span(false)
            .with_span_list(false)
            .with_level(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking_file)
            .with_target(false)
            .with_ansi(false)
            .with_level(true)
            .boxed()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| EngineError::ConfigError(format!("logging already initialized: {e}")))?;

    Ok(guard)
}
