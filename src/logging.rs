//! Logging setup: stdout plus `<log_path>/<service>.log`

use std::path::Path;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Where log lines go besides the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    /// Foreground run: stdout and the log file
    Dual,
    /// Detached: the log file only
    FileOnly,
}

/// File name of a service's log
#[must_use]
pub fn log_file_name(service: &str) -> String {
    format!("{service}.log")
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Subscriber writing to `file_writer`, and to stdout as well for `Dual`
fn subscriber<W>(file_writer: W, output: LogOutput) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let stdout_layer = (output == LogOutput::Dual).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_filter(env_filter())
    });

    tracing_subscriber::registry().with(stdout_layer).with(
        tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_filter(env_filter()),
    )
}

/// Initialize logging for `service`
///
/// Both outputs use the level from `RUST_LOG`, defaulting to "info".
/// The appender guard is forgotten to keep the file writer alive for the
/// program lifetime.
pub fn init_logging(log_dir: &Path, service: &str, output: LogOutput) {
    let file_appender = tracing_appender::rolling::never(log_dir, log_file_name(service));
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    subscriber(non_blocking, output).init();

    // Keep guard alive for the program lifetime
    std::mem::forget(_guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name("analyzer"), "analyzer.log");
    }

    fn logs_to_file(output: LogOutput) {
        let dir = tempfile::TempDir::new().unwrap();
        let appender = tracing_appender::rolling::never(dir.path(), log_file_name("vacuum"));

        tracing::subscriber::with_default(subscriber(appender, output), || {
            tracing::warn!("disk nearly full");
        });

        let written = std::fs::read_to_string(dir.path().join("vacuum.log")).unwrap();
        assert!(written.contains("disk nearly full"), "{written:?}");
    }

    #[test]
    fn test_detached_logging_reaches_the_file() {
        logs_to_file(LogOutput::FileOnly);
    }

    #[test]
    fn test_foreground_logging_reaches_the_file() {
        logs_to_file(LogOutput::Dual);
    }
}
