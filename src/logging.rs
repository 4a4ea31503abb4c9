//! Logging for the `herbvision` binary.
//!
//! Console output goes to stderr so result lines on stdout stay clean. A
//! daily-rotated copy lands next to the feature cache, under the local data
//! directory. `-v` raises the console and file level; `RUST_LOG` or
//! `HERBVISION_LOG_LEVEL` override it.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "HERBVISION_LOG_LEVEL";
const LOG_FILE_PREFIX: &str = "herbvision";

/// Where the installed subscriber writes besides the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    File(PathBuf),
    /// The log directory could not be created; the reason is kept for the CLI.
    ConsoleOnly(String),
}

static SINK: OnceLock<LogSink> = OnceLock::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// `<local data dir>/herbvision/logs`, the same root as the feature cache.
pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("herbvision")
        .join("logs")
}

/// Level used when neither `RUST_LOG` nor `HERBVISION_LOG_LEVEL` is set.
pub fn level_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn build_filter(verbose: u8) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new(level_for_verbosity(verbose)))
}

fn open_appender(dir: &Path) -> Result<RollingFileAppender, String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("{}: {}", dir.display(), e))?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .map_err(|e| format!("{}: {}", dir.display(), e))
}

/// Install the global subscriber. Later calls return the first result.
pub fn init_logging(verbose: u8) -> &'static LogSink {
    SINK.get_or_init(|| {
        let dir = log_dir();
        let (file_layer, sink) = match open_appender(&dir) {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let _ = FILE_GUARD.set(guard);
                let layer = fmt::layer()
                    .with_ansi(false)
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(writer);
                (Some(layer), LogSink::File(dir))
            }
            Err(reason) => (None, LogSink::ConsoleOnly(reason)),
        };

        let console = fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .with_timer(UtcTime::rfc_3339())
            .with_target(verbose > 0);

        // A subscriber installed by an embedding program wins.
        let installed = tracing_subscriber::registry()
            .with(build_filter(verbose))
            .with(console)
            .with(file_layer)
            .try_init();
        if installed.is_ok() {
            debug!("Logging to {:?}", sink);
        }
        sink
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_live_next_to_the_feature_cache() {
        let dir = log_dir();
        assert!(dir.ends_with("herbvision/logs"));
        if let Some(local) = dirs::data_local_dir() {
            assert!(dir.starts_with(local));
        }
    }

    #[test]
    fn verbosity_raises_the_default_level() {
        assert_eq!(level_for_verbosity(0), "info");
        assert_eq!(level_for_verbosity(1), "debug");
        assert_eq!(level_for_verbosity(5), "trace");
    }

    #[test]
    fn appender_creates_missing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("logs");
        assert!(open_appender(&dir).is_ok());
        assert!(dir.is_dir());
    }

    #[test]
    fn appender_reports_unusable_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();
        let reason = open_appender(&file.join("logs")).unwrap_err();
        assert!(reason.contains("not-a-dir"));
    }
}
