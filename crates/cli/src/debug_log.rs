//! Logging setup for zsync2
//!
//! Console output always goes through the progress bars. With
//! `--debug-log`, a trace of our own crates is also written to
//! `/tmp/zsync2-{session_id}.log`, where the session ID is a UUID generated
//! at startup.

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::progress;

/// Targets traced into the debug log file
const FILE_FILTER: &str = "warn,zsync2=trace,zsync2_core=trace,zsync2_transport=trace";

/// Debug log guard - keeps the file logger alive
pub struct DebugLogGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Session info returned when a debug log file was opened
pub struct SessionInfo {
    pub log_path: PathBuf,
    pub guard: DebugLogGuard,
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `-v`
fn console_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// Initialize logging, adding the debug log file when `debug_file` is set.
///
/// The returned session's guard must be kept alive for the duration of the
/// program.
pub fn init(verbose: bool, debug_file: bool) -> Option<SessionInfo> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(progress::ProgressWriter)
        .with_target(false)
        .with_filter(console_filter(verbose));

    let mut session = None;
    let file_layer = debug_file.then(|| {
        let log_filename = format!("zsync2-{}.log", uuid::Uuid::new_v4());
        let file_appender = tracing_appender::rolling::never("/tmp", &log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        session = Some(SessionInfo {
            log_path: PathBuf::from("/tmp").join(&log_filename),
            guard: DebugLogGuard { _guard: guard },
        });

        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT)
            .with_filter(EnvFilter::new(FILE_FILTER))
    });

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    session
}
