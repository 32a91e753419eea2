//! Logging setup for stagesync
//!
//! Console output goes through the progress display. Every run also writes a
//! full trace to `/tmp/stagesync-{session_id}.log`.
//!
//! Work for one deploy target runs inside [`host_span`], so each file line
//! names the host it came from, and the span's close line records how long
//! that host took.

use std::path::PathBuf;

use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::progress;

const LOG_DIR: &str = "/tmp";

const DEFAULT_FILE_FILTER: &str = "warn,stagesync=trace,stagesync_core=trace,stagesync_transport=trace";

/// Keeps the non-blocking file writer flushing until dropped
pub struct DebugLogGuard {
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

pub struct SessionInfo {
    pub log_path: PathBuf,
    pub guard: DebugLogGuard,
}

/// Span for everything done on behalf of one deploy target
pub fn host_span(host: &str) -> tracing::Span {
    tracing::info_span!("host", host = %host)
}

/// Trace-file formatting, written to `writer`
fn file_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
}

fn console_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

/// Install the file and console layers.
///
/// The returned guard must be kept alive until the program exits.
pub fn init(verbose: bool) -> SessionInfo {
    let log_filename = format!("stagesync-{}.log", uuid::Uuid::new_v4());
    let log_path = PathBuf::from(LOG_DIR).join(&log_filename);

    let file_appender = tracing_appender::rolling::never(LOG_DIR, &log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // RUST_LOG overrides what lands in the file; the console level is fixed
    let file_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILE_FILTER));

    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(progress::ProgressWriter)
        .with_target(false)
        .without_time()
        .with_filter(console_level(verbose));

    tracing_subscriber::registry()
        .with(file_layer(non_blocking).with_filter(file_filter))
        .with(console_layer)
        .init();

    SessionInfo {
        log_path,
        guard: DebugLogGuard { _guard: guard },
    }
}
