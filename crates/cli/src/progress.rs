//! Cargo-style progress output for stagesync
//!
//! Displays progress in the familiar cargo format:
//! ```text
//!    Building api (staging)
//!       Built 42 files
//!   Deploying web1, web2
//! ⠋      web2 upload stage/index.html -> /srv/api/stage/index.html
//!    Deployed web1 (incremental: 1 deleted, 3 uploaded)
//!    Finished 2 hosts in 3.21s
//! ```
//!
//! Log lines and status lines are printed through the shared
//! [`MultiProgress`] so they never tear a running spinner.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use stagesync_core::{SyncAction, SyncMode, SyncPhase, SyncReport, SyncReporter};
use tracing_subscriber::fmt::MakeWriter;

/// Status verbs for cargo-style output (right-aligned to 12 chars)
pub struct Status;

impl Status {
    pub const BUILDING: &str = "Building";
    pub const BUILT: &str = "Built";
    pub const DEPLOYING: &str = "Deploying";
    pub const DEPLOYED: &str = "Deployed";
    pub const FAILED: &str = "Failed";
    pub const FINISHED: &str = "Finished";
    pub const SKIPPED: &str = "Skipped";
    pub const WROTE: &str = "Wrote";
}

fn multi() -> &'static MultiProgress {
    static MULTI: OnceLock<MultiProgress> = OnceLock::new();
    MULTI.get_or_init(MultiProgress::new)
}

fn write_stderr(text: &str) {
    multi().suspend(|| {
        let mut term = console::Term::stderr();
        let _ = term.write_all(text.as_bytes());
    });
}

/// Print a cargo-style status line
pub fn print_status(status: &str, message: &str) {
    let style = console::Style::new().green().bold();
    write_stderr(&format!("{:>12} {message}\n", style.apply_to(status)));
}

/// Print a cargo-style status line in the error color
pub fn print_error_status(status: &str, message: &str) {
    let style = console::Style::new().red().bold();
    write_stderr(&format!("{:>12} {message}\n", style.apply_to(status)));
}

/// `tracing` writer that prints above any active spinners
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressWriter;

/// One formatted log event, flushed when dropped
pub struct ProgressLine(Vec<u8>);

impl std::io::Write for ProgressLine {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for ProgressLine {
    fn drop(&mut self) {
        if !self.0.is_empty() {
            write_stderr(&String::from_utf8_lossy(&self.0));
        }
    }
}

impl<'a> MakeWriter<'a> for ProgressWriter {
    type Writer = ProgressLine;

    fn make_writer(&'a self) -> Self::Writer {
        ProgressLine(Vec::new())
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

/// Human summary of how a host was synced
#[must_use]
pub fn describe_report(report: &SyncReport) -> String {
    let mode = match report.mode {
        SyncMode::Full => "full upload".to_string(),
        SyncMode::Incremental {
            deleted: 0,
            uploaded: 0,
        } => "already up to date".to_string(),
        SyncMode::Incremental { deleted, uploaded } => {
            format!("incremental: {deleted} deleted, {uploaded} uploaded")
        }
    };
    if report.restarted {
        format!("{} ({mode}, restarted)", report.host)
    } else {
        format!("{} ({mode})", report.host)
    }
}

/// One spinner per host, fed by the sync executor
pub struct DeployProgress {
    start: Instant,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl DeployProgress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    /// Start a spinner for `host`
    pub fn add_host(&self, host: &str) {
        let pb = multi().add(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {prefix:>10.cyan.bold} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_prefix(host.to_string());
        pb.set_message("connecting");
        pb.enable_steady_tick(Duration::from_millis(80));

        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(host.to_string(), pb);
        }
    }

    fn with_bar(&self, host: &str, f: impl FnOnce(&ProgressBar)) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(pb) = bars.get(host) {
                f(pb);
            }
        }
    }

    /// Stop the spinner for `host` and print its outcome
    pub fn host_finished(&self, host: &str, outcome: Result<&SyncReport, &color_eyre::Report>) {
        let removed = self.bars.lock().ok().and_then(|mut bars| bars.remove(host));
        if let Some(pb) = removed {
            pb.finish_and_clear();
            multi().remove(&pb);
        }

        match outcome {
            Ok(report) => print_status(Status::DEPLOYED, &describe_report(report)),
            Err(err) => print_error_status(Status::FAILED, &format!("{host}: {err:#}")),
        }
    }

    /// Show final summary
    pub fn finish(&self, succeeded: usize, failed: usize) {
        let elapsed = format_elapsed(self.start.elapsed());
        if failed == 0 {
            let noun = if succeeded == 1 { "host" } else { "hosts" };
            print_status(Status::FINISHED, &format!("{succeeded} {noun} in {elapsed}"));
        } else {
            print_error_status(
                Status::FINISHED,
                &format!("{succeeded} succeeded, {failed} failed in {elapsed}"),
            );
        }
    }
}

impl Default for DeployProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncReporter for DeployProgress {
    fn phase(&self, host: &str, phase: SyncPhase) {
        tracing::debug!(host, %phase, "phase");
        self.with_bar(host, |pb| pb.set_message(phase.to_string()));
    }

    fn action(&self, host: &str, action: &SyncAction) {
        tracing::info!(host, "{action}");
        self.with_bar(host, |pb| pb.set_message(action.to_string()));
    }
}
