//! Cargo-style progress output for zsync2
//!
//! Displays progress in the familiar cargo format:
//! ```text
//!     Loading app.AppImage.zsync
//!     Syncing app.AppImage (61.20 MiB, 31334 blocks)
//!      Reused 58.91 MiB from 1 seed
//!     Fetched 2.29 MiB in 14 requests
//!    Finished app.AppImage in 1.84s
//! ```

use std::io::{self, Write as _};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::fmt::MakeWriter;

use zsync2_core::SyncReport;

/// Every bar is drawn through this so log lines can suspend it
static BARS: LazyLock<MultiProgress> = LazyLock::new(MultiProgress::new);

/// Status verbs for cargo-style output (right-aligned to 12 chars)
struct Status;

impl Status {
    const LOADING: &str = "Loading";
    const SYNCING: &str = "Syncing";
    const REUSED: &str = "Reused";
    const FETCHED: &str = "Fetched";
    const FINISHED: &str = "Finished";
    const WROTE: &str = "Wrote";
}

/// Print a cargo-style status line
fn print_status(status: &str, message: &str) {
    let style = console::Style::new().green().bold();
    let line = format!("{:>12} {}", style.apply_to(status), message);
    BARS.suspend(|| {
        let mut term = console::Term::stderr();
        let _ = writeln!(term, "{line}");
    });
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Tracing writer that clears progress bars while a log line is written
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressWriter;

impl io::Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        BARS.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for ProgressWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

/// Progress tracker for one command
pub struct SyncProgress {
    start: Instant,
}

impl SyncProgress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn loading(&self, what: &str) {
        print_status(Status::LOADING, what);
    }

    /// Spinner shown while seeds are scanned and gaps fetched
    pub fn sync_spinner(&self, name: &str, length: u64, blocks: u64) -> ProgressBar {
        print_status(
            Status::SYNCING,
            &format!("{name} ({}, {blocks} blocks)", format_size(length)),
        );

        let pb = BARS.add(ProgressBar::new_spinner());
        let style = ProgressStyle::with_template("{spinner:.green} {msg:>12} {prefix}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(Status::SYNCING);
        pb.set_prefix(format!("{name}..."));
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    /// Show final summary of a sync
    pub fn finish(&self, name: &str, report: &SyncReport) {
        let seeds = match report.seeds_scanned {
            1 => "1 seed".to_string(),
            n => format!("{n} seeds"),
        };
        print_status(
            Status::REUSED,
            &format!("{} from {seeds}", format_size(report.reused_bytes)),
        );
        if report.fetched_bytes > 0 {
            print_status(
                Status::FETCHED,
                &format!(
                    "{} in {} requests",
                    format_size(report.fetched_bytes),
                    report.requests
                ),
            );
        }
        print_status(
            Status::FINISHED,
            &format!("{name} in {}", format_elapsed(self.start.elapsed())),
        );
    }

    /// Show the result of writing a control file
    pub fn wrote(&self, path: &str, blocks: u64) {
        print_status(
            Status::WROTE,
            &format!(
                "{path} ({blocks} blocks) in {}",
                format_elapsed(self.start.elapsed())
            ),
        );
    }
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_millis(250)), "250ms");
        assert_eq!(format_elapsed(Duration::from_millis(1500)), "1.50s");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
    }
}
