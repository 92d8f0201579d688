//! Progress extraction from MP4Box output.
//!
//! MP4Box draws a bar per stage, e.g.
//! `Importing AVC-H264: |=========           | (45/100)` or
//! `ISO File Writing: |===================| (100/100)`.
//! Older builds print `frame 120/2400` style counters instead.

use std::sync::LazyLock;

use regex::Regex;
use tokio::sync::mpsc;

static BAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<stage>[A-Za-z][^:|]*?)\s*:\s*\|[^|]*\|\s*\((?P<done>\d+)/(?P<total>\d+)\)")
        .unwrap()
});

static FRAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bframe\s+(?P<done>\d+)\s*/\s*(?P<total>\d+)").unwrap());

/// A recognized progress line.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    /// Percent in `[0, 100]`.
    pub percent: f64,
    /// What the tool is doing, e.g. `Importing AVC-H264`.
    pub message: String,
}

impl ProgressLine {
    /// Whether this is the final write stage reaching 100%.
    pub fn is_terminal(&self) -> bool {
        self.percent >= 100.0 && self.message.to_ascii_lowercase().contains("writing")
    }
}

/// Parse one line of tool output.
///
/// Returns `None` for anything that does not carry progress.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    if let Some(caps) = BAR_REGEX.captures(line) {
        let percent = ratio_percent(&caps["done"], &caps["total"])?;
        return Some(ProgressLine {
            percent,
            message: caps["stage"].trim().to_string(),
        });
    }

    if let Some(caps) = FRAME_REGEX.captures(line) {
        let done = &caps["done"];
        let total = &caps["total"];
        let percent = ratio_percent(done, total)?;
        return Some(ProgressLine {
            percent,
            message: format!("Processing frame {}/{}", done, total),
        });
    }

    None
}

fn ratio_percent(done: &str, total: &str) -> Option<f64> {
    let done: f64 = done.parse().ok()?;
    let total: f64 = total.parse().ok()?;
    if total <= 0.0 {
        return None;
    }
    Some((done / total * 100.0).clamp(0.0, 100.0))
}

/// A progress update forwarded by the execution worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub message: String,
}

/// Callback handle the execution worker reports progress through.
///
/// Updates are dropped rather than awaited when the receiver is behind.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self { tx }
    }

    pub fn noop() -> Self {
        let (tx, _rx) = mpsc::channel::<ProgressUpdate>(1);
        Self::new(tx)
    }

    pub fn report(&self, percent: f64, message: impl Into<String>) {
        let _ = self.tx.try_send(ProgressUpdate {
            percent,
            message: message.into(),
        });
    }
}

/// Per-run filter that only lets strictly increasing percentages through.
#[derive(Debug, Default)]
pub struct MonotonicProgress {
    last: Option<f64>,
}

impl MonotonicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the clamped percent if it beats everything seen so far.
    pub fn accept(&mut self, percent: f64) -> Option<f64> {
        let percent = percent.clamp(0.0, 100.0);
        match self.last {
            Some(last) if percent <= last => None,
            _ => {
                self.last = Some(percent);
                Some(percent)
            }
        }
    }

    pub fn last(&self) -> Option<f64> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_import_bar() {
        let line = "Importing AVC-H264: |=========           | (45/100)";
        let p = parse_progress_line(line).unwrap();
        assert_eq!(p.percent, 45.0);
        assert_eq!(p.message, "Importing AVC-H264");
        assert!(!p.is_terminal());
    }

    #[test]
    fn test_parse_writing_bar_is_terminal() {
        let line = "ISO File Writing: |===================| (100/100)";
        let p = parse_progress_line(line).unwrap();
        assert_eq!(p.percent, 100.0);
        assert!(p.is_terminal());
    }

    #[test]
    fn test_parse_frame_counter() {
        let p = parse_progress_line("Importing file: frame 600/2400").unwrap();
        assert_eq!(p.percent, 25.0);
        assert_eq!(p.message, "Processing frame 600/2400");
    }

    #[test]
    fn test_parse_clamps_overshoot() {
        let p = parse_progress_line("Importing AAC: |====| (120/100)").unwrap();
        assert_eq!(p.percent, 100.0);
    }

    #[test]
    fn test_parse_ignores_noise() {
        assert!(parse_progress_line("").is_none());
        assert!(parse_progress_line("Saving to out.mp4: 0.500 secs Interleaving").is_none());
        assert!(parse_progress_line("[iso file] Unknown box type abcd").is_none());
        assert!(parse_progress_line("frame 3/0").is_none());
    }

    #[test]
    fn test_monotonic_filter() {
        let mut filter = MonotonicProgress::new();
        assert_eq!(filter.accept(0.0), Some(0.0));
        assert_eq!(filter.accept(10.0), Some(10.0));
        assert_eq!(filter.accept(10.0), None);
        assert_eq!(filter.accept(3.0), None);
        assert_eq!(filter.accept(150.0), Some(100.0));
        assert_eq!(filter.accept(100.0), None);
        assert_eq!(filter.last(), Some(100.0));
    }

    #[tokio::test]
    async fn test_reporter_forwards_updates() {
        let (tx, mut rx) = mpsc::channel(4);
        let reporter = ProgressReporter::new(tx);
        reporter.report(12.0, "Importing");

        let update = rx.recv().await.unwrap();
        assert_eq!(update.percent, 12.0);
        assert_eq!(update.message, "Importing");

        ProgressReporter::noop().report(1.0, "dropped");
    }
}
