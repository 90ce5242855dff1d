/// Progress reporting for analysis runs.
///
/// Animated bars on stderr when it is a TTY; plain status lines otherwise.
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::IsTerminal;

use crate::aggregate::FetchFailure;
use crate::reconcile::ProgressCallback;

/// Maximum width of an error message in the failure listing.
const ERROR_WIDTH: usize = 96;

/// Truncates a string to a maximum width with a middle ellipsis.
/// Counts characters, not bytes, so multi-byte names never split.
fn truncate_middle(s: &str, max_width: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_width {
        return s.to_string();
    }
    let ellipsis = "…";
    if max_width <= 1 {
        return s.chars().take(max_width).collect();
    }
    let available = max_width - 1;
    let start_len = available.div_ceil(2);
    let end_len = available / 2;
    let start: String = s.chars().take(start_len).collect();
    let end: String = s.chars().skip(char_count - end_len).collect();
    format!("{}{}{}", start, ellipsis, end)
}

/// One line per skipped fetch.
///
/// Example output:
/// `  ✗ work item 377: https://dev.azure.com/…/updates returned HTTP 500`
pub fn format_failure(failure: &FetchFailure) -> String {
    format!(
        "  ✗ {}: {}",
        failure.subject,
        truncate_middle(&failure.error, ERROR_WIDTH)
    )
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg:<28} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

/// Progress display for a whole analysis.
#[derive(Clone)]
pub struct AnalysisProgress {
    multi: Option<MultiProgress>,
    is_tty: bool,
}

impl AnalysisProgress {
    pub fn new() -> Self {
        let is_tty = std::io::stderr().is_terminal();
        Self {
            multi: is_tty.then(MultiProgress::new),
            is_tty,
        }
    }

    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    /// Starts a bar for one phase (`total` units). Hidden without a TTY.
    pub fn phase(&self, label: &str, total: usize) -> ProgressBar {
        match self.multi {
            Some(ref mp) => {
                let pb = mp.add(ProgressBar::new(total as u64));
                pb.set_style(bar_style());
                pb.set_message(label.to_string());
                pb
            }
            None => {
                eprintln!("{} ({} to go)", label, total);
                ProgressBar::hidden()
            }
        }
    }

    /// Callback for the reconciler driving a bar for the fetch phase.
    ///
    /// The bar should be finished once reconciliation returns.
    pub fn reconcile_callback(&self, label: &str) -> (ProgressCallback, ProgressBar) {
        let pb = self.phase(label, 0);
        let pb_for_cb = pb.clone();
        let callback: ProgressCallback = Box::new(move |done: usize, total: usize| {
            pb_for_cb.set_length(total as u64);
            pb_for_cb.set_position(done as u64);
        });
        (callback, pb)
    }

    /// Print a line without breaking the progress bars.
    pub fn println(&self, msg: &str) {
        if let Some(ref mp) = self.multi {
            let _ = mp.println(msg);
        } else {
            eprintln!("{}", msg);
        }
    }
}

impl Default for AnalysisProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_creation_follows_stderr() {
        let progress = AnalysisProgress::new();
        assert_eq!(progress.is_tty(), std::io::stderr().is_terminal());
    }

    #[test]
    fn callback_drives_bar() {
        let progress = AnalysisProgress { multi: None, is_tty: false };
        let (callback, pb) = progress.reconcile_callback("Fetching history");
        callback(3, 10);
        assert_eq!(pb.position(), 3);
        assert_eq!(pb.length(), Some(10));
        pb.finish_and_clear();
    }

    #[test]
    fn truncate_middle_keeps_short_text() {
        assert_eq!(truncate_middle("short", 10), "short");
    }

    #[test]
    fn truncate_middle_long_unicode() {
        let out = truncate_middle("Very long message 🚀 that exceeds the limit", 20);
        assert!(out.contains('…'));
        assert_eq!(out.chars().count(), 20);
    }

    #[test]
    fn failure_line() {
        let line = format_failure(&FetchFailure::new("work item 7", "HTTP 500"));
        assert_eq!(line, "  ✗ work item 7: HTTP 500");
    }
}
