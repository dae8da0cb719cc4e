//! Single-line terminal progress bar.

use splice_core::progress::{ProgressSink, ProgressView};
use std::io::Write;

const BAR_WIDTH: usize = 30;
const ITEM_WIDTH: usize = 32;

/// Redraws one line in place with a bar, counts, ETA and the last patch.
pub struct TerminalProgress<W: Write> {
    out: W,
    drawn: bool,
}

impl<W: Write> TerminalProgress<W> {
    pub fn new(out: W) -> Self {
        Self { out, drawn: false }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn truncate(item: &str, width: usize) -> String {
    if item.chars().count() <= width {
        return item.to_string();
    }
    let mut short: String = item.chars().take(width.saturating_sub(3)).collect();
    short.push_str("...");
    short
}

/// Render the progress line without any terminal control characters.
pub fn progress_line(view: &ProgressView<'_>) -> String {
    let percent = view.percent();
    let filled = (BAR_WIDTH * percent / 100).min(BAR_WIDTH);
    let mut line = format!(
        "[{}{}] {:>3}% ({}/{}) ETA {}",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled),
        percent,
        view.current,
        view.total,
        view.eta
    );
    if let Some(item) = view.item {
        line.push_str("  ");
        line.push_str(&truncate(item, ITEM_WIDTH));
    }
    line
}

impl<W: Write> ProgressSink for TerminalProgress<W> {
    fn render(&mut self, view: ProgressView<'_>) {
        // best effort
        let _ = write!(self.out, "\r\x1b[2K{}", progress_line(&view));
        let _ = self.out.flush();
        self.drawn = true;
    }

    fn finish(&mut self) {
        if self.drawn {
            let _ = writeln!(self.out);
            self.drawn = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splice_core::progress::Eta;
    use std::time::Duration;

    #[test]
    fn renders_bar_counts_and_eta() {
        let line = progress_line(&ProgressView {
            current: 1,
            total: 2,
            item: Some("Hide ads"),
            eta: Eta::Remaining(Duration::from_secs(42)),
        });

        assert_eq!(
            line,
            format!("[{}{}]  50% (1/2) ETA 42s  Hide ads", "#".repeat(15), "-".repeat(15))
        );
    }

    #[test]
    fn first_frame_is_indeterminate() {
        let line = progress_line(&ProgressView {
            current: 0,
            total: 4,
            item: None,
            eta: Eta::Indeterminate,
        });

        assert!(line.ends_with("  0% (0/4) ETA calculating..."));
    }

    #[test]
    fn extra_outcomes_fill_the_bar_without_overflowing() {
        let line = progress_line(&ProgressView {
            current: 5,
            total: 2,
            item: None,
            eta: Eta::Remaining(Duration::ZERO),
        });

        assert_eq!(line, format!("[{}] 100% (5/2) ETA 0s", "#".repeat(BAR_WIDTH)));
    }

    #[test]
    fn long_names_are_truncated() {
        let name = "A patch with a really quite long descriptive name";

        let short = truncate(name, ITEM_WIDTH);

        assert_eq!(short.chars().count(), ITEM_WIDTH);
        assert!(short.ends_with("..."));
        assert_eq!(truncate("short", ITEM_WIDTH), "short");
    }

    #[test]
    fn finish_ends_the_line() {
        let mut progress = TerminalProgress::new(Vec::new());
        progress.render(ProgressView {
            current: 1,
            total: 1,
            item: Some("A"),
            eta: Eta::Remaining(Duration::ZERO),
        });
        progress.finish();

        let out = String::from_utf8(progress.into_inner()).unwrap();
        assert!(out.starts_with("\r\x1b[2K[##"));
        assert!(out.ends_with("A\n"));
    }
}
