//! Console rendering of a protocol run.

use bootcheck::{ProgressSink, Reporter, Step};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Prints step headers and results to stderr, with progress bars on a TTY.
pub struct ConsoleReporter {
    quiet: bool,
    fancy: bool,
    wait_bar: Option<ProgressBar>,
    upload_bar: Option<ProgressBar>,
}

impl ConsoleReporter {
    /// `fancy` enables progress bars; `quiet` suppresses everything but failures.
    pub fn new(quiet: bool, fancy: bool) -> Self {
        Self {
            quiet,
            fancy,
            wait_bar: None,
            upload_bar: None,
        }
    }

    fn bar(&self, len: u64, template: &str) -> ProgressBar {
        if self.quiet || !self.fancy {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        if let Ok(bar_style) = ProgressStyle::default_bar().template(template) {
            pb.set_style(bar_style.progress_chars("#>-"));
        }
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb
    }
}

impl ProgressSink for ConsoleReporter {
    fn update(&mut self, fraction: f64) {
        if self.wait_bar.is_none() {
            self.wait_bar = Some(self.bar(
                100,
                "  {spinner:.green} waiting [{bar:30.cyan/blue}] {pos}%",
            ));
        }
        if let Some(pb) = &self.wait_bar {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            pb.set_position((fraction.clamp(0.0, 1.0) * 100.0) as u64);
        }
    }

    fn clear(&mut self) {
        if let Some(pb) = self.wait_bar.take() {
            pb.finish_and_clear();
        }
    }
}

impl Reporter for ConsoleReporter {
    fn step(&mut self, step: Step) {
        if !self.quiet {
            eprintln!(
                "\n{} {}",
                style(format!("[{}/{}]", step.number(), Step::TOTAL))
                    .cyan()
                    .bold(),
                step.title()
            );
        }
    }

    fn ok(&mut self, message: &str) {
        if !self.quiet {
            eprintln!("  {} {message}", style("✓").green());
        }
    }

    fn warn(&mut self, message: &str) {
        if !self.quiet {
            eprintln!("  {} {message}", style("!").yellow());
        }
    }

    fn fail(&mut self, message: &str) {
        self.clear();
        self.upload_done();
        eprintln!("  {} {message}", style("✗").red().bold());
    }

    fn upload_progress(&mut self, sent: usize, total: usize) {
        if self.upload_bar.is_none() {
            self.upload_bar = Some(self.bar(
                total as u64,
                "  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} bytes",
            ));
        }
        if let Some(pb) = &self.upload_bar {
            pb.set_position(sent as u64);
        }
    }

    fn upload_done(&mut self) {
        if let Some(pb) = self.upload_bar.take() {
            pb.finish_and_clear();
        }
    }
}
