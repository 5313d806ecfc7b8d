//! Apply progress bar

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use reconcile::{Action, ApplyResult, ProgressCallback};

/// Progress bar over the changes of one apply; per-node lines are printed
/// above the bar as changes finish
pub struct ApplyProgress {
    bar: ProgressBar,
    quiet: bool,
}

impl ApplyProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        Self { bar, quiet }
    }

    fn line(&self, text: String) {
        if !self.quiet {
            self.bar.println(text);
        }
    }
}

impl ProgressCallback for ApplyProgress {
    fn on_apply_start(&mut self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn on_node_start(&mut self, id: &str, action: &Action) {
        self.bar.set_message(format!("{action} {id}"));
        log::debug!("{id}: {action} started");
    }

    fn on_node_complete(&mut self, id: &str, result: &ApplyResult) {
        match result {
            ApplyResult::NoChange => {}
            ApplyResult::Created => self.line(format!("  {} {} created", "✓".green(), id)),
            ApplyResult::Modified => self.line(format!("  {} {} updated", "✓".green(), id)),
            ApplyResult::Replaced => self.line(format!("  {} {} replaced", "✓".green(), id)),
            ApplyResult::Removed => self.line(format!("  {} {} destroyed", "✓".green(), id)),
            ApplyResult::Read => self.line(format!("  {} {} read", "✓".green(), id)),
            ApplyResult::Failed(e) => self.line(format!("  {} {} {}", "✗".red(), id, e)),
            ApplyResult::Skipped { reason } => {
                self.line(format!("  {} {} {}", "⊘".yellow(), id, reason.dimmed()));
            }
            ApplyResult::Cancelled => {
                self.line(format!("  {} {} {}", "⊘".dimmed(), id, "cancelled".dimmed()));
            }
        }
        self.bar.inc(1);
    }

    fn on_apply_complete(&mut self) {
        self.bar.finish_and_clear();
    }
}
