//! Terminal progress reporting.

use owo_colors::{OwoColorize, Stream};

use dockform_lib::progress::ProgressObserver;

use crate::output::symbols;

/// Prints one line to stderr as each action starts.
#[derive(Debug, Default)]
pub struct TerminalProgress;

impl ProgressObserver for TerminalProgress {
  fn on_action_start(&self, label: &str) {
    eprintln!(
      "{} {}",
      symbols::STEP.if_supports_color(Stream::Stderr, |s| s.cyan()),
      label
    );
  }
}
