//! Confirmation before apply, prune and destroy touch a daemon.

use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::{Result, bail};
use owo_colors::{OwoColorize, Stream};

use crate::output::symbols;

/// Ask a yes/no question on stderr. `assume_yes` (`--yes`) skips the prompt.
pub fn confirm(message: &str, assume_yes: bool) -> Result<bool> {
  if assume_yes {
    return Ok(true);
  }

  if !io::stdin().is_terminal() || !io::stderr().is_terminal() {
    bail!("Refusing to change docker resources without confirmation. Pass --yes to proceed non-interactively.");
  }

  ask(message, &mut io::stdin().lock(), &mut io::stderr())
}

fn ask(message: &str, input: &mut impl BufRead, out: &mut impl Write) -> Result<bool> {
  let marker = symbols::WARN.if_supports_color(Stream::Stderr, |s| s.yellow());
  let question = message.if_supports_color(Stream::Stderr, |s| s.bold());
  write!(out, "{marker} {question} [y/N] ")?;
  out.flush()?;

  let mut answer = String::new();
  input.read_line(&mut answer)?;
  Ok(is_yes(&answer))
}

/// Only an explicit yes counts; an empty line or EOF declines.
fn is_yes(answer: &str) -> bool {
  matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
