//! Terminal rendering for dockform commands.
//!
//! Status lines on stdout use a leading marker; failures and warnings go to stderr so
//! `plan --json` output stays parseable.

use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream, Style};

use dockform_lib::plan::Plan;

pub mod symbols {
  pub const DONE: &str = "✓";
  pub const FAILED: &str = "✗";
  pub const WARN: &str = "⚠";
  pub const NOTE: &str = "•";
  pub const STEP: &str = "→";
}

/// `50ms`, `1.50s`, `1m 5s`.
pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  match secs {
    0 => format!("{}ms", duration.subsec_millis()),
    1..60 => format!("{secs}.{:02}s", duration.subsec_millis() / 10),
    _ => format!("{}m {}s", secs / 60, secs % 60),
  }
}

fn style_for(line: &str) -> Option<Style> {
  match line.trim_start().chars().next() {
    Some('+') => Some(Style::new().green()),
    Some('~') => Some(Style::new().yellow()),
    Some('-') => Some(Style::new().red()),
    Some(_) if !line.starts_with(' ') => Some(Style::new().bold()),
    _ => None,
  }
}

/// Print a rendered plan. Context headings are bold, action lines colored by kind.
pub fn print_plan(plan: &Plan) {
  for line in plan.to_string().lines() {
    match style_for(line) {
      Some(style) => println!("{}", line.if_supports_color(Stream::Stdout, |s| s.style(style))),
      None => println!("{line}"),
    }
  }
}

fn status_line(stream: Stream, marker: &str, marker_style: Style, message: &str, tint_message: bool) {
  let marker = marker.if_supports_color(stream, |s| s.style(marker_style));
  let body = if tint_message {
    message.if_supports_color(stream, |s| s.style(marker_style)).to_string()
  } else {
    message.to_string()
  };
  match stream {
    Stream::Stdout => println!("{marker} {body}"),
    _ => eprintln!("{marker} {body}"),
  }
}

pub fn print_success(message: &str) {
  status_line(Stream::Stdout, symbols::DONE, Style::new().green(), message, false);
}

pub fn print_info(message: &str) {
  status_line(Stream::Stdout, symbols::NOTE, Style::new().blue(), message, false);
}

pub fn print_warning(message: &str) {
  status_line(Stream::Stderr, symbols::WARN, Style::new().yellow(), message, true);
}

pub fn print_error(message: &str) {
  status_line(Stream::Stderr, symbols::FAILED, Style::new().red(), message, true);
}

pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {value}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize plan as JSON")?;
  println!("{json}");
  Ok(())
}
