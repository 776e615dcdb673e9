//! Implementation of the `dockform prune` command.

use std::sync::Arc;

use anyhow::{Context, Result};

use dockform_lib::execute::{self, CleanupOptions};
use dockform_lib::plan::build_prune_plan;

use super::Session;
use crate::output::{format_duration, print_info, print_plan, print_stat, print_success, print_warning};
use crate::progress::TerminalProgress;
use crate::prompts::confirm;

/// Delete owned resources that the configuration no longer declares.
///
/// Non-strict runs report failed deletions as warnings and still succeed; `--strict`
/// turns any failure into an error. Every deletion is attempted either way.
pub async fn cmd_prune(session: &Session, strict: bool, verbose_errors: bool, yes: bool) -> Result<()> {
  let plan = build_prune_plan(
    session.runtime.clone(),
    &session.config.desired,
    &session.execute,
    &session.cancel,
  )
  .await
  .context("Failed to build prune plan")?;

  if plan.is_empty() {
    print_info("Nothing to prune.");
    return Ok(());
  }

  print_plan(&plan);
  println!();
  if !confirm("Delete these resources?", yes)? {
    print_info("Prune cancelled.");
    return Ok(());
  }

  let options = CleanupOptions { strict, verbose_errors };
  let report = execute::cleanup(
    session.runtime.clone(),
    Arc::new(plan),
    &session.execute,
    options,
    Arc::new(TerminalProgress),
    &session.cancel,
  )
  .await
  .context("Prune failed")?;

  println!();
  if report.is_clean() {
    print_success("Prune complete!");
  } else {
    for warning in &report.warnings {
      print_warning(warning);
    }
  }
  print_stat("Resources deleted", &report.deleted.len().to_string());
  print_stat("Duration", &format_duration(report.elapsed));

  Ok(())
}
