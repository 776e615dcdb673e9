//! Implementation of the `dockform destroy` command.
//!
//! Deletes every resource labeled with a configured context's identifier, stacks first
//! and networks last. Unlabeled and foreign resources are never touched.

use std::sync::Arc;

use anyhow::{Context, Result};

use dockform_lib::execute::{self, CleanupOptions};
use dockform_lib::plan::build_destroy_plan;

use super::Session;
use crate::output::{format_duration, print_info, print_plan, print_stat, print_success};
use crate::progress::TerminalProgress;
use crate::prompts::confirm;

pub async fn cmd_destroy(session: &Session, yes: bool) -> Result<()> {
  let plan = build_destroy_plan(
    session.runtime.clone(),
    &session.config.desired,
    &session.execute,
    &session.cancel,
  )
  .await
  .context("Failed to build destroy plan")?;

  if plan.is_empty() {
    print_info("Nothing to destroy.");
    return Ok(());
  }

  print_plan(&plan);
  println!();
  if !confirm("Destroy all of these resources?", yes)? {
    print_info("Destroy cancelled.");
    return Ok(());
  }

  let options = CleanupOptions {
    strict: true,
    verbose_errors: session.verbose,
  };
  let report = execute::cleanup(
    session.runtime.clone(),
    Arc::new(plan),
    &session.execute,
    options,
    Arc::new(TerminalProgress),
    &session.cancel,
  )
  .await
  .context("Destroy failed")?;

  println!();
  print_success("Destroy complete!");
  print_stat("Resources deleted", &report.deleted.len().to_string());
  print_stat("Duration", &format_duration(report.elapsed));

  Ok(())
}
