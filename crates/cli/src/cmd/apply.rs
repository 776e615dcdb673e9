//! Implementation of the `dockform apply` command.
//!
//! Builds the plan, shows it, asks for confirmation and applies it. With `--prune`,
//! owned resources that are no longer declared are deleted afterwards.

use std::sync::Arc;

use anyhow::{Context, Result};

use dockform_lib::execute::{self, CleanupOptions};
use dockform_lib::plan::{build_plan, build_prune_plan};

use super::Session;
use crate::output::{format_duration, print_info, print_plan, print_stat, print_success, print_warning};
use crate::progress::TerminalProgress;
use crate::prompts::confirm;

pub async fn cmd_apply(session: &Session, prune: bool, yes: bool) -> Result<()> {
  let plan = build_plan(
    session.runtime.clone(),
    session.secrets.clone(),
    &session.config.desired,
    &session.execute,
    &session.cancel,
  )
  .await
  .context("Failed to build plan")?;

  let prune_plan = if prune {
    Some(
      build_prune_plan(
        session.runtime.clone(),
        &session.config.desired,
        &session.execute,
        &session.cancel,
      )
      .await
      .context("Failed to build prune plan")?,
    )
  } else {
    None
  };
  let nothing_to_prune = prune_plan.as_ref().is_none_or(|p| p.is_empty());

  if plan.is_empty() && nothing_to_prune {
    print_info("No changes. Everything is up to date.");
    return Ok(());
  }

  if !plan.is_empty() {
    print_plan(&plan);
  }
  if let Some(prune_plan) = prune_plan.as_ref().filter(|p| !p.is_empty()) {
    println!();
    println!("Pruning:");
    print_plan(prune_plan);
  }
  println!();

  if !confirm("Apply these changes?", yes)? {
    print_info("Apply cancelled.");
    return Ok(());
  }

  if !plan.is_empty() {
    let report = execute::apply(
      session.runtime.clone(),
      Arc::new(plan),
      &session.execute,
      Arc::new(TerminalProgress),
      &session.cancel,
    )
    .await
    .context("Apply failed")?;

    println!();
    print_success("Apply complete!");
    print_stat("Actions applied", &report.applied.len().to_string());
    print_stat("Duration", &format_duration(report.elapsed));
  }

  if let Some(prune_plan) = prune_plan.filter(|p| !p.is_empty()) {
    let options = CleanupOptions {
      strict: false,
      verbose_errors: session.verbose,
    };
    let report = execute::cleanup(
      session.runtime.clone(),
      Arc::new(prune_plan),
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
      print_warning("Prune finished with failures");
    }
    print_stat("Resources deleted", &report.deleted.len().to_string());
    print_stat("Warnings", &report.warnings.len().to_string());
  }

  Ok(())
}
