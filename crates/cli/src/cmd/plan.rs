//! Implementation of the `dockform plan` command.
//!
//! Builds the plan against the live daemons and prints it without changing anything.

use anyhow::{Context, Result};
use serde::Serialize;

use dockform_lib::plan::{Action, build_plan};

use super::Session;
use crate::output::{print_json, print_plan};

#[derive(Serialize)]
struct PlanJson<'a> {
  create: usize,
  update: usize,
  delete: usize,
  actions: &'a [Action],
}

pub async fn cmd_plan(session: &Session, json: bool) -> Result<()> {
  let plan = build_plan(
    session.runtime.clone(),
    session.secrets.clone(),
    &session.config.desired,
    &session.execute,
    &session.cancel,
  )
  .await
  .context("Failed to build plan")?;

  if json {
    let (create, update, delete) = plan.count_actions();
    print_json(&PlanJson {
      create,
      update,
      delete,
      actions: plan.actions(),
    })?;
  } else {
    print_plan(&plan);
  }

  Ok(())
}
