//! Prune and destroy.
//!
//! Both run a delete-only plan through the same walk as [`super::apply`]. Every deletion
//! is attempted; strictness only decides whether failures fail the call or are reported
//! as warnings.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::apply::run_plan;
use super::types::{CleanupOptions, CleanupReport, ExecuteConfig};
use crate::error::{Error, Result};
use crate::plan::{Plan, build_destroy_plan, build_prune_plan};
use crate::progress::ProgressObserver;
use crate::runtime::Runtime;
use crate::state::DesiredState;

const OP: &str = "execute.cleanup";

/// Delete owned resources that `desired` no longer declares.
pub async fn prune(
  runtime: Arc<dyn Runtime>,
  desired: &DesiredState,
  config: &ExecuteConfig,
  options: CleanupOptions,
  progress: Arc<dyn ProgressObserver>,
  cancel: &CancellationToken,
) -> Result<CleanupReport> {
  let plan = build_prune_plan(runtime.clone(), desired, config, cancel).await?;
  cleanup(runtime, Arc::new(plan), config, options, progress, cancel).await
}

/// Delete every owned resource in the declared contexts.
pub async fn destroy(
  runtime: Arc<dyn Runtime>,
  desired: &DesiredState,
  config: &ExecuteConfig,
  options: CleanupOptions,
  progress: Arc<dyn ProgressObserver>,
  cancel: &CancellationToken,
) -> Result<CleanupReport> {
  let plan = build_destroy_plan(runtime.clone(), desired, config, cancel).await?;
  cleanup(runtime, Arc::new(plan), config, options, progress, cancel).await
}

/// Execute an already built delete-only plan.
///
/// # Errors
///
/// `InvalidInput` when the plan is malformed or contains anything but deletions,
/// `Cancelled` when cancelled. With `options.strict`, any failed deletion fails the call:
/// with the full aggregate when `verbose_errors` is set, otherwise with a one-line summary.
pub async fn cleanup(
  runtime: Arc<dyn Runtime>,
  plan: Arc<Plan>,
  config: &ExecuteConfig,
  options: CleanupOptions,
  progress: Arc<dyn ProgressObserver>,
  cancel: &CancellationToken,
) -> Result<CleanupReport> {
  plan.validate()?;
  if !plan.is_delete_only() {
    return Err(Error::invalid_input(OP, "cleanup plans may only contain deletions"));
  }

  let started = Instant::now();
  let total = plan.len();
  info!(deletions = total, strict = options.strict, "cleaning up");

  let outcome = run_plan(runtime, plan, config, progress, cancel).await;
  let elapsed = started.elapsed();

  if !outcome.not_run.is_empty() {
    warn!(not_run = outcome.not_run.len(), failed = outcome.errors.len(), "cleanup cancelled");
    return Err(outcome.into_cancelled_error(OP));
  }

  let failures = outcome.errors.len();
  let mut warnings = Vec::new();
  if failures > 0 {
    let summary = format!("{} of {} deletions failed", failures, total);
    if options.strict {
      let brief = Error::new(
        outcome.errors.kind(),
        OP,
        format!("{}; rerun with verbose errors for details", summary),
      );
      return match (options.verbose_errors, outcome.errors.into_result()) {
        (true, Err(full)) => Err(full),
        _ => Err(brief),
      };
    }

    if options.verbose_errors {
      for err in outcome.errors.errors() {
        warn!(error = %err, "deletion failed");
        warnings.push(err.to_string());
      }
    } else {
      warn!(failures, total, "{}", summary);
      warnings.push(summary);
    }
  }

  info!(deleted = outcome.applied.len(), warnings = warnings.len(), "cleanup complete");
  Ok(CleanupReport {
    deleted: outcome.applied,
    warnings,
    elapsed,
  })
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use tracing_test::traced_test;

  use super::*;
  use crate::error::ErrorKind;
  use crate::plan::{Action, ActionKind, Payload, ResourceType};
  use crate::progress::NoProgress;
  use crate::runtime::memory::MemoryRuntime;
  use crate::state::{Endpoint, VolumeSpec};

  fn delete_volume(name: &str) -> Action {
    Action::new(ActionKind::Delete, ResourceType::Volume, "default", name, "destroy", Payload::None)
  }

  fn plan(actions: Vec<Action>) -> Arc<Plan> {
    let endpoints = BTreeMap::from([("default".to_string(), Endpoint::new("default", "demo"))]);
    Arc::new(Plan::from_actions(actions, endpoints))
  }

  fn seeded() -> Arc<MemoryRuntime> {
    let rt = Arc::new(MemoryRuntime::new());
    rt.insert_volume("default", Some("demo"), "a");
    rt.insert_volume("default", Some("demo"), "b");
    rt.fail_on("delete_volume", "a");
    rt
  }

  async fn run(rt: Arc<MemoryRuntime>, options: CleanupOptions) -> Result<CleanupReport> {
    cleanup(
      rt,
      plan(vec![delete_volume("a"), delete_volume("b")]),
      &ExecuteConfig::default(),
      options,
      Arc::new(NoProgress),
      &CancellationToken::new(),
    )
    .await
  }

  #[tokio::test]
  #[traced_test]
  async fn non_strict_warns_and_succeeds() {
    let rt = seeded();
    let report = run(rt.clone(), CleanupOptions::default()).await.unwrap();
    assert_eq!(report.deleted, vec!["- volume default/b"]);
    assert_eq!(report.warnings, vec!["1 of 2 deletions failed"]);
    assert!(!report.is_clean());
    assert_eq!(rt.volume_names("default"), vec!["a".to_string()]);
    assert!(logs_contain("1 of 2 deletions failed"));
  }

  #[tokio::test]
  async fn strict_fails_after_attempting_everything() {
    let rt = seeded();
    let options = CleanupOptions {
      strict: true,
      verbose_errors: false,
    };
    let err = run(rt.clone(), options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::External);
    assert!(err.to_string().contains("1 of 2 deletions failed"));
    assert_eq!(rt.volume_names("default"), vec!["a".to_string()]);
  }

  #[tokio::test]
  async fn strict_verbose_returns_the_underlying_failure() {
    let options = CleanupOptions {
      strict: true,
      verbose_errors: true,
    };
    let err = run(seeded(), options).await.unwrap_err();
    assert!(err.to_string().contains("- volume default/a"));
  }

  #[tokio::test]
  async fn plans_with_creates_are_rejected() {
    let create = Action::new(
      ActionKind::Create,
      ResourceType::Volume,
      "default",
      "c",
      "",
      Payload::Volume(VolumeSpec::named("c")),
    );
    let rt = Arc::new(MemoryRuntime::new());
    let err = cleanup(
      rt.clone(),
      plan(vec![create]),
      &ExecuteConfig::default(),
      CleanupOptions::default(),
      Arc::new(NoProgress),
      &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(rt.calls().is_empty());
  }
}
