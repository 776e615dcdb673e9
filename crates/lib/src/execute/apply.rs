//! Apply orchestration.
//!
//! The flow for one plan:
//!
//! 1. Validate the plan (a malformed plan fails before any runtime call)
//! 2. Fan out over contexts, concurrently or one at a time
//! 3. Within a context, group consecutive actions into phases
//! 4. Run each phase's actions concurrently under the shared semaphore
//! 5. Merge failures into one error list; report cancellation separately
//!
//! There is no rollback: actions that completed before a failure or a cancellation
//! stay applied.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fileset::sync_fileset;
use super::types::{ApplyReport, ExecuteConfig, SkipReason};
use super::ensure_not_cancelled;
use crate::error::{Error, ErrorKind, ErrorList, Result};
use crate::plan::{Action, ActionKind, Payload, Plan, ResourceType};
use crate::progress::ProgressObserver;
use crate::runtime::Runtime;
use crate::state::Endpoint;

const OP: &str = "execute.apply";

/// What happened to every action of a run.
#[derive(Debug, Default)]
pub(crate) struct RunOutcome {
  pub applied: Vec<String>,
  pub errors: ErrorList,
  /// Actions never attempted because the run was cancelled.
  pub not_run: Vec<String>,
  pub skipped: Vec<(String, SkipReason)>,
}

impl RunOutcome {
  /// The `Cancelled` error naming every action that did not run. Failures collected
  /// before the cancellation are logged and kept as its source.
  pub fn into_cancelled_error(self, op: &str) -> Error {
    let mut message = format!("cancelled; {} actions not run: {}", self.not_run.len(), self.not_run.join(", "));
    if self.errors.is_empty() {
      return Error::new(ErrorKind::Cancelled, op, message);
    }

    for err in self.errors.errors() {
      warn!(error = %err, "action failed before cancellation");
    }
    message.push_str(&format!("; {} actions failed", self.errors.len()));
    Error::new(ErrorKind::Cancelled, op, message).with_source(self.errors)
  }
}

/// Shared, lock-guarded state of a run.
struct Sink {
  outcome: RunOutcome,
  progress: Arc<dyn ProgressObserver>,
}

type SharedSink = Arc<Mutex<Sink>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionOutcome {
  Applied,
  Failed,
  Skipped,
  NotRun,
}

/// Apply a plan.
///
/// # Arguments
///
/// * `runtime` - Container runtime receiving the calls
/// * `plan` - The plan exactly as the caller inspected it
/// * `config` - Sequential or parallel execution and the concurrency bound
/// * `progress` - Notified as each action starts
/// * `cancel` - Checked at each action boundary and before each runtime call
///
/// # Returns
///
/// The labels of every applied action when all of them succeeded.
///
/// # Errors
///
/// `InvalidInput` for a malformed plan, `Cancelled` (naming the actions that did not
/// run) when cancelled, otherwise the aggregate of every action failure.
pub async fn apply(
  runtime: Arc<dyn Runtime>,
  plan: Arc<Plan>,
  config: &ExecuteConfig,
  progress: Arc<dyn ProgressObserver>,
  cancel: &CancellationToken,
) -> Result<ApplyReport> {
  plan.validate()?;
  let started = Instant::now();
  let (create, update, delete) = plan.count_actions();
  info!(create, update, delete, mode = ?config.mode, "applying plan");

  let outcome = run_plan(runtime, plan, config, progress, cancel).await;
  let elapsed = started.elapsed();

  if !outcome.not_run.is_empty() {
    warn!(not_run = outcome.not_run.len(), failed = outcome.errors.len(), "apply cancelled");
    return Err(outcome.into_cancelled_error(OP));
  }
  if !outcome.errors.is_empty() {
    error!(
      failures = outcome.errors.len(),
      applied = outcome.applied.len(),
      skipped = outcome.skipped.len(),
      "apply finished with failures"
    );
    outcome.errors.into_result()?;
  }

  info!(applied = outcome.applied.len(), elapsed = ?elapsed, "apply complete");
  Ok(ApplyReport {
    applied: outcome.applied,
    elapsed,
  })
}

/// Execute every action of `plan` and report what happened. Never fails as a whole.
pub(crate) async fn run_plan(
  runtime: Arc<dyn Runtime>,
  plan: Arc<Plan>,
  config: &ExecuteConfig,
  progress: Arc<dyn ProgressObserver>,
  cancel: &CancellationToken,
) -> RunOutcome {
  let sink: SharedSink = Arc::new(Mutex::new(Sink {
    outcome: RunOutcome::default(),
    progress,
  }));
  let semaphore = Arc::new(Semaphore::new(config.permits()));
  let contexts: Vec<String> = plan.contexts().into_iter().map(str::to_string).collect();

  if config.is_parallel() {
    let mut join_set = JoinSet::new();
    for context in contexts {
      join_set.spawn(run_context(
        runtime.clone(),
        plan.clone(),
        context,
        semaphore.clone(),
        sink.clone(),
        cancel.clone(),
      ));
    }
    while let Some(joined) = join_set.join_next().await {
      if let Err(e) = joined {
        error!(error = %e, "context task panicked");
        let err = Error::internal(OP, format!("context task panicked: {}", e));
        sink.lock().await.outcome.errors.add(err);
      }
    }
  } else {
    for context in contexts {
      run_context(
        runtime.clone(),
        plan.clone(),
        context,
        semaphore.clone(),
        sink.clone(),
        cancel.clone(),
      )
      .await;
    }
  }

  let mut guard = sink.lock().await;
  std::mem::take(&mut guard.outcome)
}

/// Split a context's action indices into phases of equal resource type and direction.
fn phases(plan: &Plan, context: &str) -> Vec<Vec<usize>> {
  let mut phases: Vec<Vec<usize>> = Vec::new();
  let mut current: Option<(ResourceType, bool)> = None;

  for (idx, action) in plan.actions().iter().enumerate() {
    if action.context != context {
      continue;
    }
    let key = (action.resource, action.kind.is_delete());
    match phases.last_mut() {
      Some(phase) if current == Some(key) => phase.push(idx),
      _ => phases.push(vec![idx]),
    }
    current = Some(key);
  }

  phases
}

async fn run_context(
  runtime: Arc<dyn Runtime>,
  plan: Arc<Plan>,
  context: String,
  semaphore: Arc<Semaphore>,
  sink: SharedSink,
  cancel: CancellationToken,
) {
  let Some(endpoint) = plan.endpoint(&context).cloned() else {
    let err = Error::invalid_input(OP, format!("no endpoint for context {}", context));
    sink.lock().await.outcome.errors.add(err);
    return;
  };

  let phases = phases(&plan, &context);
  debug!(context = %context, phases = phases.len(), "running context");
  let mut failed_volumes: HashSet<String> = HashSet::new();

  for phase in phases {
    if cancel.is_cancelled() {
      let mut guard = sink.lock().await;
      for idx in phase {
        guard.outcome.not_run.push(plan.actions()[idx].label());
      }
      continue;
    }

    let failed = Arc::new(failed_volumes.clone());
    let mut join_set = JoinSet::new();
    for idx in phase {
      join_set.spawn(run_action(
        runtime.clone(),
        plan.clone(),
        idx,
        endpoint.clone(),
        semaphore.clone(),
        sink.clone(),
        cancel.clone(),
        failed.clone(),
      ));
    }

    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok((idx, ActionOutcome::Failed)) => {
          let action = &plan.actions()[idx];
          if action.resource == ResourceType::Volume && action.kind == ActionKind::Create {
            failed_volumes.insert(action.key.clone());
          }
        }
        Ok(_) => {}
        Err(e) => {
          error!(error = %e, "action task panicked");
          let err = Error::internal(OP, format!("action task panicked: {}", e));
          sink.lock().await.outcome.errors.add(err);
        }
      }
    }
  }
}

#[allow(clippy::too_many_arguments)]
async fn run_action(
  runtime: Arc<dyn Runtime>,
  plan: Arc<Plan>,
  idx: usize,
  endpoint: Endpoint,
  semaphore: Arc<Semaphore>,
  sink: SharedSink,
  cancel: CancellationToken,
  failed_volumes: Arc<HashSet<String>>,
) -> (usize, ActionOutcome) {
  let action = &plan.actions()[idx];
  let label = action.label();

  let Ok(_permit) = semaphore.acquire().await else {
    let err = Error::internal(OP, "semaphore closed");
    sink.lock().await.outcome.errors.add(err);
    return (idx, ActionOutcome::Failed);
  };

  if cancel.is_cancelled() {
    sink.lock().await.outcome.not_run.push(label);
    return (idx, ActionOutcome::NotRun);
  }

  if let Payload::Fileset(payload) = &action.payload
    && failed_volumes.contains(&payload.spec.target_volume)
  {
    let reason = SkipReason::VolumeFailed(payload.spec.target_volume.clone());
    warn!(action = %label, reason = %reason, "skipping action");
    sink.lock().await.outcome.skipped.push((label, reason));
    return (idx, ActionOutcome::Skipped);
  }

  sink.lock().await.progress.on_action_start(&label);
  let result = execute_action(runtime.as_ref(), &endpoint, action, &cancel).await;

  let mut guard = sink.lock().await;
  match result {
    Ok(()) => {
      info!(action = %label, "applied");
      guard.outcome.applied.push(label);
      (idx, ActionOutcome::Applied)
    }
    Err(e) if e.kind() == ErrorKind::Cancelled => {
      guard.outcome.not_run.push(label);
      (idx, ActionOutcome::NotRun)
    }
    Err(e) => {
      debug!(action = %label, error = %e, "action failed");
      let kind = e.kind();
      guard
        .outcome
        .errors
        .add(Error::new(kind, OP, format!("{}: {}", label, e)).with_source(e));
      (idx, ActionOutcome::Failed)
    }
  }
}

/// Map one action onto runtime calls.
async fn execute_action(
  runtime: &dyn Runtime,
  endpoint: &Endpoint,
  action: &Action,
  cancel: &CancellationToken,
) -> Result<()> {
  ensure_not_cancelled(cancel, OP)?;

  if action.kind.is_delete() {
    return match action.resource {
      ResourceType::Network => runtime.delete_network(endpoint, &action.key).await,
      ResourceType::Volume => runtime.delete_volume(endpoint, &action.key).await,
      ResourceType::Stack => runtime.compose_down(endpoint, &action.key).await,
      ResourceType::Fileset => Err(Error::invalid_input(OP, "filesets cannot be deleted")),
    };
  }

  match (&action.payload, action.kind) {
    (Payload::Network(spec), ActionKind::Create) => runtime.create_network(endpoint, spec).await,
    (Payload::Network(spec), ActionKind::Update) => {
      runtime.delete_network(endpoint, &spec.name).await?;
      ensure_not_cancelled(cancel, OP)?;
      runtime.create_network(endpoint, spec).await
    }
    (Payload::Volume(spec), ActionKind::Create) => runtime.create_volume(endpoint, spec).await,
    (Payload::Stack { spec, env }, _) => runtime.compose_up(endpoint, spec, env).await,
    (Payload::Fileset(payload), ActionKind::Update) => sync_fileset(runtime, endpoint, payload, cancel).await,
    _ => Err(Error::invalid_input(
      OP,
      format!("action {} has no executable form", action.label()),
    )),
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use super::*;
  use crate::progress::NoProgress;
  use crate::runtime::memory::MemoryRuntime;
  use crate::state::{NetworkSpec, VolumeSpec};

  fn endpoints(names: &[&str]) -> BTreeMap<String, Endpoint> {
    names
      .iter()
      .map(|n| (n.to_string(), Endpoint::new(*n, "demo")))
      .collect()
  }

  fn create_volume(context: &str, name: &str) -> Action {
    Action::new(
      ActionKind::Create,
      ResourceType::Volume,
      context,
      name,
      "",
      Payload::Volume(VolumeSpec::named(name)),
    )
  }

  fn create_network(context: &str, name: &str) -> Action {
    Action::new(
      ActionKind::Create,
      ResourceType::Network,
      context,
      name,
      "",
      Payload::Network(NetworkSpec::named(name)),
    )
  }

  #[test]
  fn phases_group_consecutive_kinds() {
    let plan = Plan::from_actions(
      vec![
        create_network("a", "n1"),
        create_network("a", "n2"),
        create_volume("a", "v1"),
        create_network("b", "n3"),
      ],
      endpoints(&["a", "b"]),
    );
    assert_eq!(phases(&plan, "a"), vec![vec![0, 1], vec![2]]);
    assert_eq!(phases(&plan, "b"), vec![vec![3]]);
  }

  #[tokio::test]
  async fn malformed_plan_fails_before_any_call() {
    let rt = Arc::new(MemoryRuntime::new());
    let plan = Plan::from_actions(
      vec![create_volume("a", "v"), create_network("a", "n")],
      endpoints(&["a"]),
    );
    let err = apply(
      rt.clone(),
      Arc::new(plan),
      &ExecuteConfig::default(),
      Arc::new(NoProgress),
      &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(rt.calls().is_empty());
  }

  #[tokio::test]
  async fn failures_are_aggregated_and_other_actions_still_run() {
    let rt = Arc::new(MemoryRuntime::new());
    rt.fail_on("create_volume", "bad");
    let plan = Plan::from_actions(
      vec![create_volume("a", "bad"), create_volume("a", "good")],
      endpoints(&["a"]),
    );
    let err = apply(
      rt.clone(),
      Arc::new(plan),
      &ExecuteConfig::default(),
      Arc::new(NoProgress),
      &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::External);
    assert!(err.to_string().contains("+ volume a/bad"));
    assert_eq!(rt.volume_names("a"), vec!["good".to_string()]);
  }

  #[tokio::test]
  async fn progress_sees_every_action() {
    let rt = Arc::new(MemoryRuntime::new());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer = move |label: &str| sink.lock().unwrap().push(label.to_string());

    let plan = Plan::from_actions(
      vec![create_network("a", "n"), create_volume("a", "v")],
      endpoints(&["a"]),
    );
    let report = apply(
      rt,
      Arc::new(plan),
      &ExecuteConfig::sequential(),
      Arc::new(observer),
      &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(report.applied, vec!["+ network a/n", "+ volume a/v"]);
    assert_eq!(*seen.lock().unwrap(), vec!["+ network a/n", "+ volume a/v"]);
  }

  #[tokio::test]
  async fn cancellation_keeps_earlier_failures() {
    let rt = Arc::new(MemoryRuntime::new());
    rt.fail_on("create_network", "n");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let observer = move |label: &str| {
      if label.contains("volume") {
        trigger.cancel();
      }
    };

    let plan = Plan::from_actions(
      vec![create_network("a", "n"), create_volume("a", "v")],
      endpoints(&["a"]),
    );
    let err = apply(rt, Arc::new(plan), &ExecuteConfig::sequential(), Arc::new(observer), &cancel)
      .await
      .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    let message = err.to_string();
    assert!(message.contains("1 actions not run: + volume a/v"), "{}", message);
    assert!(message.contains("1 actions failed"), "{}", message);
    let failures = std::error::Error::source(&err).unwrap().to_string();
    assert!(failures.contains("+ network a/n"), "{}", failures);
  }
}
