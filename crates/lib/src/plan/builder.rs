//! Plan construction.
//!
//! Each context is planned independently: actual state is listed fresh, every desired
//! resource is compared against it, and the resulting actions are merged into one
//! sealed [`Plan`]. Contexts run concurrently in parallel mode and one after the other
//! in sequential mode. Failures from independent contexts and resources are collected
//! and reported together.
//!
//! # Ordering
//!
//! Contexts are ordered by name. Within a context deletes come first in reverse
//! dependency order (stacks, volumes, networks), then creates and updates in dependency
//! order (networks, volumes, stacks, filesets). Ties are broken by resource key.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::types::{Action, ActionKind, FilesetPayload, Payload, Plan, ResourceType};
use crate::drift::{self, classify};
use crate::error::{Error, ErrorKind, ErrorList, Result};
use crate::execute::{ExecuteConfig, ensure_not_cancelled};
use crate::fileset::{self, FileManifest, build_manifest, sentinel_path};
use crate::runtime::{Runtime, StagingOp};
use crate::secrets::SecretsResolver;
use crate::state::{ActualState, ContextSpec, DesiredState, Endpoint, FilesetSpec, MismatchPolicy, StackSpec, VolumeSpec};

const OP: &str = "plan.build";

/// Build the plan that converges every context to `desired`.
///
/// # Arguments
///
/// * `runtime` - Container runtime used for discovery and hashing
/// * `secrets` - Resolver for SOPS-encrypted env files
/// * `desired` - Normalized desired state
/// * `config` - Execution mode for the per-context fan-out
/// * `cancel` - Checked between contexts and resources
///
/// # Errors
///
/// Every failure of every context is aggregated. A network that differs from its
/// declaration under the `error` policy is a `Conflict`.
pub async fn build_plan(
  runtime: Arc<dyn Runtime>,
  secrets: Arc<dyn SecretsResolver>,
  desired: &DesiredState,
  config: &ExecuteConfig,
  cancel: &CancellationToken,
) -> Result<Plan> {
  info!(contexts = desired.contexts.len(), "building plan");
  let actions = fan_out(desired, config, cancel, move |ctx, cancel| {
    let runtime = runtime.clone();
    let secrets = secrets.clone();
    async move { plan_context(runtime.as_ref(), secrets.as_ref(), &ctx, &cancel).await }
  })
  .await?;
  Ok(seal(actions, desired))
}

/// Build a delete-only plan for owned resources the desired state no longer declares.
pub async fn build_prune_plan(
  runtime: Arc<dyn Runtime>,
  desired: &DesiredState,
  config: &ExecuteConfig,
  cancel: &CancellationToken,
) -> Result<Plan> {
  info!(contexts = desired.contexts.len(), "building prune plan");
  let actions = fan_out(desired, config, cancel, move |ctx, cancel| {
    let runtime = runtime.clone();
    async move { cleanup_context(runtime.as_ref(), &ctx, &cancel, false).await }
  })
  .await?;
  Ok(seal(actions, desired))
}

/// Build a delete-only plan for every owned resource of every declared context.
pub async fn build_destroy_plan(
  runtime: Arc<dyn Runtime>,
  desired: &DesiredState,
  config: &ExecuteConfig,
  cancel: &CancellationToken,
) -> Result<Plan> {
  info!(contexts = desired.contexts.len(), "building destroy plan");
  let actions = fan_out(desired, config, cancel, move |ctx, cancel| {
    let runtime = runtime.clone();
    async move { cleanup_context(runtime.as_ref(), &ctx, &cancel, true).await }
  })
  .await?;
  Ok(seal(actions, desired))
}

/// Run `per_context` for every context and merge the results.
async fn fan_out<F, Fut>(
  desired: &DesiredState,
  config: &ExecuteConfig,
  cancel: &CancellationToken,
  per_context: F,
) -> Result<Vec<Action>>
where
  F: Fn(ContextSpec, CancellationToken) -> Fut,
  Fut: Future<Output = Result<Vec<Action>>> + Send + 'static,
{
  let mut errors = ErrorList::new();
  let mut actions = Vec::new();

  if config.is_parallel() {
    let mut join_set = JoinSet::new();
    for ctx in desired.contexts.values() {
      join_set.spawn(per_context(ctx.clone(), cancel.clone()));
    }
    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok(Ok(mut planned)) => actions.append(&mut planned),
        Ok(Err(e)) => errors.add(e),
        Err(e) => {
          error!(error = %e, "plan task panicked");
          errors.add(Error::internal(OP, format!("plan task panicked: {}", e)));
        }
      }
    }
  } else {
    for ctx in desired.contexts.values() {
      match per_context(ctx.clone(), cancel.clone()).await {
        Ok(mut planned) => actions.append(&mut planned),
        Err(e) => errors.add(e),
      }
    }
  }

  ensure_not_cancelled(cancel, OP)?;
  errors.into_result()?;
  Ok(actions)
}

/// Order, deduplicate and freeze the collected actions.
fn seal(mut actions: Vec<Action>, desired: &DesiredState) -> Plan {
  actions.sort_by(|a, b| {
    (a.context.as_str(), a.phase_key(), a.key.as_str()).cmp(&(b.context.as_str(), b.phase_key(), b.key.as_str()))
  });
  actions.dedup_by(|a, b| a.context == b.context && a.resource == b.resource && a.key == b.key);

  let endpoints = desired
    .contexts
    .iter()
    .map(|(name, ctx)| (name.clone(), ctx.endpoint.clone()))
    .collect();
  let plan = Plan::from_actions(actions, endpoints);
  let (create, update, delete) = plan.count_actions();
  info!(create, update, delete, "plan sealed");
  plan
}

async fn discover(runtime: &dyn Runtime, endpoint: &Endpoint, cancel: &CancellationToken) -> Result<ActualState> {
  ensure_not_cancelled(cancel, OP)?;
  let (networks, volumes, services) = tokio::try_join!(
    runtime.list_networks(endpoint),
    runtime.list_volumes(endpoint),
    runtime.list_services(endpoint),
  )?;
  debug!(
    context = %endpoint.name,
    networks = networks.len(),
    volumes = volumes.len(),
    services = services.len(),
    "discovered actual state"
  );
  Ok(ActualState::new(networks, volumes, services))
}

/// Declared volumes plus the target volumes of filesets.
fn desired_volumes(ctx: &ContextSpec) -> BTreeMap<String, VolumeSpec> {
  let mut volumes: BTreeMap<String, VolumeSpec> = ctx
    .volumes
    .values()
    .map(|v| (v.name.clone(), v.clone()))
    .collect();
  for fileset in ctx.filesets.values() {
    volumes
      .entry(fileset.target_volume.clone())
      .or_insert_with(|| VolumeSpec::named(fileset.target_volume.clone()));
  }
  volumes
}

async fn plan_context(
  runtime: &dyn Runtime,
  secrets: &dyn SecretsResolver,
  ctx: &ContextSpec,
  cancel: &CancellationToken,
) -> Result<Vec<Action>> {
  let endpoint = &ctx.endpoint;
  let actual = discover(runtime, endpoint, cancel).await?;

  let mut errors = ErrorList::new();
  let mut actions = Vec::new();

  for spec in ctx.networks.values() {
    let Some(existing) = actual.networks.get(&spec.name) else {
      actions.push(Action::new(
        ActionKind::Create,
        ResourceType::Network,
        &endpoint.name,
        &spec.name,
        "",
        Payload::Network(spec.clone()),
      ));
      continue;
    };

    let diffs = existing.differences(spec);
    if diffs.is_empty() {
      continue;
    }
    match spec.on_mismatch {
      MismatchPolicy::Error => errors.add(Error::conflict(
        OP,
        format!(
          "network {} in context {} differs from its declaration: {}",
          spec.name,
          endpoint.name,
          diffs.join(", ")
        ),
      )),
      MismatchPolicy::Recreate => actions.push(Action::new(
        ActionKind::Update,
        ResourceType::Network,
        &endpoint.name,
        &spec.name,
        format!("recreate: {}", diffs.join(", ")),
        Payload::Network(spec.clone()),
      )),
      MismatchPolicy::Ignore => {
        debug!(network = %spec.name, drift = %diffs.join(", "), "ignoring network drift");
      }
    }
  }

  for (name, spec) in desired_volumes(ctx) {
    if !actual.volumes.contains_key(&name) {
      actions.push(Action::new(
        ActionKind::Create,
        ResourceType::Volume,
        &endpoint.name,
        name,
        "",
        Payload::Volume(spec),
      ));
    }
  }

  for stack in ctx.stacks.values() {
    if let Err(e) = ensure_not_cancelled(cancel, OP) {
      errors.add(e);
      break;
    }
    if let Some(action) = errors.capture(plan_stack(runtime, secrets, endpoint, stack, &actual).await).flatten() {
      actions.push(action);
    }
  }

  for fileset in ctx.filesets.values() {
    if let Err(e) = ensure_not_cancelled(cancel, OP) {
      errors.add(e);
      break;
    }
    if let Some(action) = errors.capture(plan_fileset(runtime, endpoint, fileset, &actual).await).flatten() {
      actions.push(action);
    }
  }

  errors.into_result()?;
  info!(context = %endpoint.name, actions = actions.len(), "planned context");
  Ok(actions)
}

async fn plan_stack(
  runtime: &dyn Runtime,
  secrets: &dyn SecretsResolver,
  endpoint: &Endpoint,
  stack: &StackSpec,
  actual: &ActualState,
) -> Result<Option<Action>> {
  let env = drift::resolve(stack, secrets).await?;
  let desired = drift::hash(runtime, endpoint, stack, &env).await?;
  let project = stack.project_name();

  if desired.is_empty() {
    // Compose cannot bring up an empty project; whatever still exists comes down.
    if actual.project_service_names(project).is_empty() {
      return Ok(None);
    }
    return Ok(Some(Action::new(
      ActionKind::Delete,
      ResourceType::Stack,
      &endpoint.name,
      project,
      "no services declared",
      Payload::None,
    )));
  }

  let running = actual.project_services(project);
  let drift = classify(&desired, &running);

  if drift.is_unchanged() {
    debug!(stack = %stack.name, "stack up to date");
    return Ok(None);
  }

  let (kind, reason) = if running.is_empty() {
    (ActionKind::Create, String::new())
  } else {
    (ActionKind::Update, drift.summary())
  };
  Ok(Some(Action::new(
    kind,
    ResourceType::Stack,
    &endpoint.name,
    &stack.name,
    reason,
    Payload::Stack {
      spec: stack.clone(),
      env,
    },
  )))
}

async fn plan_fileset(
  runtime: &dyn Runtime,
  endpoint: &Endpoint,
  spec: &FilesetSpec,
  actual: &ActualState,
) -> Result<Option<Action>> {
  let source = spec.source.clone();
  let target_path = spec.target_path.clone();
  let exclude = spec.exclude.clone();
  let mut local = tokio::task::spawn_blocking(move || build_manifest(&source, &target_path, &exclude))
    .await
    .map_err(|e| Error::internal(OP, format!("manifest task failed: {}", e)))??;
  local.uid = spec.ownership.uid;
  local.gid = spec.ownership.gid;

  let remote = if actual.volumes.contains_key(&spec.target_volume) {
    read_remote_manifest(runtime, endpoint, spec).await?
  } else {
    FileManifest::default()
  };

  let diff = fileset::diff(&local, &remote);
  let wants_owner = local.uid.is_some() || local.gid.is_some();
  let ownership_changed =
    !remote.tree_hash.is_empty() && wants_owner && (local.uid, local.gid) != (remote.uid, remote.gid);

  let reason = if !diff.is_empty() {
    diff.summary()
  } else if ownership_changed {
    "ownership changed".to_string()
  } else {
    debug!(fileset = %spec.name, "fileset up to date");
    return Ok(None);
  };

  Ok(Some(Action::new(
    ActionKind::Update,
    ResourceType::Fileset,
    &endpoint.name,
    &spec.name,
    reason,
    Payload::Fileset(Box::new(FilesetPayload {
      spec: spec.clone(),
      diff,
      manifest: local,
      ownership_changed,
    })),
  )))
}

/// The sentinel manifest inside the target volume; empty when there is none yet.
async fn read_remote_manifest(runtime: &dyn Runtime, endpoint: &Endpoint, spec: &FilesetSpec) -> Result<FileManifest> {
  let op = StagingOp::ReadFile {
    path: sentinel_path(&spec.target_path),
  };
  match runtime.run_staging(endpoint, &spec.target_volume, op).await {
    Ok(bytes) => FileManifest::from_json(&String::from_utf8_lossy(&bytes)),
    Err(e) if e.kind() == ErrorKind::NotFound => {
      debug!(fileset = %spec.name, "no sentinel in target volume");
      Ok(FileManifest::default())
    }
    Err(e) => Err(e),
  }
}

/// Delete actions for a context: everything owned when `everything`, otherwise only
/// what the desired state no longer declares.
async fn cleanup_context(
  runtime: &dyn Runtime,
  ctx: &ContextSpec,
  cancel: &CancellationToken,
  everything: bool,
) -> Result<Vec<Action>> {
  let endpoint = &ctx.endpoint;
  let actual = discover(runtime, endpoint, cancel).await?;

  let (projects, volumes, networks): (BTreeSet<String>, BTreeSet<String>, BTreeSet<String>) = if everything {
    Default::default()
  } else {
    (
      ctx.stacks.values().map(|s| s.project_name().to_string()).collect(),
      desired_volumes(ctx).into_keys().collect(),
      ctx.networks.values().map(|n| n.name.clone()).collect(),
    )
  };

  let delete = |resource, key: &str, reason: &str| {
    Action::new(ActionKind::Delete, resource, &endpoint.name, key, reason, Payload::None)
  };
  let reason = if everything { "destroy" } else { "not declared" };

  let mut actions = Vec::new();
  for project in actual.projects() {
    if !projects.contains(&project) {
      actions.push(delete(ResourceType::Stack, &project, reason));
    }
  }
  for name in actual.volumes.keys() {
    if !volumes.contains(name) {
      actions.push(delete(ResourceType::Volume, name, reason));
    }
  }
  for name in actual.networks.keys() {
    if !networks.contains(name) {
      actions.push(delete(ResourceType::Network, name, reason));
    }
  }

  info!(context = %endpoint.name, deletions = actions.len(), everything, "planned cleanup");
  Ok(actions)
}
