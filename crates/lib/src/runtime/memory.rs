//! In-memory [`Runtime`] double.
//!
//! Models just enough of a container daemon for the engine: labeled networks and
//! volumes, compose projects with per-service configuration hashes, containers that
//! mount volumes, and volume contents as a path -> bytes map. Every call is recorded,
//! and failures can be injected per operation and resource.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{Runtime, StagingOp};
use crate::drift::ResolvedEnv;
use crate::error::{Error, Result};
use crate::state::{Endpoint, NetworkInfo, NetworkSpec, ServiceState, StackSpec, VolumeInfo, VolumeSpec};
use crate::util::hash::hash_bytes;

const OP: &str = "runtime.memory";

#[derive(Debug, Clone)]
struct Labeled<T> {
  identifier: Option<String>,
  value: T,
}

#[derive(Debug, Clone)]
struct Container {
  identifier: String,
  project: String,
  service: String,
  config_hash: String,
  running: bool,
  volumes: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct ServiceDef {
  volumes: Vec<String>,
}

#[derive(Debug, Default)]
struct ContextState {
  networks: BTreeMap<String, Labeled<NetworkInfo>>,
  volumes: BTreeMap<String, Labeled<VolumeInfo>>,
  containers: Vec<Container>,
  /// Compose services declared per project, as the compose files would.
  projects: BTreeMap<String, BTreeMap<String, ServiceDef>>,
  /// Bumped to simulate edits of a project's compose files.
  revisions: BTreeMap<String, u64>,
  files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
  ownership: Vec<(String, StagingOp)>,
}

#[derive(Debug, Default)]
struct Inner {
  contexts: BTreeMap<String, ContextState>,
  failures: BTreeSet<(String, String)>,
  calls: Vec<String>,
}

/// A fake daemon per context name, shared behind one lock.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
  inner: Mutex<Inner>,
}

impl MemoryRuntime {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Make every call of `op` on `key` fail with an `External` error.
  ///
  /// `key` is the resource name for resource operations and the context name for list
  /// operations; `*` matches any operation or any key.
  pub fn fail_on(&self, op: &str, key: &str) {
    self.lock().failures.insert((op.to_string(), key.to_string()));
  }

  pub fn clear_failures(&self) {
    self.lock().failures.clear();
  }

  /// Every call so far, formatted as `<op> <context>/<key>`.
  pub fn calls(&self) -> Vec<String> {
    self.lock().calls.clone()
  }

  /// Declare a compose service of `project` mounting `volumes`.
  pub fn declare_service(&self, context: &str, project: &str, service: &str, volumes: &[&str]) {
    let mut inner = self.lock();
    let ctx = inner.contexts.entry(context.to_string()).or_default();
    ctx.projects.entry(project.to_string()).or_default().insert(
      service.to_string(),
      ServiceDef {
        volumes: volumes.iter().map(|v| v.to_string()).collect(),
      },
    );
  }

  /// Drop every service declaration of `project`, leaving compose files that declare none.
  pub fn clear_services(&self, context: &str, project: &str) {
    let mut inner = self.lock();
    let ctx = inner.contexts.entry(context.to_string()).or_default();
    ctx.projects.insert(project.to_string(), BTreeMap::new());
  }

  /// Simulate an edit of the project's compose files.
  pub fn bump_revision(&self, context: &str, project: &str) {
    let mut inner = self.lock();
    let ctx = inner.contexts.entry(context.to_string()).or_default();
    *ctx.revisions.entry(project.to_string()).or_default() += 1;
  }

  /// Seed a network. `identifier` None models an unlabeled, foreign network.
  pub fn insert_network(&self, context: &str, identifier: Option<&str>, info: NetworkInfo) {
    let mut inner = self.lock();
    let ctx = inner.contexts.entry(context.to_string()).or_default();
    ctx.networks.insert(
      info.name.clone(),
      Labeled {
        identifier: identifier.map(str::to_string),
        value: info,
      },
    );
  }

  pub fn insert_volume(&self, context: &str, identifier: Option<&str>, name: &str) {
    let mut inner = self.lock();
    let ctx = inner.contexts.entry(context.to_string()).or_default();
    ctx.volumes.insert(
      name.to_string(),
      Labeled {
        identifier: identifier.map(str::to_string),
        value: VolumeInfo {
          name: name.to_string(),
          driver: "local".to_string(),
        },
      },
    );
    ctx.files.entry(name.to_string()).or_default();
  }

  /// Seed a container, running or stopped as `state` says.
  pub fn insert_container(&self, context: &str, identifier: &str, state: ServiceState, volumes: &[&str]) {
    let mut inner = self.lock();
    let ctx = inner.contexts.entry(context.to_string()).or_default();
    ctx.containers.push(Container {
      identifier: identifier.to_string(),
      project: state.project,
      service: state.service,
      config_hash: state.config_hash,
      running: state.running,
      volumes: volumes.iter().map(|v| v.to_string()).collect(),
    });
  }

  /// Seed a file inside a volume at an absolute volume path.
  pub fn write_volume_file(&self, context: &str, volume: &str, path: &str, contents: &[u8]) {
    let mut inner = self.lock();
    let ctx = inner.contexts.entry(context.to_string()).or_default();
    ctx
      .files
      .entry(volume.to_string())
      .or_default()
      .insert(normalize(path), contents.to_vec());
  }

  pub fn volume_file(&self, context: &str, volume: &str, path: &str) -> Option<Vec<u8>> {
    let inner = self.lock();
    inner.contexts.get(context)?.files.get(volume)?.get(&normalize(path)).cloned()
  }

  /// Sorted paths of every file stored in `volume`.
  pub fn volume_paths(&self, context: &str, volume: &str) -> Vec<String> {
    let inner = self.lock();
    inner
      .contexts
      .get(context)
      .and_then(|c| c.files.get(volume))
      .map(|files| files.keys().cloned().collect())
      .unwrap_or_default()
  }

  pub fn network_names(&self, context: &str) -> Vec<String> {
    let inner = self.lock();
    inner
      .contexts
      .get(context)
      .map(|c| c.networks.keys().cloned().collect())
      .unwrap_or_default()
  }

  pub fn volume_names(&self, context: &str) -> Vec<String> {
    let inner = self.lock();
    inner
      .contexts
      .get(context)
      .map(|c| c.volumes.keys().cloned().collect())
      .unwrap_or_default()
  }

  /// `(project, service)` of every running container, labeled or not.
  pub fn running(&self, context: &str) -> Vec<(String, String)> {
    let inner = self.lock();
    let mut out: Vec<(String, String)> = inner
      .contexts
      .get(context)
      .map(|c| {
        c.containers
          .iter()
          .filter(|k| k.running)
          .map(|k| (k.project.clone(), k.service.clone()))
          .collect()
      })
      .unwrap_or_default();
    out.sort();
    out
  }

  /// Ownership operations applied to `volume`, in order.
  pub fn ownership_ops(&self, context: &str, volume: &str) -> Vec<StagingOp> {
    let inner = self.lock();
    inner
      .contexts
      .get(context)
      .map(|c| {
        c.ownership
          .iter()
          .filter(|(v, _)| v == volume)
          .map(|(_, op)| op.clone())
          .collect()
      })
      .unwrap_or_default()
  }
}

/// Record the call, then fail it if a matching failure was injected.
fn enter(inner: &mut Inner, op: &str, endpoint: &Endpoint, key: &str) -> Result<()> {
  inner.calls.push(format!("{} {}/{}", op, endpoint.name, key));
  let injected = [(op, key), (op, "*"), ("*", key), ("*", "*")]
    .iter()
    .any(|(o, k)| inner.failures.contains(&(o.to_string(), k.to_string())));
  if injected {
    return Err(Error::external(
      OP,
      format!("injected failure for {} {}/{}", op, endpoint.name, key),
    ));
  }
  Ok(())
}

fn owned(identifier: &Option<String>, endpoint: &Endpoint) -> bool {
  identifier.as_deref() == Some(endpoint.identifier.as_str())
}

fn normalize(path: &str) -> String {
  let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
  format!("/{}", parts.join("/"))
}

fn join(target: &str, rel: &str) -> String {
  normalize(&format!("{}/{}", target, rel))
}

fn config_hash(project: &str, service: &str, revision: u64, stack: &StackSpec, env: &ResolvedEnv) -> String {
  let mut material = format!("{}\0{}\0{}\0", project, service, revision);
  for file in &stack.files {
    material.push_str(&file.display().to_string());
    material.push('\0');
  }
  for profile in &stack.profiles {
    material.push_str(profile);
    material.push('\0');
  }
  for (key, value) in env.pairs() {
    material.push_str(&format!("{}={}\n", key, value));
  }
  hash_bytes(material.as_bytes())
}

fn declared_hashes(ctx: &ContextState, stack: &StackSpec, env: &ResolvedEnv) -> Result<BTreeMap<String, String>> {
  let project = stack.project_name();
  let services = ctx.projects.get(project).ok_or_else(|| {
    Error::external(
      OP,
      format!("compose project {} declares no services", project),
    )
  })?;
  let revision = ctx.revisions.get(project).copied().unwrap_or(0);
  Ok(
    services
      .keys()
      .map(|service| (service.clone(), config_hash(project, service, revision, stack, env)))
      .collect(),
  )
}

fn extract(files: &mut BTreeMap<String, Vec<u8>>, target_path: &str, archive: &[u8]) -> Result<()> {
  let io_err = |e: std::io::Error| Error::external(OP, format!("bad archive: {}", e));
  let mut archive = tar::Archive::new(std::io::Cursor::new(archive));
  for entry in archive.entries().map_err(io_err)? {
    let mut entry = entry.map_err(io_err)?;
    if !entry.header().entry_type().is_file() {
      continue;
    }
    let rel = entry.path().map_err(io_err)?.to_string_lossy().replace('\\', "/");
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents).map_err(io_err)?;
    files.insert(join(target_path, &rel), contents);
  }
  Ok(())
}

#[async_trait]
impl Runtime for MemoryRuntime {
  async fn list_networks(&self, endpoint: &Endpoint) -> Result<Vec<NetworkInfo>> {
    let mut inner = self.lock();
    enter(&mut inner, "list_networks", endpoint, &endpoint.name)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    Ok(
      ctx
        .networks
        .values()
        .filter(|n| owned(&n.identifier, endpoint))
        .map(|n| n.value.clone())
        .collect(),
    )
  }

  async fn list_volumes(&self, endpoint: &Endpoint) -> Result<Vec<VolumeInfo>> {
    let mut inner = self.lock();
    enter(&mut inner, "list_volumes", endpoint, &endpoint.name)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    Ok(
      ctx
        .volumes
        .values()
        .filter(|v| owned(&v.identifier, endpoint))
        .map(|v| v.value.clone())
        .collect(),
    )
  }

  async fn list_services(&self, endpoint: &Endpoint) -> Result<Vec<ServiceState>> {
    let mut inner = self.lock();
    enter(&mut inner, "list_services", endpoint, &endpoint.name)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    Ok(
      ctx
        .containers
        .iter()
        .filter(|c| c.identifier == endpoint.identifier)
        .map(|c| ServiceState {
          project: c.project.clone(),
          service: c.service.clone(),
          config_hash: c.config_hash.clone(),
          running: c.running,
        })
        .collect(),
    )
  }

  async fn create_network(&self, endpoint: &Endpoint, spec: &NetworkSpec) -> Result<()> {
    let mut inner = self.lock();
    enter(&mut inner, "create_network", endpoint, &spec.name)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    if ctx.networks.contains_key(&spec.name) {
      return Err(Error::conflict(OP, format!("network {} already exists", spec.name)));
    }
    ctx.networks.insert(
      spec.name.clone(),
      Labeled {
        identifier: Some(endpoint.identifier.clone()),
        value: NetworkInfo::from_spec(spec),
      },
    );
    Ok(())
  }

  async fn delete_network(&self, endpoint: &Endpoint, name: &str) -> Result<()> {
    let mut inner = self.lock();
    enter(&mut inner, "delete_network", endpoint, name)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    ctx.networks.remove(name);
    Ok(())
  }

  async fn create_volume(&self, endpoint: &Endpoint, spec: &VolumeSpec) -> Result<()> {
    let mut inner = self.lock();
    enter(&mut inner, "create_volume", endpoint, &spec.name)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    ctx.volumes.entry(spec.name.clone()).or_insert_with(|| Labeled {
      identifier: Some(endpoint.identifier.clone()),
      value: VolumeInfo {
        name: spec.name.clone(),
        driver: spec.driver.clone().unwrap_or_else(|| "local".to_string()),
      },
    });
    ctx.files.entry(spec.name.clone()).or_default();
    Ok(())
  }

  async fn delete_volume(&self, endpoint: &Endpoint, name: &str) -> Result<()> {
    let mut inner = self.lock();
    enter(&mut inner, "delete_volume", endpoint, name)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    if ctx.containers.iter().any(|c| c.volumes.iter().any(|v| v == name)) {
      return Err(Error::conflict(OP, format!("volume {} is in use", name)));
    }
    ctx.volumes.remove(name);
    ctx.files.remove(name);
    Ok(())
  }

  async fn compose_up(&self, endpoint: &Endpoint, stack: &StackSpec, env: &ResolvedEnv) -> Result<()> {
    let mut inner = self.lock();
    let project = stack.project_name().to_string();
    enter(&mut inner, "compose_up", endpoint, &project)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    let hashes = declared_hashes(ctx, stack, env)?;
    let declared = ctx.projects.get(&project).cloned().unwrap_or_default();

    ctx.containers.retain(|c| c.project != project);
    for (service, config_hash) in hashes {
      let volumes = declared.get(&service).map(|d| d.volumes.clone()).unwrap_or_default();
      ctx.containers.push(Container {
        identifier: endpoint.identifier.clone(),
        project: project.clone(),
        service,
        config_hash,
        running: true,
        volumes,
      });
    }
    debug!(context = %endpoint.name, project = %project, "memory compose up");
    Ok(())
  }

  async fn compose_down(&self, endpoint: &Endpoint, project: &str) -> Result<()> {
    let mut inner = self.lock();
    enter(&mut inner, "compose_down", endpoint, project)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    ctx
      .containers
      .retain(|c| !(c.project == project && c.identifier == endpoint.identifier));
    Ok(())
  }

  async fn compose_config_hash(
    &self,
    endpoint: &Endpoint,
    stack: &StackSpec,
    env: &ResolvedEnv,
  ) -> Result<BTreeMap<String, String>> {
    let mut inner = self.lock();
    enter(&mut inner, "compose_config_hash", endpoint, stack.project_name())?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    declared_hashes(ctx, stack, env)
  }

  async fn run_staging(&self, endpoint: &Endpoint, volume: &str, op: StagingOp) -> Result<Vec<u8>> {
    let mut inner = self.lock();
    enter(&mut inner, op.name(), endpoint, volume)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    if !ctx.volumes.contains_key(volume) {
      return Err(Error::not_found(OP, format!("volume {} does not exist", volume)));
    }
    let files = ctx.files.entry(volume.to_string()).or_default();

    match op {
      StagingOp::ReadFile { path } => files
        .get(&normalize(&path))
        .cloned()
        .ok_or_else(|| Error::not_found(OP, format!("{}:{} does not exist", volume, path))),
      StagingOp::WriteFile { path, contents } => {
        files.insert(normalize(&path), contents);
        Ok(Vec::new())
      }
      StagingOp::ExtractArchive { target_path, archive } => {
        extract(files, &target_path, &archive)?;
        Ok(Vec::new())
      }
      StagingOp::RemovePaths { target_path, paths } => {
        for rel in &paths {
          let full = join(&target_path, rel);
          let prefix = format!("{}/", full);
          files.retain(|path, _| *path != full && !path.starts_with(&prefix));
        }
        Ok(Vec::new())
      }
      op @ StagingOp::ApplyOwnership { .. } => {
        ctx.ownership.push((volume.to_string(), op));
        Ok(Vec::new())
      }
    }
  }

  async fn discover_attached_services(&self, endpoint: &Endpoint, volume: &str) -> Result<Vec<String>> {
    let mut inner = self.lock();
    enter(&mut inner, "discover_attached_services", endpoint, volume)?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    let mut services: Vec<String> = ctx
      .containers
      .iter()
      .filter(|c| c.identifier == endpoint.identifier && c.volumes.iter().any(|v| v == volume))
      .map(|c| c.service.clone())
      .collect();
    services.sort();
    services.dedup();
    Ok(services)
  }

  async fn restart_services(&self, endpoint: &Endpoint, services: &[String]) -> Result<()> {
    let mut inner = self.lock();
    enter(&mut inner, "restart_services", endpoint, &services.join(","))?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    for c in ctx.containers.iter_mut() {
      if c.identifier == endpoint.identifier && services.contains(&c.service) {
        c.running = true;
      }
    }
    Ok(())
  }

  async fn stop_services(&self, endpoint: &Endpoint, services: &[String]) -> Result<()> {
    let mut inner = self.lock();
    enter(&mut inner, "stop_services", endpoint, &services.join(","))?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    for c in ctx.containers.iter_mut() {
      if c.identifier == endpoint.identifier && services.contains(&c.service) {
        c.running = false;
      }
    }
    Ok(())
  }

  async fn start_services(&self, endpoint: &Endpoint, services: &[String]) -> Result<()> {
    let mut inner = self.lock();
    enter(&mut inner, "start_services", endpoint, &services.join(","))?;
    let ctx = inner.contexts.entry(endpoint.name.clone()).or_default();
    for c in ctx.containers.iter_mut() {
      if c.identifier == endpoint.identifier && services.contains(&c.service) {
        c.running = true;
      }
    }
    Ok(())
  }
}
