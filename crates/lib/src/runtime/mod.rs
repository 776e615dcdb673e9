//! The container-runtime seam.
//!
//! The engine only ever talks to a runtime through the [`Runtime`] trait. Two
//! implementations ship with the crate:
//! - [`docker::DockerCli`]: drives the `docker` CLI against a docker context
//! - [`memory::MemoryRuntime`]: an in-memory double used by tests and dry exercises
//!
//! All queries are scoped by the endpoint's identifier label, so unrelated resources on
//! the same daemon are never visible to the engine.

pub mod docker;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::drift::ResolvedEnv;
use crate::error::Result;
use crate::state::{Endpoint, NetworkInfo, NetworkSpec, ServiceState, StackSpec, VolumeInfo, VolumeSpec};

/// Mount point of the target volume inside the staging container.
pub const STAGING_MOUNT: &str = "/dockform";

/// An operation executed inside a short-lived staging container that mounts a volume.
///
/// Paths are absolute paths within the volume (the fileset target path space).
#[derive(Clone, PartialEq, Eq)]
pub enum StagingOp {
  /// Read a file; a missing file is `NotFound`.
  ReadFile { path: String },
  /// Write (replace) a single file.
  WriteFile { path: String, contents: Vec<u8> },
  /// Extract a tar archive into `target_path`, creating it if needed.
  ExtractArchive { target_path: String, archive: Vec<u8> },
  /// Remove paths relative to `target_path`. Missing paths are ignored.
  RemovePaths { target_path: String, paths: Vec<String> },
  /// Apply ownership and permission bits. `paths` empty means the whole tree.
  ApplyOwnership {
    target_path: String,
    uid: Option<u32>,
    gid: Option<u32>,
    file_mode: Option<u32>,
    dir_mode: Option<u32>,
    paths: Vec<String>,
  },
}

impl StagingOp {
  /// Short name for logs.
  pub fn name(&self) -> &'static str {
    match self {
      StagingOp::ReadFile { .. } => "read_file",
      StagingOp::WriteFile { .. } => "write_file",
      StagingOp::ExtractArchive { .. } => "extract_archive",
      StagingOp::RemovePaths { .. } => "remove_paths",
      StagingOp::ApplyOwnership { .. } => "apply_ownership",
    }
  }
}

impl std::fmt::Debug for StagingOp {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      StagingOp::ReadFile { path } => f.debug_struct("ReadFile").field("path", path).finish(),
      StagingOp::WriteFile { path, contents } => f
        .debug_struct("WriteFile")
        .field("path", path)
        .field("bytes", &contents.len())
        .finish(),
      StagingOp::ExtractArchive { target_path, archive } => f
        .debug_struct("ExtractArchive")
        .field("target_path", target_path)
        .field("bytes", &archive.len())
        .finish(),
      StagingOp::RemovePaths { target_path, paths } => f
        .debug_struct("RemovePaths")
        .field("target_path", target_path)
        .field("paths", paths)
        .finish(),
      StagingOp::ApplyOwnership {
        target_path,
        uid,
        gid,
        file_mode,
        dir_mode,
        paths,
      } => f
        .debug_struct("ApplyOwnership")
        .field("target_path", target_path)
        .field("uid", uid)
        .field("gid", gid)
        .field("file_mode", &file_mode.map(|m| format!("{:o}", m)))
        .field("dir_mode", &dir_mode.map(|m| format!("{:o}", m)))
        .field("paths", &paths.len())
        .finish(),
    }
  }
}

/// Primitives the engine needs from a container runtime.
///
/// Create calls must stamp the endpoint's identifier label on the created object.
/// Delete calls on objects that no longer exist should succeed.
#[async_trait]
pub trait Runtime: Send + Sync {
  async fn list_networks(&self, endpoint: &Endpoint) -> Result<Vec<NetworkInfo>>;
  async fn list_volumes(&self, endpoint: &Endpoint) -> Result<Vec<VolumeInfo>>;
  /// Containers of owned compose projects, stopped ones included.
  async fn list_services(&self, endpoint: &Endpoint) -> Result<Vec<ServiceState>>;

  async fn create_network(&self, endpoint: &Endpoint, spec: &NetworkSpec) -> Result<()>;
  async fn delete_network(&self, endpoint: &Endpoint, name: &str) -> Result<()>;
  async fn create_volume(&self, endpoint: &Endpoint, spec: &VolumeSpec) -> Result<()>;
  async fn delete_volume(&self, endpoint: &Endpoint, name: &str) -> Result<()>;

  /// Bring a stack up, recreating services whose configuration changed.
  async fn compose_up(&self, endpoint: &Endpoint, stack: &StackSpec, env: &ResolvedEnv) -> Result<()>;
  /// Tear down a compose project by name.
  async fn compose_down(&self, endpoint: &Endpoint, project: &str) -> Result<()>;
  /// Canonical configuration hash of every service the stack declares.
  async fn compose_config_hash(
    &self,
    endpoint: &Endpoint,
    stack: &StackSpec,
    env: &ResolvedEnv,
  ) -> Result<BTreeMap<String, String>>;

  /// Run `op` in a staging container with `volume` mounted. Returns the op's stdout.
  async fn run_staging(&self, endpoint: &Endpoint, volume: &str, op: StagingOp) -> Result<Vec<u8>>;
  /// Compose service names of owned containers whose mounts include `volume`.
  async fn discover_attached_services(&self, endpoint: &Endpoint, volume: &str) -> Result<Vec<String>>;
  /// Restart owned containers of the named compose services.
  async fn restart_services(&self, endpoint: &Endpoint, services: &[String]) -> Result<()>;
  async fn stop_services(&self, endpoint: &Endpoint, services: &[String]) -> Result<()>;
  async fn start_services(&self, endpoint: &Endpoint, services: &[String]) -> Result<()>;
}

/// Join a volume-relative path onto the staging mount point.
pub fn staging_path(path: &str) -> String {
  let trimmed = path.trim_start_matches('/');
  if trimmed.is_empty() {
    STAGING_MOUNT.to_string()
  } else {
    format!("{}/{}", STAGING_MOUNT, trimmed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn staging_path_joins_under_mount() {
    assert_eq!(staging_path("/srv/assets"), "/dockform/srv/assets");
    assert_eq!(staging_path("srv"), "/dockform/srv");
    assert_eq!(staging_path("/"), "/dockform");
  }

  #[test]
  fn debug_hides_payload_bytes() {
    let op = StagingOp::WriteFile {
      path: "/a".to_string(),
      contents: vec![1, 2, 3],
    };
    let shown = format!("{:?}", op);
    assert!(shown.contains("bytes: 3"));
    assert_eq!(op.name(), "write_file");
  }
}
