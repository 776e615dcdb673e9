//! Desired state: the normalized, validated form of the configuration document.
//!
//! Everything here is plain data. All paths are absolute by the time a value of these
//! types reaches the engine; [`crate::config`] performs that normalization.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Label stamped on every runtime object dockform creates.
pub const IDENTIFIER_LABEL: &str = "io.dockform.identifier";

/// The complete desired state for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredState {
  /// Contexts keyed by name.
  pub contexts: BTreeMap<String, ContextSpec>,
}

impl DesiredState {
  /// Look up a context by name.
  pub fn context(&self, name: &str) -> Option<&ContextSpec> {
    self.contexts.get(name)
  }
}

/// Identity of one container-runtime endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
  /// Context name as declared in the document.
  pub name: String,
  /// Docker context used to reach the daemon.
  pub docker_context: String,
  /// Ownership label value scoping discovery, prune and destroy.
  pub identifier: String,
}

impl Endpoint {
  pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
    let name = name.into();
    Self {
      docker_context: name.clone(),
      name,
      identifier: identifier.into(),
    }
  }

  /// The `key=value` label filter selecting owned objects.
  pub fn label_filter(&self) -> String {
    format!("{}={}", IDENTIFIER_LABEL, self.identifier)
  }
}

/// Everything declared for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSpec {
  pub endpoint: Endpoint,
  #[serde(default)]
  pub networks: BTreeMap<String, NetworkSpec>,
  #[serde(default)]
  pub volumes: BTreeMap<String, VolumeSpec>,
  #[serde(default)]
  pub stacks: BTreeMap<String, StackSpec>,
  #[serde(default)]
  pub filesets: BTreeMap<String, FilesetSpec>,
}

impl ContextSpec {
  pub fn new(endpoint: Endpoint) -> Self {
    Self {
      endpoint,
      networks: BTreeMap::new(),
      volumes: BTreeMap::new(),
      stacks: BTreeMap::new(),
      filesets: BTreeMap::new(),
    }
  }
}

/// What to do when an existing network differs from its declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
  /// Fail the plan build.
  #[default]
  Error,
  /// Delete and recreate the network.
  Recreate,
  /// Accept the drift silently.
  Ignore,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
  pub name: String,
  #[serde(default)]
  pub driver: Option<String>,
  #[serde(default)]
  pub subnet: Option<String>,
  #[serde(default)]
  pub gateway: Option<String>,
  #[serde(default)]
  pub ip_range: Option<String>,
  #[serde(default)]
  pub internal: bool,
  #[serde(default)]
  pub attachable: bool,
  #[serde(default)]
  pub ipv6: bool,
  #[serde(default)]
  pub options: BTreeMap<String, String>,
  #[serde(default)]
  pub on_mismatch: MismatchPolicy,
}

impl NetworkSpec {
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Default::default()
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
  pub name: String,
  #[serde(default)]
  pub driver: Option<String>,
}

impl VolumeSpec {
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      driver: None,
    }
  }
}

/// One layer of environment: dotenv files followed by inline pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSources {
  #[serde(default)]
  pub files: Vec<PathBuf>,
  #[serde(default)]
  pub inline: Vec<(String, String)>,
}

impl EnvSources {
  pub fn is_empty(&self) -> bool {
    self.files.is_empty() && self.inline.is_empty()
  }
}

/// A compose application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSpec {
  pub name: String,
  /// Working directory for compose.
  pub root: PathBuf,
  /// Compose files, relative to `root` or absolute.
  #[serde(default)]
  pub files: Vec<PathBuf>,
  #[serde(default)]
  pub profiles: Vec<String>,
  /// Compose project name; defaults to `name`.
  #[serde(default)]
  pub project: Option<String>,
  /// Document-level environment, lowest precedence.
  #[serde(default)]
  pub root_env: EnvSources,
  #[serde(default)]
  pub env: EnvSources,
  /// Document-level SOPS files.
  #[serde(default)]
  pub root_secrets: Vec<PathBuf>,
  #[serde(default)]
  pub secrets: Vec<PathBuf>,
}

impl StackSpec {
  pub fn project_name(&self) -> &str {
    self.project.as_deref().unwrap_or(&self.name)
  }
}

/// Ownership and permission policy applied after a fileset sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
  #[serde(default)]
  pub uid: Option<u32>,
  #[serde(default)]
  pub gid: Option<u32>,
  #[serde(default)]
  pub file_mode: Option<u32>,
  #[serde(default)]
  pub dir_mode: Option<u32>,
  /// Only touch paths written by this sync.
  #[serde(default)]
  pub preserve_existing: bool,
}

impl Ownership {
  pub fn is_empty(&self) -> bool {
    self.uid.is_none() && self.gid.is_none() && self.file_mode.is_none() && self.dir_mode.is_none()
  }
}

/// Services restarted after a fileset changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartTarget {
  /// Every service mounting the target volume.
  Attached,
  /// An explicit list; empty means restart nothing.
  Services(Vec<String>),
}

impl Default for RestartTarget {
  fn default() -> Self {
    RestartTarget::Services(Vec::new())
  }
}

impl RestartTarget {
  pub fn is_none(&self) -> bool {
    matches!(self, RestartTarget::Services(s) if s.is_empty())
  }
}

/// When restart targets are touched relative to the copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
  /// Copy while services run, restart afterwards.
  #[default]
  Hot,
  /// Stop services, copy, start them again.
  Cold,
}

/// A local directory mirrored into a path inside a volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetSpec {
  pub name: String,
  pub source: PathBuf,
  pub target_volume: String,
  /// Absolute path inside the volume mount.
  pub target_path: String,
  #[serde(default)]
  pub exclude: Vec<String>,
  #[serde(default)]
  pub ownership: Ownership,
  #[serde(default)]
  pub restart: RestartTarget,
  #[serde(default)]
  pub apply_mode: ApplyMode,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn endpoint_defaults_docker_context_to_name() {
    let ep = Endpoint::new("prod", "demo");
    assert_eq!(ep.docker_context, "prod");
    assert_eq!(ep.label_filter(), "io.dockform.identifier=demo");
  }

  #[test]
  fn project_name_falls_back_to_stack_name() {
    let mut stack = StackSpec {
      name: "web".to_string(),
      ..Default::default()
    };
    assert_eq!(stack.project_name(), "web");
    stack.project = Some("web-prod".to_string());
    assert_eq!(stack.project_name(), "web-prod");
  }

  #[test]
  fn restart_target_default_is_none() {
    assert!(RestartTarget::default().is_none());
    assert!(!RestartTarget::Attached.is_none());
    assert!(!RestartTarget::Services(vec!["web".to_string()]).is_none());
  }
}
