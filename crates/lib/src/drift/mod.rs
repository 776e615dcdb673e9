//! Drift detection for compose stacks.
//!
//! A stack has drifted when the configuration hash compose would compute for a service
//! today differs from the hash recorded on its running container, or when a declared
//! service has no running container at all. Hash computation is delegated to the
//! runtime; this module only resolves the environment that feeds it and compares the
//! results.

pub mod env;

pub use env::{load_env_file, merge_env, parse_dotenv, resolve};

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::runtime::Runtime;
use crate::state::{Endpoint, StackSpec};

/// The fully merged environment of one stack, in first-declared key order.
///
/// Values may hold decrypted secrets, so `Debug` prints keys only.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolvedEnv {
  pairs: Vec<(String, String)>,
}

impl ResolvedEnv {
  /// Wrap already-merged pairs. Keys are expected to be unique.
  pub fn new(pairs: Vec<(String, String)>) -> Self {
    Self { pairs }
  }

  pub fn pairs(&self) -> &[(String, String)] {
    &self.pairs
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.pairs.iter().map(|(k, _)| k.as_str())
  }

  pub fn len(&self) -> usize {
    self.pairs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pairs.is_empty()
  }
}

impl fmt::Debug for ResolvedEnv {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut map = f.debug_map();
    for (key, _) in &self.pairs {
      map.entry(key, &"<redacted>");
    }
    map.finish()
  }
}

/// Drift status of one declared service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
  /// Declared but no running container.
  Missing,
  Unchanged,
  Changed { desired: String, actual: String },
}

/// Per-service drift of one stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackDrift {
  pub services: BTreeMap<String, ServiceStatus>,
  /// Running services the stack no longer declares, in name order.
  pub orphans: Vec<String>,
}

impl StackDrift {
  /// True when every declared service runs with its desired hash and nothing else runs.
  pub fn is_unchanged(&self) -> bool {
    self.orphans.is_empty() && self.services.values().all(|s| *s == ServiceStatus::Unchanged)
  }

  /// True when services are declared and none of them runs.
  pub fn is_absent(&self) -> bool {
    !self.services.is_empty() && self.services.values().all(|s| *s == ServiceStatus::Missing)
  }

  /// Services that are missing or changed, in name order.
  pub fn drifted(&self) -> Vec<&str> {
    self
      .services
      .iter()
      .filter(|(_, s)| **s != ServiceStatus::Unchanged)
      .map(|(name, _)| name.as_str())
      .collect()
  }

  /// Human-readable reason, e.g. `changed: web; missing: worker; orphaned: legacy`.
  pub fn summary(&self) -> String {
    let mut changed = Vec::new();
    let mut missing = Vec::new();
    for (name, status) in &self.services {
      match status {
        ServiceStatus::Changed { .. } => changed.push(name.as_str()),
        ServiceStatus::Missing => missing.push(name.as_str()),
        ServiceStatus::Unchanged => {}
      }
    }

    let mut parts = Vec::new();
    if !changed.is_empty() {
      parts.push(format!("changed: {}", changed.join(", ")));
    }
    if !missing.is_empty() {
      parts.push(format!("missing: {}", missing.join(", ")));
    }
    if !self.orphans.is_empty() {
      parts.push(format!("orphaned: {}", self.orphans.join(", ")));
    }
    if parts.is_empty() {
      "up to date".to_string()
    } else {
      parts.join("; ")
    }
  }
}

/// Compare desired per-service hashes with the hashes of running containers.
///
/// Running services that the stack no longer declares are reported as orphans; the
/// compose up that converges the stack removes them.
pub fn classify(desired: &BTreeMap<String, String>, running: &BTreeMap<String, String>) -> StackDrift {
  let services = desired
    .iter()
    .map(|(service, want)| {
      let status = match running.get(service) {
        None => ServiceStatus::Missing,
        Some(have) if have == want => ServiceStatus::Unchanged,
        Some(have) => ServiceStatus::Changed {
          desired: want.clone(),
          actual: have.clone(),
        },
      };
      (service.clone(), status)
    })
    .collect();
  let orphans = running.keys().filter(|s| !desired.contains_key(*s)).cloned().collect();
  StackDrift { services, orphans }
}

/// Desired configuration hash of every service in `stack`.
pub async fn hash(
  runtime: &dyn Runtime,
  endpoint: &Endpoint,
  stack: &StackSpec,
  env: &ResolvedEnv,
) -> Result<BTreeMap<String, String>> {
  runtime.compose_config_hash(endpoint, stack, env).await
}
