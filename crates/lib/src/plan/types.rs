//! Plan data types.
//!
//! A [`Plan`] is sealed at construction: it is built from a finished action vector and
//! offers no mutating API, so executors run exactly what the caller inspected.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::drift::ResolvedEnv;
use crate::error::{Error, Result};
use crate::fileset::{FileManifest, FilesetDiff};
use crate::state::{Endpoint, FilesetSpec, NetworkSpec, StackSpec, VolumeSpec};

const OP: &str = "plan.validate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
  Create,
  Update,
  Delete,
}

impl ActionKind {
  /// `+`, `~` or `-`.
  pub fn symbol(&self) -> &'static str {
    match self {
      ActionKind::Create => "+",
      ActionKind::Update => "~",
      ActionKind::Delete => "-",
    }
  }

  pub fn is_delete(&self) -> bool {
    matches!(self, ActionKind::Delete)
  }
}

/// Resource kinds in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
  Network,
  Volume,
  Stack,
  Fileset,
}

impl ResourceType {
  /// Position in the create order. Deletes walk it backwards.
  pub fn rank(&self) -> u8 {
    match self {
      ResourceType::Network => 0,
      ResourceType::Volume => 1,
      ResourceType::Stack => 2,
      ResourceType::Fileset => 3,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceType::Network => "network",
      ResourceType::Volume => "volume",
      ResourceType::Stack => "stack",
      ResourceType::Fileset => "fileset",
    }
  }

  /// Plural heading used when rendering.
  pub fn heading(&self) -> &'static str {
    match self {
      ResourceType::Network => "networks",
      ResourceType::Volume => "volumes",
      ResourceType::Stack => "stacks",
      ResourceType::Fileset => "filesets",
    }
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Everything a fileset sync needs.
#[derive(Debug, Clone, PartialEq)]
pub struct FilesetPayload {
  pub spec: FilesetSpec,
  pub diff: FilesetDiff,
  /// Local manifest, written as the sentinel once the sync succeeds.
  pub manifest: FileManifest,
  /// The declared uid/gid differ from the ones recorded in the remote sentinel.
  pub ownership_changed: bool,
}

/// Data an action carries into execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
  /// Deletes only need the key.
  None,
  Network(NetworkSpec),
  Volume(VolumeSpec),
  Stack { spec: StackSpec, env: ResolvedEnv },
  Fileset(Box<FilesetPayload>),
}

/// One planned change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
  pub kind: ActionKind,
  pub resource: ResourceType,
  pub context: String,
  /// Resource name; the compose project for stack deletes.
  pub key: String,
  pub reason: String,
  #[serde(skip)]
  pub payload: Payload,
}

impl Action {
  pub fn new(
    kind: ActionKind,
    resource: ResourceType,
    context: impl Into<String>,
    key: impl Into<String>,
    reason: impl Into<String>,
    payload: Payload,
  ) -> Self {
    Self {
      kind,
      resource,
      context: context.into(),
      key: key.into(),
      reason: reason.into(),
      payload,
    }
  }

  /// Progress label, e.g. `+ network default/demo-network`.
  pub fn label(&self) -> String {
    format!("{} {} {}/{}", self.kind.symbol(), self.resource, self.context, self.key)
  }

  /// Sort position inside a context: deletes first in reverse rank, then creates and
  /// updates in rank order.
  pub fn phase_key(&self) -> (u8, u8) {
    if self.kind.is_delete() {
      (0, 3 - self.resource.rank())
    } else {
      (1, self.resource.rank())
    }
  }

  fn check_payload(&self) -> Result<()> {
    let ok = match (self.resource, self.kind, &self.payload) {
      (_, ActionKind::Delete, _) => self.resource != ResourceType::Fileset,
      (ResourceType::Network, _, Payload::Network(_)) => true,
      (ResourceType::Volume, ActionKind::Create, Payload::Volume(_)) => true,
      (ResourceType::Stack, _, Payload::Stack { .. }) => true,
      (ResourceType::Fileset, ActionKind::Update, Payload::Fileset(_)) => true,
      _ => false,
    };
    if ok {
      Ok(())
    } else {
      Err(Error::invalid_input(
        OP,
        format!("action {} has no executable form", self.label()),
      ))
    }
  }
}

/// An ordered, immutable list of actions plus the endpoints they target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
  actions: Vec<Action>,
  endpoints: BTreeMap<String, Endpoint>,
}

impl Plan {
  /// Seal a finished action list.
  pub fn from_actions(actions: Vec<Action>, endpoints: BTreeMap<String, Endpoint>) -> Self {
    Self { actions, endpoints }
  }

  pub fn actions(&self) -> &[Action] {
    &self.actions
  }

  pub fn endpoint(&self, context: &str) -> Option<&Endpoint> {
    self.endpoints.get(context)
  }

  /// Contexts with at least one action, in name order.
  pub fn contexts(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.actions.iter().map(|a| a.context.as_str()).collect();
    names.sort();
    names.dedup();
    names
  }

  pub fn is_empty(&self) -> bool {
    self.actions.is_empty()
  }

  pub fn len(&self) -> usize {
    self.actions.len()
  }

  /// `(create, update, delete)` counts.
  pub fn count_actions(&self) -> (usize, usize, usize) {
    self.actions.iter().fold((0, 0, 0), |(c, u, d), a| match a.kind {
      ActionKind::Create => (c + 1, u, d),
      ActionKind::Update => (c, u + 1, d),
      ActionKind::Delete => (c, u, d + 1),
    })
  }

  pub fn is_delete_only(&self) -> bool {
    self.actions.iter().all(|a| a.kind.is_delete())
  }

  /// Check the structural invariants executors rely on.
  ///
  /// # Errors
  ///
  /// `InvalidInput` when a key repeats within a context and resource type, when a
  /// context's actions are out of dependency order, when an action targets a context
  /// with no endpoint, or when an action cannot be executed.
  pub fn validate(&self) -> Result<()> {
    let mut seen = HashSet::new();
    let mut last_phase: BTreeMap<&str, (u8, u8)> = BTreeMap::new();

    for action in &self.actions {
      if !self.endpoints.contains_key(&action.context) {
        return Err(Error::invalid_input(
          OP,
          format!("action {} targets unknown context", action.label()),
        ));
      }
      if !seen.insert((action.context.as_str(), action.resource, action.key.as_str())) {
        return Err(Error::invalid_input(
          OP,
          format!("duplicate action for {} {}/{}", action.resource, action.context, action.key),
        ));
      }

      let phase = action.phase_key();
      if let Some(previous) = last_phase.get(action.context.as_str())
        && phase < *previous
      {
        return Err(Error::invalid_input(
          OP,
          format!("action {} is out of dependency order", action.label()),
        ));
      }
      last_phase.insert(action.context.as_str(), phase);

      action.check_payload()?;
    }

    Ok(())
  }
}
