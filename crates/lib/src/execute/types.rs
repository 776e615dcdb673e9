//! Configuration and result types for plan execution.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether independent work runs concurrently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
  /// One context and one action at a time.
  Sequential,
  #[default]
  Parallel,
}

/// Configuration shared by the plan builder and the executors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteConfig {
  pub mode: ExecutionMode,

  /// Maximum number of actions in flight across all contexts.
  pub parallelism: usize,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      mode: ExecutionMode::Parallel,
      parallelism: num_cpus(),
    }
  }
}

impl ExecuteConfig {
  pub fn sequential() -> Self {
    Self {
      mode: ExecutionMode::Sequential,
      parallelism: 1,
    }
  }

  /// Semaphore permits actually used: 1 when sequential, never 0.
  pub fn permits(&self) -> usize {
    match self.mode {
      ExecutionMode::Sequential => 1,
      ExecutionMode::Parallel => self.parallelism.max(1),
    }
  }

  pub fn is_parallel(&self) -> bool {
    self.mode == ExecutionMode::Parallel
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// Options for prune and destroy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOptions {
  /// Fail the call when any deletion fails. Otherwise failures become warnings.
  pub strict: bool,
  /// Report every failure instead of a one-line summary.
  pub verbose_errors: bool,
}

/// Why an action was not attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
  /// The fileset's target volume failed to be created in this run.
  VolumeFailed(String),
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipReason::VolumeFailed(volume) => write!(f, "volume {} was not created", volume),
    }
  }
}

/// Outcome of a successful apply.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
  /// Labels of completed actions, in completion order.
  pub applied: Vec<String>,
  pub elapsed: Duration,
}

/// Outcome of a prune or destroy.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
  /// Labels of completed deletions.
  pub deleted: Vec<String>,
  /// Tolerated failures (non-strict mode only).
  pub warnings: Vec<String>,
  pub elapsed: Duration,
}

impl CleanupReport {
  pub fn is_clean(&self) -> bool {
    self.warnings.is_empty()
  }
}
