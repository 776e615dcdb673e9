//! Plan execution.
//!
//! This module provides the entry points that turn a sealed plan into runtime calls:
//! - [`apply`]: run a plan, phase by phase, collecting failures
//! - [`prune`] / [`destroy`]: build and run a delete-only plan with strict or tolerant
//!   failure handling
//! - [`cleanup`]: run an already inspected delete-only plan
//!
//! Contexts are independent failure domains. Within a context, consecutive actions of
//! the same resource type and direction form a phase; phases run in plan order and the
//! actions inside a phase run concurrently, bounded by a semaphore shared by all
//! contexts.

pub mod apply;
pub mod cleanup;
pub mod fileset;
pub mod types;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub use apply::apply;
pub use cleanup::{cleanup, destroy, prune};
pub use types::{ApplyReport, CleanupOptions, CleanupReport, ExecuteConfig, ExecutionMode, SkipReason};

/// Fail with `Cancelled` once `cancel` has fired.
pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken, op: &str) -> Result<()> {
  if cancel.is_cancelled() {
    Err(Error::cancelled(op))
  } else {
    Ok(())
  }
}
