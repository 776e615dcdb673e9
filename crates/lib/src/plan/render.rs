//! Human-readable plan rendering.
//!
//! ```text
//! default
//!   networks
//!     + demo-network
//!   filesets
//!     ~ assets (1 to create, 1 to update, 1 to delete)
//!
//! Plan: 1 to create, 1 to update, 0 to delete.
//! ```

use std::fmt;

use super::types::{Plan, ResourceType};

impl fmt::Display for Plan {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_empty() {
      return writeln!(f, "No changes.");
    }

    let mut context: Option<&str> = None;
    let mut resource: Option<ResourceType> = None;
    for action in self.actions() {
      if context != Some(action.context.as_str()) {
        if context.is_some() {
          writeln!(f)?;
        }
        writeln!(f, "{}", action.context)?;
        context = Some(action.context.as_str());
        resource = None;
      }
      if resource != Some(action.resource) {
        writeln!(f, "  {}", action.resource.heading())?;
        resource = Some(action.resource);
      }

      write!(f, "    {} {}", action.kind.symbol(), action.key)?;
      if !action.reason.is_empty() {
        write!(f, " ({})", action.reason)?;
      }
      writeln!(f)?;
    }

    let (create, update, delete) = self.count_actions();
    writeln!(f)?;
    writeln!(
      f,
      "Plan: {} to create, {} to update, {} to delete.",
      create, update, delete
    )
  }
}
