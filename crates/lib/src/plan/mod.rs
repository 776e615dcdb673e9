//! Plans: the ordered list of changes that converges actual state to desired state.
//!
//! [`builder`] computes plans from desired state and a runtime, [`types`] holds the
//! sealed [`Plan`] value and [`render`] prints it for humans.

pub mod builder;
pub mod render;
pub mod types;

pub use builder::{build_destroy_plan, build_plan, build_prune_plan};
pub use types::{Action, ActionKind, FilesetPayload, Payload, Plan, ResourceType};
