//! Desired and actual state models.

pub mod actual;
pub mod desired;

pub use actual::{ActualState, NetworkInfo, ServiceState, VolumeInfo};
pub use desired::{
  ApplyMode, ContextSpec, DesiredState, Endpoint, EnvSources, FilesetSpec, IDENTIFIER_LABEL, MismatchPolicy,
  NetworkSpec, Ownership, RestartTarget, StackSpec, VolumeSpec,
};
