//! Helpers shared by the manifest, drift and runtime code: digests and subprocesses.

pub mod hash;
pub mod process;
