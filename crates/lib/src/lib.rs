//! dockform-lib: declarative management of Docker resources
//!
//! A YAML document declares, per docker context, the networks, volumes, compose stacks
//! and filesets (local directories mirrored into volumes) that should exist. The engine:
//! - `config`: loads and normalizes the document into a `DesiredState`
//! - `plan`: compares desired against discovered state and produces an ordered `Plan`
//! - `execute`: applies a plan, or prunes and destroys owned resources
//! - `fileset`: fingerprints trees and diffs them against the in-volume sentinel
//! - `drift`: resolves stack environments and detects compose configuration drift
//!
//! All runtime access goes through the `runtime::Runtime` trait. Everything dockform
//! creates carries the `io.dockform.identifier` label, and only labeled resources are
//! ever listed, pruned or destroyed.

pub mod config;
pub mod drift;
pub mod error;
pub mod execute;
pub mod fileset;
pub mod plan;
pub mod progress;
pub mod runtime;
pub mod secrets;
pub mod state;
pub mod util;

pub use error::{Error, ErrorKind, ErrorList, Result};
