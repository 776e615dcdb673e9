//! Fileset sync engine.
//!
//! Pure, leaf-level functions for fingerprinting a local tree and diffing it against the
//! manifest persisted in a remote volume. Byte transfer happens at apply time in
//! [`crate::execute`].

pub mod diff;
pub mod exclude;
pub mod manifest;

pub use diff::{FilesetDiff, diff};
pub use exclude::{ExcludeMatcher, normalize_patterns};
pub use manifest::{
  FileEntry, FileManifest, MANIFEST_VERSION, SENTINEL_FILENAME, build_manifest, compute_tree_hash,
  sentinel_path,
};
