//! Diff computation between a local and a remote file manifest.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::manifest::{FileEntry, FileManifest};

/// Changes needed to make the remote tree match the local one.
///
/// Derived, never persisted; consumed once by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetDiff {
  /// Local-only files, sorted by path.
  pub to_create: Vec<FileEntry>,
  /// Files present on both sides with differing size or digest, sorted by path.
  pub to_update: Vec<FileEntry>,
  /// Remote-only paths, sorted.
  pub to_delete: Vec<String>,
}

impl FilesetDiff {
  pub fn is_empty(&self) -> bool {
    self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
  }

  /// Number of changed paths.
  pub fn len(&self) -> usize {
    self.to_create.len() + self.to_update.len() + self.to_delete.len()
  }

  /// Files that must be copied (created or updated), in path order.
  pub fn files_to_copy(&self) -> impl Iterator<Item = &FileEntry> {
    self.to_create.iter().chain(self.to_update.iter())
  }

  /// One-line summary, e.g. `1 to create, 1 to update, 1 to delete`.
  pub fn summary(&self) -> String {
    format!(
      "{} to create, {} to update, {} to delete",
      self.to_create.len(),
      self.to_update.len(),
      self.to_delete.len()
    )
  }
}

/// Compute what must change remotely for the remote tree to equal the local one.
///
/// When both tree hashes are non-empty and equal the manifests are identical by
/// definition and the entries are not compared at all.
pub fn diff(local: &FileManifest, remote: &FileManifest) -> FilesetDiff {
  if !local.tree_hash.is_empty() && local.tree_hash == remote.tree_hash {
    return FilesetDiff::default();
  }

  let local_index: HashMap<&str, &FileEntry> = local.files.iter().map(|f| (f.path.as_str(), f)).collect();
  let remote_index: HashMap<&str, &FileEntry> = remote.files.iter().map(|f| (f.path.as_str(), f)).collect();

  let mut out = FilesetDiff::default();

  for (path, entry) in &local_index {
    match remote_index.get(path) {
      None => out.to_create.push((*entry).clone()),
      Some(theirs) if theirs.size != entry.size || theirs.sha256 != entry.sha256 => {
        out.to_update.push((*entry).clone());
      }
      Some(_) => {}
    }
  }

  for path in remote_index.keys() {
    if !local_index.contains_key(path) {
      out.to_delete.push((*path).to_string());
    }
  }

  out.to_create.sort_by(|a, b| a.path.cmp(&b.path));
  out.to_update.sort_by(|a, b| a.path.cmp(&b.path));
  out.to_delete.sort();
  out
}
