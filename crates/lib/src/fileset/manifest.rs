//! File manifests: a content-addressed fingerprint of a directory tree.
//!
//! A manifest is built fresh from the local source tree on every sync attempt and is
//! compared against the sentinel manifest persisted inside the target volume by the
//! previous apply.
//!
//! # Sentinel format
//!
//! ```json
//! {
//!   "version": "1",
//!   "target_path": "/srv/assets",
//!   "created_at": "2024-01-01T00:00:00Z",
//!   "exclude": ["build/**"],
//!   "uid": 1000,
//!   "gid": 1000,
//!   "files": [{ "path": "a.txt", "size": 1, "sha256": "..." }],
//!   "tree_hash": "..."
//! }
//! ```
//!
//! Old sentinels must stay readable: unknown fields are ignored and missing fields
//! default to empty.

use std::path::{Component, Path};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::exclude::ExcludeMatcher;
use crate::error::{Error, Result};
use crate::util::hash::{TreeHasher, hash_file};

/// Name of the sentinel file written at the root of the synced target path.
pub const SENTINEL_FILENAME: &str = ".dockform-sync.json";

/// Current manifest schema version.
pub const MANIFEST_VERSION: &str = "1";

const OP: &str = "fileset.build_manifest";

/// Volume path of the sentinel for a fileset synced to `target_path`.
pub fn sentinel_path(target_path: &str) -> String {
  format!("{}/{}", target_path.trim_end_matches('/'), SENTINEL_FILENAME)
}

/// One regular file in a tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
  /// Slash-separated path relative to the tree root.
  #[serde(default)]
  pub path: String,
  #[serde(default)]
  pub size: u64,
  /// Lowercase hex SHA-256 of the contents.
  #[serde(default)]
  pub sha256: String,
}

/// Fingerprint of an entire tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
  #[serde(default)]
  pub version: String,
  #[serde(default)]
  pub target_path: String,
  #[serde(default)]
  pub created_at: String,
  #[serde(default)]
  pub exclude: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub uid: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gid: Option<u32>,
  /// Entries sorted by path.
  #[serde(default)]
  pub files: Vec<FileEntry>,
  #[serde(default)]
  pub tree_hash: String,
}

impl FileManifest {
  /// Assemble a manifest from entries, sorting them and computing the tree hash.
  pub fn from_entries(target_path: &str, exclude: Vec<String>, mut files: Vec<FileEntry>) -> Self {
    files.sort_by(|a, b| a.path.cmp(&b.path));
    let tree_hash = compute_tree_hash(&files);
    Self {
      version: MANIFEST_VERSION.to_string(),
      target_path: target_path.to_string(),
      created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
      exclude,
      uid: None,
      gid: None,
      files,
      tree_hash,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }

  /// Parse a sentinel. Blank input yields an empty manifest (first sync).
  pub fn from_json(data: &str) -> Result<Self> {
    if data.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_json::from_str(data)
      .map_err(|e| Error::invalid_input("fileset.parse_manifest", format!("malformed sentinel: {}", e)).with_source(e))
  }

  pub fn to_json(&self) -> Result<String> {
    serde_json::to_string_pretty(self).map_err(|e| Error::internal("fileset.serialize_manifest", e.to_string()))
  }

  /// Total size of all entries in bytes.
  pub fn total_size(&self) -> u64 {
    self.files.iter().map(|f| f.size).sum()
  }
}

/// Tree hash over entries already sorted by path.
pub fn compute_tree_hash(files: &[FileEntry]) -> String {
  let mut tree = TreeHasher::new();
  for entry in files {
    tree.add(&entry.path, entry.size, &entry.sha256);
  }
  tree.finish()
}

/// Walk `source_dir` and fingerprint every regular file that is not excluded.
///
/// # Arguments
///
/// * `source_dir` - Local directory to walk
/// * `target_path` - Path inside the volume the tree is synced to (recorded only)
/// * `exclude` - Raw exclude patterns, normalized before matching
///
/// # Behavior
///
/// - Excluded directories are pruned and never descended into
/// - Symlinks are skipped, never followed or recorded
/// - Sockets, devices and other non-regular files are skipped
/// - The sentinel file name is always excluded
///
/// # Errors
///
/// `NotFound` when the source is missing, `InvalidInput` when it is not a directory or a
/// pattern is invalid, `Internal` on unreadable entries or paths escaping the root.
pub fn build_manifest<S: AsRef<str>>(source_dir: &Path, target_path: &str, exclude: &[S]) -> Result<FileManifest> {
  let meta = std::fs::metadata(source_dir).map_err(|e| Error::io(OP, source_dir.display(), e))?;
  if !meta.is_dir() {
    return Err(Error::invalid_input(
      OP,
      format!("source is not a directory: {}", source_dir.display()),
    ));
  }

  let matcher = ExcludeMatcher::new(exclude)?;
  info!(
    source = %source_dir.display(),
    target = %target_path,
    patterns = matcher.patterns().len(),
    "building file manifest"
  );

  let mut files = Vec::new();
  let walker = WalkDir::new(source_dir)
    .follow_links(false)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| {
      if e.depth() == 0 {
        return true;
      }
      match relative_slash_path(source_dir, e.path()) {
        Ok(rel) if e.file_type().is_dir() => !matcher.is_dir_excluded(&rel),
        Ok(rel) => rel != SENTINEL_FILENAME && !matcher.is_excluded(&rel),
        // Surfaced by the loop body below.
        Err(_) => true,
      }
    });

  for entry in walker {
    let entry = entry.map_err(|e| Error::internal(OP, format!("failed to walk {}: {}", source_dir.display(), e)))?;
    if entry.depth() == 0 {
      continue;
    }

    let file_type = entry.file_type();
    if file_type.is_symlink() || !file_type.is_file() {
      if file_type.is_symlink() {
        debug!(path = %entry.path().display(), "skipping symlink");
      }
      continue;
    }

    let rel = relative_slash_path(source_dir, entry.path())?;
    let metadata = entry
      .metadata()
      .map_err(|e| Error::internal(OP, format!("failed to stat {}: {}", entry.path().display(), e)))?;
    let sha256 = hash_file(entry.path())
      .map_err(|e| Error::internal(OP, format!("failed to read {}: {}", entry.path().display(), e)).with_source(e))?;

    files.push(FileEntry {
      path: rel,
      size: metadata.len(),
      sha256,
    });
  }

  let manifest = FileManifest::from_entries(target_path, matcher.patterns().to_vec(), files);
  info!(
    files = manifest.files.len(),
    bytes = manifest.total_size(),
    tree_hash = %manifest.tree_hash,
    "file manifest built"
  );
  Ok(manifest)
}

/// Slash-separated path of `path` relative to `root`, rejecting traversal.
fn relative_slash_path(root: &Path, path: &Path) -> Result<String> {
  let rel = path
    .strip_prefix(root)
    .map_err(|_| Error::internal(OP, format!("{} escapes {}", path.display(), root.display())))?;

  let mut parts = Vec::new();
  for component in rel.components() {
    match component {
      Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
      Component::CurDir => {}
      _ => {
        return Err(Error::internal(
          OP,
          format!("path {} escapes {}", path.display(), root.display()),
        ));
      }
    }
  }
  Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use std::fs;
  use tempfile::tempdir;

  fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
  }

  #[test]
  fn sentinel_lives_at_target_root() {
    assert_eq!(sentinel_path("/srv/assets"), "/srv/assets/.dockform-sync.json");
    assert_eq!(sentinel_path("/srv/assets/"), "/srv/assets/.dockform-sync.json");
    assert_eq!(sentinel_path("/"), "/.dockform-sync.json");
  }

  #[test]
  fn builds_sorted_entries_with_sizes() {
    let temp = tempdir().unwrap();
    write(temp.path(), "sub/b.txt", "bb");
    write(temp.path(), "a.txt", "a");

    let m = build_manifest::<&str>(temp.path(), "/data", &[]).unwrap();
    let paths: Vec<_> = m.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["a.txt", "sub/b.txt"]);
    assert_eq!(m.files[0].size, 1);
    assert_eq!(m.files[1].size, 2);
    assert_eq!(m.version, MANIFEST_VERSION);
    assert_eq!(m.target_path, "/data");
    assert_eq!(m.tree_hash, compute_tree_hash(&m.files));
  }

  #[test]
  fn tree_hash_ignores_build_time() {
    let temp = tempdir().unwrap();
    write(temp.path(), "a.txt", "a");

    let first = build_manifest::<&str>(temp.path(), "/data", &[]).unwrap();
    let mut second = build_manifest::<&str>(temp.path(), "/data", &[]).unwrap();
    second.created_at = "1999-01-01T00:00:00Z".to_string();
    assert_eq!(first.tree_hash, second.tree_hash);
  }

  #[test]
  fn excluded_directories_are_pruned() {
    let temp = tempdir().unwrap();
    write(temp.path(), "build/x", "1");
    write(temp.path(), "build/sub/y", "2");
    write(temp.path(), "buildx/y", "3");
    write(temp.path(), "keep.txt", "4");

    let m = build_manifest(temp.path(), "/data", &["build/"]).unwrap();
    let paths: Vec<_> = m.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["buildx/y", "keep.txt"]);
    assert_eq!(m.exclude, vec!["build/**".to_string()]);
  }

  #[test]
  fn sentinel_is_never_recorded() {
    let temp = tempdir().unwrap();
    write(temp.path(), SENTINEL_FILENAME, "{}");
    write(temp.path(), "a.txt", "a");

    let m = build_manifest::<&str>(temp.path(), "/data", &[]).unwrap();
    assert_eq!(m.files.len(), 1);
  }

  #[cfg(unix)]
  #[test]
  fn symlinks_are_skipped() {
    let temp = tempdir().unwrap();
    write(temp.path(), "real.txt", "x");
    std::os::unix::fs::symlink(temp.path().join("real.txt"), temp.path().join("link.txt")).unwrap();
    std::os::unix::fs::symlink(temp.path(), temp.path().join("loop")).unwrap();

    let m = build_manifest::<&str>(temp.path(), "/data", &[]).unwrap();
    let paths: Vec<_> = m.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["real.txt"]);
  }

  #[test]
  fn missing_source_is_not_found() {
    let temp = tempdir().unwrap();
    let err = build_manifest::<&str>(&temp.path().join("missing"), "/data", &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
  }

  #[test]
  fn file_source_is_invalid_input() {
    let temp = tempdir().unwrap();
    write(temp.path(), "f", "x");
    let err = build_manifest::<&str>(&temp.path().join("f"), "/data", &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
  }

  #[test]
  fn relative_path_rejects_parent_components() {
    let err = relative_slash_path(Path::new("/root"), Path::new("/root/../etc/passwd")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
  }

  #[test]
  fn json_round_trip_and_blank_input() {
    let temp = tempdir().unwrap();
    write(temp.path(), "a.txt", "a");
    let m = build_manifest::<&str>(temp.path(), "/data", &[]).unwrap();

    let parsed = FileManifest::from_json(&m.to_json().unwrap()).unwrap();
    assert_eq!(parsed, m);

    let empty = FileManifest::from_json("  \n").unwrap();
    assert!(empty.is_empty());
    assert!(empty.tree_hash.is_empty());
  }

  #[test]
  fn old_sentinels_with_missing_and_unknown_fields_parse() {
    let json = r#"{"files":[{"path":"a.txt","sha256":"aa"}],"legacy":true}"#;
    let m = FileManifest::from_json(json).unwrap();
    assert_eq!(m.files.len(), 1);
    assert_eq!(m.files[0].size, 0);
    assert!(m.version.is_empty());
    assert!(m.uid.is_none());
  }

  #[test]
  fn malformed_sentinel_is_invalid_input() {
    let err = FileManifest::from_json("{not json").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
  }
}
