//! Exclude pattern normalization and matching.
//!
//! Patterns use glob semantics where `*` stays within one path segment and `**` spans
//! any number of segments. A trailing `/` marks a directory pattern: `build/` becomes
//! `build/**` and additionally matches the directory `build` itself, so the walk prunes
//! it without descending.

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

const OP: &str = "fileset.exclude";

/// Normalize raw patterns into their canonical, deterministic form.
///
/// Trims whitespace, drops empties, converts `\` to `/`, expands a trailing `/` to
/// `/**`, deduplicates and sorts.
pub fn normalize_patterns<S: AsRef<str>>(patterns: &[S]) -> Vec<String> {
  let mut out: Vec<String> = patterns
    .iter()
    .map(|p| p.as_ref().trim().replace('\\', "/"))
    .filter(|p| !p.is_empty())
    .map(|p| if p.ends_with('/') { format!("{}**", p) } else { p })
    .collect();
  out.sort();
  out.dedup();
  out
}

/// Compiled matcher over normalized patterns.
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
  patterns: Vec<String>,
  any: GlobSet,
  dirs: GlobSet,
}

impl ExcludeMatcher {
  /// Normalize and compile `patterns`. Invalid globs are `InvalidInput`.
  pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
    let patterns = normalize_patterns(patterns);

    let mut any = GlobSetBuilder::new();
    let mut dirs = GlobSetBuilder::new();
    for pattern in &patterns {
      any.add(compile(pattern)?);
      if let Some(stem) = pattern.strip_suffix("/**")
        && !stem.is_empty()
      {
        dirs.add(compile(stem)?);
      }
    }

    Ok(Self {
      patterns,
      any: any.build().map_err(|e| Error::invalid_input(OP, e.to_string()))?,
      dirs: dirs.build().map_err(|e| Error::invalid_input(OP, e.to_string()))?,
    })
  }

  /// The normalized pattern list, as recorded in manifests.
  pub fn patterns(&self) -> &[String] {
    &self.patterns
  }

  /// Whether the slash-separated relative path of a file is excluded.
  pub fn is_excluded(&self, rel_path: &str) -> bool {
    self.any.is_match(rel_path)
  }

  /// Whether the slash-separated relative path of a directory is excluded.
  pub fn is_dir_excluded(&self, rel_path: &str) -> bool {
    self.any.is_match(rel_path) || self.dirs.is_match(rel_path)
  }
}

fn compile(pattern: &str) -> Result<Glob> {
  GlobBuilder::new(pattern)
    .literal_separator(true)
    .build()
    .map_err(|e| Error::invalid_input(OP, format!("invalid exclude pattern {:?}: {}", pattern, e)))
}
