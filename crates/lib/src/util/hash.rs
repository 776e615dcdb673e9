//! SHA-256 digests for file manifests and compose fingerprints.
//!
//! Every digest is 64 lowercase hex characters.

use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Streaming SHA-256 of a file, as lowercase hex.
pub fn hash_file(path: &Path) -> io::Result<String> {
  let mut reader = io::BufReader::new(fs::File::open(path)?);
  let mut hasher = Sha256::new();
  io::copy(&mut reader, &mut hasher)?;
  Ok(hex::encode(hasher.finalize()))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> String {
  hex::encode(Sha256::digest(data))
}

/// Incremental tree fingerprint.
///
/// Each entry contributes `path\0size\0sha256\n`. Callers feed entries in path order;
/// the hasher does not sort.
#[derive(Default)]
pub struct TreeHasher {
  hasher: Sha256,
}

impl TreeHasher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, path: &str, size: u64, sha256: &str) {
    self.hasher.update(path.as_bytes());
    self.hasher.update(b"\0");
    self.hasher.update(size.to_string().as_bytes());
    self.hasher.update(b"\0");
    self.hasher.update(sha256.as_bytes());
    self.hasher.update(b"\n");
  }

  pub fn finish(self) -> String {
    hex::encode(self.hasher.finalize())
  }
}
