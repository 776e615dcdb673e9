//! Secret decryption.
//!
//! Secrets are SOPS-encrypted dotenv files. The engine reaches them only through
//! [`SecretsResolver`]; [`SopsResolver`] shells out to the `sops` binary and
//! [`StaticSecrets`] serves fixed values for tests and dry runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::drift::env::parse_dotenv_from;
use crate::error::{Error, Result};
use crate::util::process::{self, Invocation};

const OP: &str = "secrets.decrypt";

/// Decrypts one secrets file into ordered key/value pairs.
#[async_trait]
pub trait SecretsResolver: Send + Sync {
  async fn decrypt(&self, path: &Path) -> Result<Vec<(String, String)>>;
}

/// Key material and tool location for SOPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretsConfig {
  /// Age identity file, exported to the child as `SOPS_AGE_KEY_FILE`.
  pub age_key_file: Option<PathBuf>,
  /// The `sops` executable.
  pub binary: String,
}

impl Default for SecretsConfig {
  fn default() -> Self {
    Self {
      age_key_file: None,
      binary: "sops".to_string(),
    }
  }
}

/// Resolver backed by the `sops` CLI.
#[derive(Debug, Clone, Default)]
pub struct SopsResolver {
  config: SecretsConfig,
}

impl SopsResolver {
  pub fn new(config: SecretsConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &SecretsConfig {
    &self.config
  }
}

#[async_trait]
impl SecretsResolver for SopsResolver {
  async fn decrypt(&self, path: &Path) -> Result<Vec<(String, String)>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
      return Err(Error::not_found(OP, format!("secrets file {} does not exist", path.display())));
    }

    let mut invocation = Invocation::new(&self.config.binary)
      .args(["--decrypt", "--output-type", "dotenv"])
      .arg(path.display().to_string());
    if let Some(key_file) = &self.config.age_key_file {
      invocation = invocation.env("SOPS_AGE_KEY_FILE", key_file.display().to_string());
    }

    debug!(path = %path.display(), "decrypting secrets");
    let output = process::run(OP, invocation).await?;
    let text = String::from_utf8(output.stdout)
      .map_err(|e| Error::external(OP, format!("{}: sops output is not UTF-8: {}", path.display(), e)))?;
    parse_dotenv_from(&text, &format!("decrypted {} line", path.display()))
  }
}

/// Fixed secrets keyed by file path. Unknown paths are `NotFound`.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
  files: BTreeMap<PathBuf, Vec<(String, String)>>,
}

impl StaticSecrets {
  pub fn with(mut self, path: impl AsRef<Path>, pairs: Vec<(String, String)>) -> Self {
    self.files.insert(path.as_ref().to_path_buf(), pairs);
    self
  }
}

#[async_trait]
impl SecretsResolver for StaticSecrets {
  async fn decrypt(&self, path: &Path) -> Result<Vec<(String, String)>> {
    self
      .files
      .get(path)
      .cloned()
      .ok_or_else(|| Error::not_found(OP, format!("no secrets for {}", path.display())))
  }
}
