//! Environment resolution for stacks.
//!
//! Layers are merged with [`merge_env`] in this order, lowest precedence first:
//! document env files, document inline pairs, stack env files, stack inline pairs,
//! document secrets, stack secrets.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use super::ResolvedEnv;
use crate::error::{Error, Result};
use crate::secrets::SecretsResolver;
use crate::state::{EnvSources, StackSpec};

const OP: &str = "drift.env";

/// Merge ordered key/value layers. Later layers win; a key keeps the position where it
/// was first seen.
pub fn merge_env<L, I>(layers: L) -> Vec<(String, String)>
where
  L: IntoIterator<Item = I>,
  I: IntoIterator<Item = (String, String)>,
{
  let mut merged: Vec<(String, String)> = Vec::new();
  let mut index: HashMap<String, usize> = HashMap::new();

  for layer in layers {
    for (key, value) in layer {
      match index.get(&key) {
        Some(&pos) => merged[pos].1 = value,
        None => {
          index.insert(key.clone(), merged.len());
          merged.push((key, value));
        }
      }
    }
  }

  merged
}

/// Parse dotenv text.
///
/// Accepts `KEY=VALUE` lines, blank lines, `#` comments and an optional `export `
/// prefix. A value wrapped in matching single or double quotes is unwrapped. A
/// non-blank line without `=` or with an empty key is `InvalidInput`.
pub fn parse_dotenv(text: &str) -> Result<Vec<(String, String)>> {
  parse_dotenv_from(text, "line")
}

/// [`parse_dotenv`] with error positions reported as `<origin> <n>`.
pub(crate) fn parse_dotenv_from(text: &str, origin: &str) -> Result<Vec<(String, String)>> {
  let mut pairs = Vec::new();

  for (lineno, raw) in text.lines().enumerate() {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);

    let Some((key, value)) = line.split_once('=') else {
      return Err(Error::invalid_input(
        OP,
        format!("{} {}: expected KEY=VALUE", origin, lineno + 1),
      ));
    };
    let key = key.trim();
    if key.is_empty() {
      return Err(Error::invalid_input(OP, format!("{} {}: empty key", origin, lineno + 1)));
    }

    pairs.push((key.to_string(), unquote(value.trim()).to_string()));
  }

  Ok(pairs)
}

fn unquote(value: &str) -> &str {
  let bytes = value.as_bytes();
  if bytes.len() >= 2 {
    let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
    if first == last && (first == b'"' || first == b'\'') {
      return &value[1..value.len() - 1];
    }
  }
  value
}

/// Read and parse one dotenv file. A missing file is `NotFound`.
pub async fn load_env_file(path: &Path) -> Result<Vec<(String, String)>> {
  let text = tokio::fs::read_to_string(path)
    .await
    .map_err(|e| Error::io(OP, path.display(), e))?;
  parse_dotenv_from(&text, &format!("{} line", path.display()))
}

async fn load_sources(sources: &EnvSources) -> Result<(Vec<(String, String)>, Vec<(String, String)>)> {
  let mut files = Vec::new();
  for path in &sources.files {
    files.extend(load_env_file(path).await?);
  }
  Ok((files, sources.inline.clone()))
}

async fn decrypt_all(resolver: &dyn SecretsResolver, paths: &[std::path::PathBuf]) -> Result<Vec<(String, String)>> {
  let mut pairs = Vec::new();
  for path in paths {
    pairs.extend(resolver.decrypt(path).await?);
  }
  Ok(pairs)
}

/// Resolve the effective environment of `stack`.
///
/// # Errors
///
/// Returns the first failure: a missing or malformed env file, or a secret that cannot
/// be decrypted.
pub async fn resolve(stack: &StackSpec, resolver: &dyn SecretsResolver) -> Result<ResolvedEnv> {
  let (root_files, root_inline) = load_sources(&stack.root_env).await?;
  let (stack_files, stack_inline) = load_sources(&stack.env).await?;
  let root_secrets = decrypt_all(resolver, &stack.root_secrets).await?;
  let stack_secrets = decrypt_all(resolver, &stack.secrets).await?;

  let merged = merge_env([
    root_files,
    root_inline,
    stack_files,
    stack_inline,
    root_secrets,
    stack_secrets,
  ]);
  debug!(stack = %stack.name, keys = merged.len(), "resolved environment");
  Ok(ResolvedEnv::new(merged))
}
