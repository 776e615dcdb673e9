//! Desired-state document loading.
//!
//! The document is YAML. It is decoded into raw, loosely typed structs first and then
//! normalized into [`DesiredState`]:
//!
//! - relative paths resolve against the document's directory (stack-level environment
//!   and secrets files against the stack root)
//! - identifiers are validated and inherited from the top level
//! - ownership user and group must be numeric, modes are octal strings
//! - fileset target paths are absolute volume paths without `..`, and targets sharing a
//!   volume must not nest
//! - fileset target volumes become declared volumes
//! - `restart_services` is either `attached` or a list of service names

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::secrets::SecretsConfig;
use crate::state::{
  ApplyMode, ContextSpec, DesiredState, Endpoint, EnvSources, FilesetSpec, MismatchPolicy, NetworkSpec, Ownership,
  RestartTarget, StackSpec, VolumeSpec,
};

const OP: &str = "config.load";

/// A loaded document: the desired state plus tool settings that live next to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
  pub desired: DesiredState,
  pub secrets: SecretsConfig,
  /// Canonical path of the document.
  pub path: PathBuf,
}

/// Load and normalize the desired state at `path`.
pub fn load(path: &Path) -> Result<DesiredState> {
  Ok(load_config(path)?.desired)
}

/// Load the whole document, including the SOPS settings.
///
/// # Errors
///
/// `NotFound` when the document does not exist, `InvalidInput` when it does not parse or
/// fails validation.
pub fn load_config(path: &Path) -> Result<Config> {
  let canonical = dunce::canonicalize(path).map_err(|e| Error::io(OP, path.display(), e))?;
  let text = std::fs::read_to_string(&canonical).map_err(|e| Error::io(OP, canonical.display(), e))?;
  let base = canonical.parent().map(Path::to_path_buf).unwrap_or_default();

  let (desired, secrets) = parse(&text, &base, home_dir().as_deref())?;
  debug!(path = %canonical.display(), contexts = desired.contexts.len(), "loaded configuration");
  Ok(Config {
    desired,
    secrets,
    path: canonical,
  })
}

/// Parse a document whose relative paths resolve against `base`.
pub fn parse(text: &str, base: &Path, home: Option<&Path>) -> Result<(DesiredState, SecretsConfig)> {
  let raw: RawDocument = serde_yaml::from_str(text)
    .map_err(|e| Error::invalid_input(OP, format!("malformed document: {}", e)).with_source(e))?;

  if let Some(identifier) = &raw.identifier {
    validate_identifier(identifier)?;
  }

  let root_env = raw.environment.normalize(base, "environment")?;
  let root_secrets = resolve_all(base, &raw.secrets.sops);

  let mut contexts = BTreeMap::new();
  for (name, ctx) in raw.contexts {
    let spec = ctx.normalize(&name, raw.identifier.as_deref(), base, &root_env, &root_secrets)?;
    contexts.insert(name, spec);
  }

  let secrets = match raw.sops {
    Some(sops) => sops.normalize(base, home),
    None => SecretsConfig::default(),
  };

  Ok((DesiredState { contexts }, secrets))
}

fn home_dir() -> Option<PathBuf> {
  std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
  #[serde(default)]
  identifier: Option<String>,
  #[serde(default)]
  sops: Option<RawSops>,
  #[serde(default)]
  environment: RawEnv,
  #[serde(default)]
  secrets: RawSecrets,
  #[serde(default)]
  contexts: BTreeMap<String, RawContext>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSops {
  #[serde(default)]
  age_key_file: Option<String>,
  #[serde(default)]
  binary: Option<String>,
}

impl RawSops {
  fn normalize(self, base: &Path, home: Option<&Path>) -> SecretsConfig {
    let defaults = SecretsConfig::default();
    SecretsConfig {
      age_key_file: self.age_key_file.map(|f| resolve(base, &expand_home(&f, home))),
      binary: self.binary.unwrap_or(defaults.binary),
    }
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEnv {
  #[serde(default)]
  files: Vec<String>,
  #[serde(default)]
  inline: Vec<String>,
}

impl RawEnv {
  fn normalize(&self, base: &Path, at: &str) -> Result<EnvSources> {
    let inline = self
      .inline
      .iter()
      .map(|pair| parse_inline(pair, at))
      .collect::<Result<Vec<_>>>()?;
    Ok(EnvSources {
      files: resolve_all(base, &self.files),
      inline,
    })
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSecrets {
  #[serde(default)]
  sops: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawContext {
  #[serde(default)]
  docker_context: Option<String>,
  #[serde(default)]
  identifier: Option<String>,
  #[serde(default)]
  networks: BTreeMap<String, Option<RawNetwork>>,
  #[serde(default)]
  volumes: BTreeMap<String, Option<RawVolume>>,
  #[serde(default)]
  stacks: BTreeMap<String, RawStack>,
  #[serde(default)]
  filesets: BTreeMap<String, RawFileset>,
}

impl RawContext {
  fn normalize(
    self,
    name: &str,
    default_identifier: Option<&str>,
    base: &Path,
    root_env: &EnvSources,
    root_secrets: &[PathBuf],
  ) -> Result<ContextSpec> {
    if name.trim().is_empty() {
      return Err(Error::invalid_input(OP, "context names must not be empty"));
    }
    let identifier = self
      .identifier
      .as_deref()
      .or(default_identifier)
      .ok_or_else(|| Error::invalid_input(OP, format!("context {} has no identifier", name)))?;
    validate_identifier(identifier)?;

    let mut endpoint = Endpoint::new(name, identifier);
    if let Some(docker_context) = self.docker_context {
      endpoint.docker_context = docker_context;
    }
    let mut spec = ContextSpec::new(endpoint);

    for (key, raw) in self.networks {
      let network = raw.unwrap_or_default().into_spec(key.clone());
      spec.networks.insert(key, network);
    }
    for (key, raw) in self.volumes {
      let volume = VolumeSpec {
        name: key.clone(),
        driver: raw.and_then(|v| v.driver),
      };
      spec.volumes.insert(key, volume);
    }
    for (key, raw) in self.stacks {
      let at = format!("contexts.{}.stacks.{}", name, key);
      let stack = raw.normalize(&key, &at, base, root_env, root_secrets)?;
      spec.stacks.insert(key, stack);
    }
    for (key, raw) in self.filesets {
      let at = format!("contexts.{}.filesets.{}", name, key);
      let fileset = raw.normalize(&key, &at, base)?;
      spec
        .volumes
        .entry(fileset.target_volume.clone())
        .or_insert_with(|| VolumeSpec::named(fileset.target_volume.clone()));
      spec.filesets.insert(key, fileset);
    }

    check_nesting(name, &spec.filesets)?;
    Ok(spec)
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNetwork {
  #[serde(default)]
  driver: Option<String>,
  #[serde(default)]
  subnet: Option<String>,
  #[serde(default)]
  gateway: Option<String>,
  #[serde(default)]
  ip_range: Option<String>,
  #[serde(default)]
  internal: bool,
  #[serde(default)]
  attachable: bool,
  #[serde(default)]
  ipv6: bool,
  #[serde(default)]
  options: BTreeMap<String, String>,
  #[serde(default)]
  on_mismatch: MismatchPolicy,
}

impl RawNetwork {
  fn into_spec(self, name: String) -> NetworkSpec {
    NetworkSpec {
      name,
      driver: self.driver,
      subnet: self.subnet,
      gateway: self.gateway,
      ip_range: self.ip_range,
      internal: self.internal,
      attachable: self.attachable,
      ipv6: self.ipv6,
      options: self.options,
      on_mismatch: self.on_mismatch,
    }
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVolume {
  #[serde(default)]
  driver: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStack {
  #[serde(default)]
  root: Option<String>,
  #[serde(default)]
  files: Vec<String>,
  #[serde(default)]
  profiles: Vec<String>,
  #[serde(default)]
  project: Option<String>,
  #[serde(default)]
  environment: RawEnv,
  #[serde(default)]
  secrets: RawSecrets,
}

impl RawStack {
  fn normalize(
    self,
    name: &str,
    at: &str,
    base: &Path,
    root_env: &EnvSources,
    root_secrets: &[PathBuf],
  ) -> Result<StackSpec> {
    let root = match &self.root {
      Some(root) => resolve(base, root),
      None => base.to_path_buf(),
    };
    if let Some(project) = &self.project
      && project.trim().is_empty()
    {
      return Err(Error::invalid_input(OP, format!("{}: project must not be empty", at)));
    }

    Ok(StackSpec {
      name: name.to_string(),
      files: self.files.iter().map(PathBuf::from).collect(),
      profiles: self.profiles,
      project: self.project,
      root_env: root_env.clone(),
      env: self.environment.normalize(&root, at)?,
      root_secrets: root_secrets.to_vec(),
      secrets: resolve_all(&root, &self.secrets.sops),
      root,
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileset {
  source: String,
  target_volume: String,
  target_path: String,
  #[serde(default)]
  exclude: Vec<String>,
  #[serde(default)]
  ownership: RawOwnership,
  #[serde(default)]
  restart_services: RawRestart,
  #[serde(default)]
  apply_mode: ApplyMode,
}

impl RawFileset {
  fn normalize(self, name: &str, at: &str, base: &Path) -> Result<FilesetSpec> {
    if self.target_volume.trim().is_empty() {
      return Err(Error::invalid_input(OP, format!("{}: target_volume must not be empty", at)));
    }
    Ok(FilesetSpec {
      name: name.to_string(),
      source: resolve(base, &self.source),
      target_volume: self.target_volume,
      target_path: normalize_target_path(&self.target_path, at)?,
      exclude: self.exclude,
      ownership: self.ownership.normalize(at)?,
      restart: self.restart_services.normalize(at)?,
      apply_mode: self.apply_mode,
    })
  }
}

/// A YAML scalar that may be written quoted or bare.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Scalar {
  Number(u64),
  Text(String),
}

impl Scalar {
  fn text(&self) -> String {
    match self {
      Scalar::Number(n) => n.to_string(),
      Scalar::Text(s) => s.trim().to_string(),
    }
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOwnership {
  #[serde(default)]
  user: Option<Scalar>,
  #[serde(default)]
  group: Option<Scalar>,
  #[serde(default)]
  file_mode: Option<Scalar>,
  #[serde(default)]
  dir_mode: Option<Scalar>,
  #[serde(default)]
  preserve_existing: bool,
}

impl RawOwnership {
  fn normalize(&self, at: &str) -> Result<Ownership> {
    Ok(Ownership {
      uid: self.user.as_ref().map(|v| parse_id(v, at, "user")).transpose()?,
      gid: self.group.as_ref().map(|v| parse_id(v, at, "group")).transpose()?,
      file_mode: self.file_mode.as_ref().map(|v| parse_mode(v, at, "file_mode")).transpose()?,
      dir_mode: self.dir_mode.as_ref().map(|v| parse_mode(v, at, "dir_mode")).transpose()?,
      preserve_existing: self.preserve_existing,
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRestart {
  Keyword(String),
  List(Vec<String>),
}

impl Default for RawRestart {
  fn default() -> Self {
    RawRestart::List(Vec::new())
  }
}

impl RawRestart {
  fn normalize(self, at: &str) -> Result<RestartTarget> {
    match self {
      RawRestart::Keyword(word) if word == "attached" => Ok(RestartTarget::Attached),
      RawRestart::Keyword(word) => Err(Error::invalid_input(
        OP,
        format!("{}: restart_services must be \"attached\" or a list, got {:?}", at, word),
      )),
      RawRestart::List(services) => {
        if services.iter().any(|s| s.trim().is_empty()) {
          return Err(Error::invalid_input(
            OP,
            format!("{}: restart_services entries must not be empty", at),
          ));
        }
        Ok(RestartTarget::Services(services))
      }
    }
  }
}

fn validate_identifier(identifier: &str) -> Result<()> {
  let valid = !identifier.is_empty()
    && identifier
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
  if valid {
    Ok(())
  } else {
    Err(Error::invalid_input(
      OP,
      format!("invalid identifier {:?}: use letters, digits, '_', '.' or '-'", identifier),
    ))
  }
}

fn parse_inline(pair: &str, at: &str) -> Result<(String, String)> {
  match pair.split_once('=') {
    Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
    _ => Err(Error::invalid_input(
      OP,
      format!("{}: inline environment entry {:?} is not KEY=VALUE", at, pair),
    )),
  }
}

fn parse_id(value: &Scalar, at: &str, field: &str) -> Result<u32> {
  let text = value.text();
  text
    .parse::<u32>()
    .map_err(|_| Error::invalid_input(OP, format!("{}: ownership.{} must be numeric, got {:?}", at, field, text)))
}

fn parse_mode(value: &Scalar, at: &str, field: &str) -> Result<u32> {
  let text = value.text();
  let digits = text.strip_prefix("0o").unwrap_or(&text);
  match u32::from_str_radix(digits, 8) {
    Ok(mode) if !digits.is_empty() && mode <= 0o7777 => Ok(mode),
    _ => Err(Error::invalid_input(
      OP,
      format!("{}: ownership.{} must be an octal mode, got {:?}", at, field, text),
    )),
  }
}

/// Normalize an absolute volume path: collapse separators, drop `.` and any trailing
/// slash. `/` stays the volume root.
fn normalize_target_path(path: &str, at: &str) -> Result<String> {
  if !path.starts_with('/') {
    return Err(Error::invalid_input(
      OP,
      format!("{}: target_path {:?} must be absolute", at, path),
    ));
  }
  let mut parts = Vec::new();
  for part in path.split('/') {
    match part {
      "" | "." => {}
      ".." => {
        return Err(Error::invalid_input(
          OP,
          format!("{}: target_path {:?} must not contain '..'", at, path),
        ));
      }
      other => parts.push(other),
    }
  }
  Ok(format!("/{}", parts.join("/")))
}

fn is_within(inner: &str, outer: &str) -> bool {
  outer == "/" || inner == outer || inner.starts_with(&format!("{}/", outer))
}

fn check_nesting(context: &str, filesets: &BTreeMap<String, FilesetSpec>) -> Result<()> {
  let mut by_volume: HashMap<&str, Vec<&FilesetSpec>> = HashMap::new();
  for fileset in filesets.values() {
    by_volume.entry(fileset.target_volume.as_str()).or_default().push(fileset);
  }
  for specs in by_volume.values() {
    for (i, a) in specs.iter().enumerate() {
      for b in &specs[i + 1..] {
        if is_within(&a.target_path, &b.target_path) || is_within(&b.target_path, &a.target_path) {
          return Err(Error::invalid_input(
            OP,
            format!(
              "contexts.{}: filesets {} ({}) and {} ({}) overlap in volume {}",
              context, a.name, a.target_path, b.name, b.target_path, a.target_volume
            ),
          ));
        }
      }
    }
  }
  Ok(())
}

fn expand_home(path: &str, home: Option<&Path>) -> String {
  match (path.strip_prefix('~'), home) {
    (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
      format!("{}{}", home.display(), rest)
    }
    _ => path.to_string(),
  }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
  let path = Path::new(path);
  let joined = if path.is_absolute() { path.to_path_buf() } else { base.join(path) };
  lexical_clean(&joined)
}

fn resolve_all(base: &Path, paths: &[String]) -> Vec<PathBuf> {
  paths.iter().map(|p| resolve(base, p)).collect()
}

/// Drop `.` components and fold `..` without touching the filesystem.
fn lexical_clean(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        if !out.pop() {
          out.push("..");
        }
      }
      other => out.push(other.as_os_str()),
    }
  }
  out
}
