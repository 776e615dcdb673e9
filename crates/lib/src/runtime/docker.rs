//! [`Runtime`] implementation that drives the `docker` CLI.
//!
//! Every invocation is pinned to the endpoint's docker context with `--context`.
//! Compose commands run with a generated override file that stamps the identifier label
//! on every service, so containers created by compose are discoverable the same way as
//! networks and volumes. Staging operations run a throwaway helper container with the
//! target volume mounted at [`STAGING_MOUNT`].

use std::collections::BTreeMap;
use std::io::Write;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Runtime, STAGING_MOUNT, StagingOp, staging_path};
use crate::drift::ResolvedEnv;
use crate::error::{Error, ErrorKind, Result};
use crate::state::{
  Endpoint, IDENTIFIER_LABEL, NetworkInfo, NetworkSpec, ServiceState, StackSpec, VolumeInfo, VolumeSpec,
};
use crate::util::process::{self, Invocation, Output};

const OP: &str = "runtime.docker";

/// Image used for staging containers unless overridden.
pub const DEFAULT_HELPER_IMAGE: &str = "alpine:3.20";

const PROJECT_LABEL: &str = "com.docker.compose.project";
const SERVICE_LABEL: &str = "com.docker.compose.service";
const CONFIG_HASH_LABEL: &str = "com.docker.compose.config-hash";

/// Runtime backed by the docker CLI and its compose plugin.
#[derive(Debug, Clone)]
pub struct DockerCli {
  binary: String,
  helper_image: String,
}

impl Default for DockerCli {
  fn default() -> Self {
    Self {
      binary: "docker".to_string(),
      helper_image: DEFAULT_HELPER_IMAGE.to_string(),
    }
  }
}

impl DockerCli {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
    self.binary = binary.into();
    self
  }

  pub fn with_helper_image(mut self, image: impl Into<String>) -> Self {
    self.helper_image = image.into();
    self
  }

  fn docker(&self, endpoint: &Endpoint) -> Invocation<'_> {
    Invocation::new(&self.binary).args(["--context", endpoint.docker_context.as_str()])
  }

  async fn run(&self, invocation: Invocation<'_>) -> Result<Output> {
    process::run(OP, invocation).await
  }

  /// Compose invocation with every file of the stack plus `override_file`.
  fn compose<'a>(
    &'a self,
    endpoint: &Endpoint,
    stack: &'a StackSpec,
    env: &ResolvedEnv,
    override_file: Option<&std::path::Path>,
  ) -> Invocation<'a> {
    let mut inv = self
      .docker(endpoint)
      .args(["compose", "--project-name", stack.project_name()])
      .arg("--project-directory")
      .arg(stack.root.display().to_string())
      .cwd(&stack.root)
      .envs(env.pairs());
    for file in &stack.files {
      inv = inv.arg("-f").arg(stack.root.join(file).display().to_string());
    }
    if let Some(path) = override_file {
      inv = inv.arg("-f").arg(path.display().to_string());
    }
    for profile in &stack.profiles {
      inv = inv.arg("--profile").arg(profile.clone());
    }
    inv
  }

  async fn compose_services(&self, endpoint: &Endpoint, stack: &StackSpec, env: &ResolvedEnv) -> Result<Vec<String>> {
    let out = self
      .run(self.compose(endpoint, stack, env, None).args(["config", "--services"]))
      .await?;
    Ok(lines(&out.stdout_string()))
  }

  /// Write the label override for `services` to a temporary file.
  fn write_override(&self, endpoint: &Endpoint, services: &[String]) -> Result<tempfile::NamedTempFile> {
    let doc = ComposeOverride {
      services: services
        .iter()
        .map(|s| {
          let mut labels = BTreeMap::new();
          labels.insert(IDENTIFIER_LABEL.to_string(), endpoint.identifier.clone());
          (s.clone(), OverrideService { labels })
        })
        .collect(),
    };
    let yaml = serde_yaml::to_string(&doc).map_err(|e| Error::internal(OP, format!("override: {}", e)))?;

    let mut file = tempfile::Builder::new()
      .prefix("dockform-override-")
      .suffix(".yml")
      .tempfile()
      .map_err(|e| Error::io(OP, "creating compose override", e))?;
    file
      .write_all(yaml.as_bytes())
      .map_err(|e| Error::io(OP, "writing compose override", e))?;
    Ok(file)
  }

  async fn inspect_containers(&self, endpoint: &Endpoint, ids: &[String]) -> Result<Vec<ContainerInspect>> {
    if ids.is_empty() {
      return Ok(Vec::new());
    }
    let out = self
      .run(self.docker(endpoint).arg("inspect").args(ids.iter().cloned()))
      .await?;
    serde_json::from_slice(&out.stdout).map_err(|e| Error::external(OP, format!("parsing container inspect: {}", e)))
  }

  /// IDs of owned containers (running or not) matching extra `--filter` expressions.
  async fn container_ids(&self, endpoint: &Endpoint, filters: &[String]) -> Result<Vec<String>> {
    let mut inv = self
      .docker(endpoint)
      .args(["ps", "-a", "-q", "--no-trunc", "--filter"])
      .arg(format!("label={}", endpoint.label_filter()));
    for filter in filters {
      inv = inv.arg("--filter").arg(filter.clone());
    }
    Ok(lines(&self.run(inv).await?.stdout_string()))
  }

  async fn service_container_ids(&self, endpoint: &Endpoint, services: &[String]) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for service in services {
      ids.extend(
        self
          .container_ids(endpoint, &[format!("label={}={}", SERVICE_LABEL, service)])
          .await?,
      );
    }
    ids.sort();
    ids.dedup();
    Ok(ids)
  }

  async fn container_command(&self, endpoint: &Endpoint, verb: &str, services: &[String]) -> Result<()> {
    let ids = self.service_container_ids(endpoint, services).await?;
    if ids.is_empty() {
      debug!(verb, services = ?services, "no containers matched");
      return Ok(());
    }
    info!(context = %endpoint.name, verb, services = ?services, "container command");
    self.run(self.docker(endpoint).arg(verb).args(ids)).await?;
    Ok(())
  }

  async fn staging(&self, endpoint: &Endpoint, volume: &str, script: String, stdin: Option<Vec<u8>>) -> Result<Output> {
    let mut inv = self
      .docker(endpoint)
      .args(["run", "--rm", "-i", "--network", "none", "--label"])
      .arg(endpoint.label_filter())
      .arg("-v")
      .arg(format!("{}:{}", volume, STAGING_MOUNT))
      .arg(self.helper_image.clone())
      .args(["sh", "-c"])
      .arg(script);
    if let Some(data) = stdin {
      inv = inv.stdin(data);
    }
    self.run(inv).await
  }
}

#[derive(Debug, Serialize)]
struct ComposeOverride {
  services: BTreeMap<String, OverrideService>,
}

#[derive(Debug, Serialize)]
struct OverrideService {
  labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkInspect {
  name: String,
  #[serde(default)]
  driver: String,
  #[serde(rename = "EnableIPv6", default)]
  enable_ipv6: bool,
  #[serde(default)]
  internal: bool,
  #[serde(default)]
  attachable: bool,
  #[serde(rename = "IPAM", default)]
  ipam: Option<Ipam>,
  #[serde(default)]
  options: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct Ipam {
  #[serde(rename = "Config", default)]
  config: Option<Vec<IpamConfig>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpamConfig {
  #[serde(default)]
  subnet: Option<String>,
  #[serde(default)]
  gateway: Option<String>,
  #[serde(rename = "IPRange", default)]
  ip_range: Option<String>,
}

impl From<NetworkInspect> for NetworkInfo {
  fn from(n: NetworkInspect) -> Self {
    let first = n.ipam.and_then(|i| i.config).and_then(|c| c.into_iter().next()).unwrap_or_default();
    NetworkInfo {
      name: n.name,
      driver: n.driver,
      subnet: first.subnet.filter(|s| !s.is_empty()),
      gateway: first.gateway.filter(|s| !s.is_empty()),
      ip_range: first.ip_range.filter(|s| !s.is_empty()),
      internal: n.internal,
      attachable: n.attachable,
      ipv6: n.enable_ipv6,
      options: n.options.unwrap_or_default(),
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VolumeLine {
  name: String,
  #[serde(default)]
  driver: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
  config: ContainerConfig,
  #[serde(default)]
  state: ContainerStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerStatus {
  #[serde(default)]
  running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
  #[serde(default)]
  labels: Option<BTreeMap<String, String>>,
}

impl ContainerInspect {
  fn label(&self, key: &str) -> Option<&str> {
    self.config.labels.as_ref()?.get(key).map(String::as_str)
  }
}

fn lines(text: &str) -> Vec<String> {
  text
    .lines()
    .map(str::trim)
    .filter(|l| !l.is_empty())
    .map(str::to_string)
    .collect()
}

/// Parse `docker compose config --hash '*'` output: one `<service> <hash>` per line.
fn parse_hashes(text: &str) -> Result<BTreeMap<String, String>> {
  let mut out = BTreeMap::new();
  for line in lines(text) {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
      (Some(service), Some(hash)) => {
        out.insert(service.to_string(), hash.to_string());
      }
      _ => return Err(Error::external(OP, format!("unexpected config hash line {:?}", line))),
    }
  }
  Ok(out)
}

/// Quote a string for a POSIX shell.
fn sh_quote(s: &str) -> String {
  format!("'{}'", s.replace('\'', "'\\''"))
}

fn parent_dir(path: &str) -> String {
  match path.rfind('/') {
    Some(0) | None => STAGING_MOUNT.to_string(),
    Some(i) => path[..i].to_string(),
  }
}

fn newline_list(paths: &[String]) -> Vec<u8> {
  let mut data = paths.join("\n").into_bytes();
  data.push(b'\n');
  data
}

/// Shell script and stdin payload for one staging operation.
fn staging_script(op: StagingOp) -> (String, Option<Vec<u8>>) {
  match op {
    StagingOp::ReadFile { path } => {
      let p = sh_quote(&staging_path(&path));
      (format!("if [ -f {p} ]; then printf 1; cat {p}; else printf 0; fi"), None)
    }
    StagingOp::WriteFile { path, contents } => {
      let full = staging_path(&path);
      let script = format!("mkdir -p {} && cat > {}", sh_quote(&parent_dir(&full)), sh_quote(&full));
      (script, Some(contents))
    }
    StagingOp::ExtractArchive { target_path, archive } => {
      let t = sh_quote(&staging_path(&target_path));
      (format!("mkdir -p {t} && tar -xf - -C {t}"), Some(archive))
    }
    StagingOp::RemovePaths { target_path, paths } => {
      let t = sh_quote(&staging_path(&target_path));
      let script = format!(
        "[ -d {t} ] || exit 0; cd {t} && while IFS= read -r p; do [ -n \"$p\" ] && rm -rf -- \"$p\"; done; true"
      );
      (script, Some(newline_list(&paths)))
    }
    StagingOp::ApplyOwnership {
      target_path,
      uid,
      gid,
      file_mode,
      dir_mode,
      paths,
    } => {
      let t = sh_quote(&staging_path(&target_path));
      let owner = match (uid, gid) {
        (Some(u), Some(g)) => Some(format!("chown {}:{}", u, g)),
        (Some(u), None) => Some(format!("chown {}", u)),
        (None, Some(g)) => Some(format!("chgrp {}", g)),
        (None, None) => None,
      };

      let mut steps = vec![format!("cd {t}")];
      if paths.is_empty() {
        if let Some(owner) = &owner {
          steps.push(format!("{} -R .", owner));
        }
        if let Some(mode) = file_mode {
          steps.push(format!("find . -type f -exec chmod {:o} {{}} +", mode));
        }
        if let Some(mode) = dir_mode {
          steps.push(format!("find . -type d -exec chmod {:o} {{}} +", mode));
        }
        (steps.join(" && "), None)
      } else {
        let mut body = Vec::new();
        if let Some(owner) = &owner {
          body.push(format!("{} \"$p\"", owner));
        }
        match (file_mode, dir_mode) {
          (None, None) => {}
          (f, d) => {
            let file_cmd = f.map(|m| format!("chmod {:o} \"$p\"", m)).unwrap_or_else(|| "true".to_string());
            let dir_cmd = d.map(|m| format!("chmod {:o} \"$p\"", m)).unwrap_or_else(|| "true".to_string());
            body.push(format!("if [ -d \"$p\" ]; then {}; else {}; fi", dir_cmd, file_cmd));
          }
        }
        if body.is_empty() {
          body.push("true".to_string());
        }
        steps.push(format!(
          "while IFS= read -r p; do [ -e \"$p\" ] || continue; {}; done",
          body.join("; ")
        ));
        (steps.join(" && "), Some(newline_list(&paths)))
      }
    }
  }
}

fn is_missing(err: &Error) -> bool {
  let text = err.to_string();
  err.kind() == ErrorKind::External && (text.contains("No such") || text.contains("not found"))
}

#[async_trait]
impl Runtime for DockerCli {
  async fn list_networks(&self, endpoint: &Endpoint) -> Result<Vec<NetworkInfo>> {
    let out = self
      .run(
        self
          .docker(endpoint)
          .args(["network", "ls", "--format", "{{.Name}}", "--filter"])
          .arg(format!("label={}", endpoint.label_filter())),
      )
      .await?;
    let names = lines(&out.stdout_string());
    if names.is_empty() {
      return Ok(Vec::new());
    }

    let out = self
      .run(self.docker(endpoint).args(["network", "inspect"]).args(names))
      .await?;
    let parsed: Vec<NetworkInspect> = serde_json::from_slice(&out.stdout)
      .map_err(|e| Error::external(OP, format!("parsing network inspect: {}", e)))?;
    Ok(parsed.into_iter().map(NetworkInfo::from).collect())
  }

  async fn list_volumes(&self, endpoint: &Endpoint) -> Result<Vec<VolumeInfo>> {
    let out = self
      .run(
        self
          .docker(endpoint)
          .args(["volume", "ls", "--format", "{{json .}}", "--filter"])
          .arg(format!("label={}", endpoint.label_filter())),
      )
      .await?;
    lines(&out.stdout_string())
      .iter()
      .map(|line| {
        serde_json::from_str::<VolumeLine>(line)
          .map(|v| VolumeInfo {
            name: v.name,
            driver: v.driver,
          })
          .map_err(|e| Error::external(OP, format!("parsing volume list: {}", e)))
      })
      .collect()
  }

  async fn list_services(&self, endpoint: &Endpoint) -> Result<Vec<ServiceState>> {
    let ids = self.container_ids(endpoint, &[format!("label={}", PROJECT_LABEL)]).await?;

    let mut services = Vec::new();
    for container in self.inspect_containers(endpoint, &ids).await? {
      if let (Some(project), Some(service)) = (container.label(PROJECT_LABEL), container.label(SERVICE_LABEL)) {
        services.push(ServiceState {
          project: project.to_string(),
          service: service.to_string(),
          config_hash: container.label(CONFIG_HASH_LABEL).unwrap_or_default().to_string(),
          running: container.state.running,
        });
      }
    }
    Ok(services)
  }

  async fn create_network(&self, endpoint: &Endpoint, spec: &NetworkSpec) -> Result<()> {
    let mut inv = self
      .docker(endpoint)
      .args(["network", "create", "--label"])
      .arg(endpoint.label_filter());
    if let Some(driver) = &spec.driver {
      inv = inv.arg("--driver").arg(driver.clone());
    }
    for (flag, value) in [
      ("--subnet", &spec.subnet),
      ("--gateway", &spec.gateway),
      ("--ip-range", &spec.ip_range),
    ] {
      if let Some(value) = value {
        inv = inv.arg(flag).arg(value.clone());
      }
    }
    for (flag, set) in [
      ("--internal", spec.internal),
      ("--attachable", spec.attachable),
      ("--ipv6", spec.ipv6),
    ] {
      if set {
        inv = inv.arg(flag);
      }
    }
    for (key, value) in &spec.options {
      inv = inv.arg("--opt").arg(format!("{}={}", key, value));
    }
    self.run(inv.arg(spec.name.clone())).await?;
    Ok(())
  }

  async fn delete_network(&self, endpoint: &Endpoint, name: &str) -> Result<()> {
    match self.run(self.docker(endpoint).args(["network", "rm", name])).await {
      Err(e) if is_missing(&e) => Ok(()),
      other => other.map(|_| ()),
    }
  }

  async fn create_volume(&self, endpoint: &Endpoint, spec: &VolumeSpec) -> Result<()> {
    let mut inv = self
      .docker(endpoint)
      .args(["volume", "create", "--label"])
      .arg(endpoint.label_filter());
    if let Some(driver) = &spec.driver {
      inv = inv.arg("--driver").arg(driver.clone());
    }
    self.run(inv.arg(spec.name.clone())).await?;
    Ok(())
  }

  async fn delete_volume(&self, endpoint: &Endpoint, name: &str) -> Result<()> {
    match self.run(self.docker(endpoint).args(["volume", "rm", name])).await {
      Err(e) if is_missing(&e) => Ok(()),
      other => other.map(|_| ()),
    }
  }

  async fn compose_up(&self, endpoint: &Endpoint, stack: &StackSpec, env: &ResolvedEnv) -> Result<()> {
    let services = self.compose_services(endpoint, stack, env).await?;
    let override_file = self.write_override(endpoint, &services)?;
    info!(context = %endpoint.name, project = %stack.project_name(), "compose up");
    self
      .run(
        self
          .compose(endpoint, stack, env, Some(override_file.path()))
          .args(["up", "-d", "--remove-orphans"]),
      )
      .await?;
    Ok(())
  }

  async fn compose_down(&self, endpoint: &Endpoint, project: &str) -> Result<()> {
    info!(context = %endpoint.name, project, "compose down");
    self
      .run(
        self
          .docker(endpoint)
          .args(["compose", "--project-name", project, "down", "--remove-orphans"]),
      )
      .await?;
    Ok(())
  }

  async fn compose_config_hash(
    &self,
    endpoint: &Endpoint,
    stack: &StackSpec,
    env: &ResolvedEnv,
  ) -> Result<BTreeMap<String, String>> {
    let services = self.compose_services(endpoint, stack, env).await?;
    let override_file = self.write_override(endpoint, &services)?;
    let out = self
      .run(
        self
          .compose(endpoint, stack, env, Some(override_file.path()))
          .args(["config", "--hash", "*"]),
      )
      .await?;
    parse_hashes(&out.stdout_string())
  }

  async fn run_staging(&self, endpoint: &Endpoint, volume: &str, op: StagingOp) -> Result<Vec<u8>> {
    debug!(context = %endpoint.name, volume, op = ?op, "staging");
    let reading = match &op {
      StagingOp::ReadFile { path } => Some(path.clone()),
      _ => None,
    };
    let (script, stdin) = staging_script(op);
    let out = self.staging(endpoint, volume, script, stdin).await?;

    match reading {
      None => Ok(out.stdout),
      Some(path) => match out.stdout.split_first() {
        Some((&b'1', contents)) => Ok(contents.to_vec()),
        _ => Err(Error::not_found(OP, format!("{}:{} does not exist", volume, path))),
      },
    }
  }

  async fn discover_attached_services(&self, endpoint: &Endpoint, volume: &str) -> Result<Vec<String>> {
    let ids = self.container_ids(endpoint, &[format!("volume={}", volume)]).await?;
    let mut services: Vec<String> = self
      .inspect_containers(endpoint, &ids)
      .await?
      .iter()
      .filter_map(|c| c.label(SERVICE_LABEL).map(str::to_string))
      .collect();
    services.sort();
    services.dedup();
    Ok(services)
  }

  async fn restart_services(&self, endpoint: &Endpoint, services: &[String]) -> Result<()> {
    self.container_command(endpoint, "restart", services).await
  }

  async fn stop_services(&self, endpoint: &Endpoint, services: &[String]) -> Result<()> {
    self.container_command(endpoint, "stop", services).await
  }

  async fn start_services(&self, endpoint: &Endpoint, services: &[String]) -> Result<()> {
    self.container_command(endpoint, "start", services).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_network_inspect() {
    let json = r#"[{
      "Name": "demo-network",
      "Driver": "bridge",
      "EnableIPv6": false,
      "Internal": true,
      "Attachable": false,
      "IPAM": {"Driver": "default", "Config": [{"Subnet": "10.0.0.0/24", "Gateway": "10.0.0.1"}]},
      "Options": null,
      "Labels": {"io.dockform.identifier": "demo"}
    }]"#;
    let parsed: Vec<NetworkInspect> = serde_json::from_str(json).unwrap();
    let info = NetworkInfo::from(parsed.into_iter().next().unwrap());
    assert_eq!(info.name, "demo-network");
    assert_eq!(info.subnet.as_deref(), Some("10.0.0.0/24"));
    assert_eq!(info.gateway.as_deref(), Some("10.0.0.1"));
    assert!(info.ip_range.is_none());
    assert!(info.internal);
    assert!(info.options.is_empty());
  }

  #[test]
  fn container_inspect_reports_stopped_state() {
    let json = r#"[
      {"Config": {"Labels": {"com.docker.compose.project": "web"}}, "State": {"Running": false}},
      {"Config": {"Labels": null}}
    ]"#;
    let parsed: Vec<ContainerInspect> = serde_json::from_str(json).unwrap();
    assert_eq!(parsed[0].label(PROJECT_LABEL), Some("web"));
    assert!(!parsed[0].state.running);
    assert!(!parsed[1].state.running);
    assert!(parsed[1].label(PROJECT_LABEL).is_none());
  }

  #[test]
  fn parses_config_hashes() {
    let hashes = parse_hashes("app abc123\nworker def456\n\n").unwrap();
    assert_eq!(hashes.len(), 2);
    assert_eq!(hashes["worker"], "def456");
    assert!(parse_hashes("garbage").is_err());
  }

  #[test]
  fn override_stamps_identifier_label() {
    let cli = DockerCli::new();
    let file = cli
      .write_override(&Endpoint::new("default", "demo"), &["app".to_string()])
      .unwrap();
    let text = std::fs::read_to_string(file.path()).unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
    assert_eq!(
      doc["services"]["app"]["labels"]["io.dockform.identifier"].as_str(),
      Some("demo")
    );
  }

  #[test]
  fn shell_quoting_escapes_single_quotes() {
    assert_eq!(sh_quote("it's"), "'it'\\''s'");
  }

  #[test]
  fn read_script_marks_presence() {
    let (script, stdin) = staging_script(StagingOp::ReadFile {
      path: "/srv/.dockform-sync.json".to_string(),
    });
    assert!(script.contains("'/dockform/srv/.dockform-sync.json'"));
    assert!(stdin.is_none());
  }

  #[test]
  fn ownership_script_for_whole_tree() {
    let (script, stdin) = staging_script(StagingOp::ApplyOwnership {
      target_path: "/srv".to_string(),
      uid: Some(1000),
      gid: Some(1000),
      file_mode: Some(0o644),
      dir_mode: Some(0o755),
      paths: vec![],
    });
    assert!(script.contains("chown 1000:1000 -R ."));
    assert!(script.contains("chmod 644"));
    assert!(script.contains("chmod 755"));
    assert!(stdin.is_none());
  }

  #[test]
  fn write_script_creates_parent() {
    let (script, stdin) = staging_script(StagingOp::WriteFile {
      path: "/a/b.json".to_string(),
      contents: b"{}".to_vec(),
    });
    assert!(script.starts_with("mkdir -p '/dockform/a'"));
    assert_eq!(stdin, Some(b"{}".to_vec()));
  }
}
