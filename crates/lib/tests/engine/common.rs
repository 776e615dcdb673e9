//! Shared fixtures for engine integration tests.

use std::path::Path;
use std::sync::Arc;

use dockform_lib::config;
use dockform_lib::drift;
use dockform_lib::execute::{self, ApplyReport, ExecuteConfig};
use dockform_lib::fileset::{FileEntry, FileManifest, sentinel_path};
use dockform_lib::plan::{Plan, build_plan};
use dockform_lib::progress::NoProgress;
use dockform_lib::Result;
use dockform_lib::runtime::Runtime as _;
use dockform_lib::runtime::memory::MemoryRuntime;
use dockform_lib::secrets::StaticSecrets;
use dockform_lib::state::{DesiredState, Endpoint};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const CTX: &str = "default";

/// The example deployment: a network and a data volume that do not exist yet, a stack
/// that is already running, and an assets fileset whose volume holds an older sync.
pub const SCENARIO: &str = r#"
identifier: demo
contexts:
  default:
    networks:
      demo-network: {}
    volumes:
      demo-data: {}
    stacks:
      web:
        root: web
        files: [docker-compose.yml]
    filesets:
      assets:
        source: assets
        target_volume: assets-data
        target_path: /srv/assets
        exclude: ["*.tmp"]
        restart_services: attached
"#;

/// An isolated deployment: document directory plus a fresh in-memory daemon.
pub struct Fixture {
  pub temp: TempDir,
  pub rt: Arc<MemoryRuntime>,
  pub desired: DesiredState,
}

impl Fixture {
  /// Parse `document` against a fresh temp directory. Nothing is seeded.
  pub fn new(document: &str) -> Self {
    let temp = TempDir::new().unwrap();
    let (desired, _) = config::parse(document, temp.path(), None).unwrap();
    Self {
      temp,
      rt: Arc::new(MemoryRuntime::new()),
      desired,
    }
  }

  /// The example scenario, seeded.
  pub async fn scenario() -> Self {
    let fixture = Self::new(SCENARIO);
    fixture.write_source("assets/a.txt", "new contents");
    fixture.write_source("assets/sub/b.txt", "b");
    fixture.write_source("assets/scratch.tmp", "ignored");

    let rt = &fixture.rt;
    rt.declare_service(CTX, "web", "nginx", &["assets-data"]);
    rt.insert_volume(CTX, Some("demo"), "assets-data");
    rt.write_volume_file(CTX, "assets-data", "/srv/assets/a.txt", b"old contents");
    rt.write_volume_file(CTX, "assets-data", "/srv/assets/old.txt", b"old");

    let previous = FileManifest::from_entries(
      "/srv/assets",
      vec!["*.tmp".to_string()],
      vec![entry("a.txt", 12, "0000"), entry("old.txt", 3, "1111")],
    );
    rt.write_volume_file(
      CTX,
      "assets-data",
      &sentinel_path("/srv/assets"),
      previous.to_json().unwrap().as_bytes(),
    );

    let stack = &fixture.desired.contexts[CTX].stacks["web"];
    let env = drift::resolve(stack, &StaticSecrets::default()).await.unwrap();
    rt.compose_up(&fixture.endpoint(), stack, &env).await.unwrap();

    fixture
  }

  pub fn endpoint(&self) -> Endpoint {
    self.desired.contexts[CTX].endpoint.clone()
  }

  pub fn write_source(&self, relative: &str, contents: &str) {
    write(self.temp.path(), relative, contents);
  }

  pub async fn plan(&self) -> Result<Plan> {
    build_plan(
      self.rt.clone(),
      Arc::new(StaticSecrets::default()),
      &self.desired,
      &ExecuteConfig::default(),
      &CancellationToken::new(),
    )
    .await
  }

  pub async fn apply(&self, plan: Plan) -> Result<ApplyReport> {
    execute::apply(
      self.rt.clone(),
      Arc::new(plan),
      &ExecuteConfig::default(),
      Arc::new(NoProgress),
      &CancellationToken::new(),
    )
    .await
  }
}

pub fn entry(path: &str, size: u64, sha256: &str) -> FileEntry {
  FileEntry {
    path: path.to_string(),
    size,
    sha256: sha256.to_string(),
  }
}

pub fn labels(plan: &Plan) -> Vec<String> {
  plan.actions().iter().map(|a| a.label()).collect()
}

fn write(root: &Path, relative: &str, contents: &str) {
  let path = root.join(relative);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).unwrap();
  }
  std::fs::write(path, contents).unwrap();
}
