mod apply;
mod destroy;
mod plan;
mod prune;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dockform_lib::config::{self, Config};
use dockform_lib::execute::{ExecuteConfig, ExecutionMode};
use dockform_lib::runtime::Runtime;
use dockform_lib::runtime::docker::DockerCli;
use dockform_lib::secrets::{SecretsResolver, SopsResolver};

pub use apply::cmd_apply;
pub use destroy::cmd_destroy;
pub use plan::cmd_plan;
pub use prune::cmd_prune;

/// Everything a command needs: the loaded document and the collaborators that act on it.
pub struct Session {
  pub config: Config,
  pub runtime: Arc<dyn Runtime>,
  pub secrets: Arc<dyn SecretsResolver>,
  pub execute: ExecuteConfig,
  pub cancel: CancellationToken,
  pub verbose: bool,
}

impl Session {
  pub fn load(path: &Path, sequential: bool, parallelism: Option<usize>, verbose: bool) -> Result<Self> {
    let config = config::load_config(path).with_context(|| format!("Failed to load {}", path.display()))?;
    debug!(path = %config.path.display(), "configuration loaded");

    let mut execute = if sequential {
      ExecuteConfig::sequential()
    } else {
      ExecuteConfig::default()
    };
    if let Some(n) = parallelism
      && execute.mode == ExecutionMode::Parallel
    {
      execute.parallelism = n;
    }

    let secrets = Arc::new(SopsResolver::new(config.secrets.clone()));
    Ok(Self {
      config,
      runtime: Arc::new(DockerCli::default()),
      secrets,
      execute,
      cancel: CancellationToken::new(),
      verbose,
    })
  }
}
