mod cmd;
mod output;
mod progress;
mod prompts;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::Session;
use crate::output::print_error;

/// dockform - declarative Docker resource manager
#[derive(Parser)]
#[command(name = "dockform")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Path to the configuration document
  #[arg(short, long, global = true, default_value = "dockform.yml")]
  config: PathBuf,

  /// Run contexts and actions one at a time
  #[arg(long, global = true)]
  sequential: bool,

  /// Maximum number of actions in flight (default: CPU count)
  #[arg(short = 'j', long, global = true)]
  parallelism: Option<usize>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Show the changes apply would make
  Plan {
    /// Print counts and actions as JSON
    #[arg(long)]
    json: bool,
  },

  /// Converge the daemons to the configuration
  Apply {
    /// Also delete owned resources the configuration no longer declares
    #[arg(long)]
    prune: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
  },

  /// Delete owned resources the configuration no longer declares
  Prune {
    /// Fail when any deletion fails
    #[arg(long)]
    strict: bool,

    /// Report every failed deletion instead of a summary
    #[arg(long)]
    verbose_errors: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
  },

  /// Delete every owned resource in the configured contexts
  Destroy {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  match run(cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      print_error(&format!("{:#}", e));
      ExitCode::FAILURE
    }
  }
}

fn init_tracing(verbose: bool) {
  let default = if verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn run(cli: Cli) -> Result<()> {
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(async {
    let session = Session::load(&cli.config, cli.sequential, cli.parallelism, cli.verbose)?;

    let cancel = session.cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("interrupted, finishing in-flight actions");
        cancel.cancel();
      }
    });

    match cli.command {
      Commands::Plan { json } => cmd::cmd_plan(&session, json).await,
      Commands::Apply { prune, yes } => cmd::cmd_apply(&session, prune, yes).await,
      Commands::Prune {
        strict,
        verbose_errors,
        yes,
      } => cmd::cmd_prune(&session, strict, verbose_errors, yes).await,
      Commands::Destroy { yes } => cmd::cmd_destroy(&session, yes).await,
    }
  })
}
