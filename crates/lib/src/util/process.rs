//! External process execution.
//!
//! Every external tool dockform drives (docker, docker compose, sops) goes through
//! [`run`], which captures output, optionally feeds stdin, and maps failures onto the
//! crate error kinds.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, ErrorKind, Result};

/// A fully described command invocation.
#[derive(Debug, Clone, Default)]
pub struct Invocation<'a> {
  pub program: &'a str,
  pub args: Vec<String>,
  /// Extra environment for the child only; the parent environment is never modified.
  pub env: BTreeMap<String, String>,
  pub cwd: Option<&'a Path>,
  pub stdin: Option<Vec<u8>>,
}

impl<'a> Invocation<'a> {
  pub fn new(program: &'a str) -> Self {
    Self {
      program,
      ..Default::default()
    }
  }

  pub fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  pub fn envs<'e>(mut self, pairs: impl IntoIterator<Item = &'e (String, String)>) -> Self {
    for (k, v) in pairs {
      self.env.insert(k.clone(), v.clone());
    }
    self
  }

  pub fn cwd(mut self, dir: &'a Path) -> Self {
    self.cwd = Some(dir);
    self
  }

  pub fn stdin(mut self, data: Vec<u8>) -> Self {
    self.stdin = Some(data);
    self
  }

  fn display(&self) -> String {
    let mut s = self.program.to_string();
    for arg in &self.args {
      s.push(' ');
      s.push_str(arg);
    }
    s
  }
}

/// Captured output of a successful command.
#[derive(Debug, Clone)]
pub struct Output {
  pub stdout: Vec<u8>,
  pub stderr: String,
}

impl Output {
  pub fn stdout_string(&self) -> String {
    String::from_utf8_lossy(&self.stdout).trim().to_string()
  }
}

/// Run a command to completion.
///
/// A program that cannot be spawned is `Unavailable`; a non-zero exit is `External`
/// with the trimmed stderr as message.
pub async fn run(op: &str, invocation: Invocation<'_>) -> Result<Output> {
  let shown = invocation.display();
  debug!(cmd = %shown, "running command");

  let mut command = Command::new(invocation.program);
  command
    .args(&invocation.args)
    .envs(&invocation.env)
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .stdin(if invocation.stdin.is_some() {
      Stdio::piped()
    } else {
      Stdio::null()
    })
    .kill_on_drop(true);
  if let Some(dir) = invocation.cwd {
    command.current_dir(dir);
  }

  let mut child = command.spawn().map_err(|e| {
    let kind = if e.kind() == std::io::ErrorKind::NotFound {
      ErrorKind::Unavailable
    } else {
      ErrorKind::External
    };
    Error::new(kind, op, format!("failed to spawn {}: {}", invocation.program, e)).with_source(e)
  })?;

  if let Some(data) = invocation.stdin
    && let Some(mut stdin) = child.stdin.take()
  {
    stdin
      .write_all(&data)
      .await
      .map_err(|e| Error::external(op, format!("failed to write stdin of {}: {}", shown, e)))?;
    drop(stdin);
  }

  let output = child
    .wait_with_output()
    .await
    .map_err(|e| Error::external(op, format!("failed to wait for {}: {}", shown, e)))?;

  let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
  if !output.status.success() {
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "command stderr");
    }
    let message = if stderr.is_empty() {
      format!("`{}` exited with {:?}", shown, output.status.code())
    } else {
      format!("`{}` failed: {}", shown, stderr)
    };
    return Err(Error::external(op, message));
  }

  Ok(Output {
    stdout: output.stdout,
    stderr,
  })
}
