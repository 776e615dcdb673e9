//! Fileset sync execution.
//!
//! A sync transfers only the planned diff into the target volume through staging
//! containers, applies the ownership policy, and then writes the local manifest as the
//! new sentinel. The sentinel goes last so an interrupted sync is detected as drift on
//! the next plan.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ensure_not_cancelled;
use crate::error::{Error, ErrorList, Result};
use crate::fileset::sentinel_path;
use crate::plan::FilesetPayload;
use crate::runtime::{Runtime, StagingOp};
use crate::state::{ApplyMode, Endpoint, RestartTarget};

const OP: &str = "execute.fileset";

/// Bring a fileset's target path in line with its local source.
///
/// # Errors
///
/// Any staging or restart failure. In cold mode, stopped services are started again
/// even when the transfer fails; both failures are reported together.
pub async fn sync_fileset(
  runtime: &dyn Runtime,
  endpoint: &Endpoint,
  payload: &FilesetPayload,
  cancel: &CancellationToken,
) -> Result<()> {
  let spec = &payload.spec;
  let targets = restart_targets(runtime, endpoint, &spec.restart, &spec.target_volume).await?;
  debug!(
    fileset = %spec.name,
    volume = %spec.target_volume,
    changes = payload.diff.len(),
    restart = ?targets,
    "syncing fileset"
  );

  match spec.apply_mode {
    ApplyMode::Cold if !targets.is_empty() => {
      runtime.stop_services(endpoint, &targets).await?;
      let mut errors = ErrorList::new();
      errors.capture(transfer(runtime, endpoint, payload, cancel).await);
      errors.capture(runtime.start_services(endpoint, &targets).await);
      errors.into_result()?;
    }
    _ => {
      transfer(runtime, endpoint, payload, cancel).await?;
      if !targets.is_empty() {
        ensure_not_cancelled(cancel, OP)?;
        runtime.restart_services(endpoint, &targets).await?;
      }
    }
  }

  info!(fileset = %spec.name, summary = %payload.diff.summary(), "fileset synced");
  Ok(())
}

async fn restart_targets(
  runtime: &dyn Runtime,
  endpoint: &Endpoint,
  restart: &RestartTarget,
  volume: &str,
) -> Result<Vec<String>> {
  match restart {
    RestartTarget::Attached => runtime.discover_attached_services(endpoint, volume).await,
    RestartTarget::Services(services) => Ok(services.clone()),
  }
}

async fn transfer(
  runtime: &dyn Runtime,
  endpoint: &Endpoint,
  payload: &FilesetPayload,
  cancel: &CancellationToken,
) -> Result<()> {
  let spec = &payload.spec;
  let volume = spec.target_volume.as_str();
  let copied: Vec<String> = payload.diff.files_to_copy().map(|f| f.path.clone()).collect();

  if !copied.is_empty() {
    ensure_not_cancelled(cancel, OP)?;
    let source = spec.source.clone();
    let paths = copied.clone();
    let archive = tokio::task::spawn_blocking(move || build_archive(&source, &paths))
      .await
      .map_err(|e| Error::internal(OP, format!("archive task failed: {}", e)))??;
    debug!(volume, files = copied.len(), bytes = archive.len(), "extracting archive");
    runtime
      .run_staging(
        endpoint,
        volume,
        StagingOp::ExtractArchive {
          target_path: spec.target_path.clone(),
          archive,
        },
      )
      .await?;
  }

  if !payload.diff.to_delete.is_empty() {
    ensure_not_cancelled(cancel, OP)?;
    runtime
      .run_staging(
        endpoint,
        volume,
        StagingOp::RemovePaths {
          target_path: spec.target_path.clone(),
          paths: payload.diff.to_delete.clone(),
        },
      )
      .await?;
  }

  if let Some(paths) = ownership_paths(payload, copied) {
    ensure_not_cancelled(cancel, OP)?;
    let ownership = &spec.ownership;
    runtime
      .run_staging(
        endpoint,
        volume,
        StagingOp::ApplyOwnership {
          target_path: spec.target_path.clone(),
          uid: ownership.uid,
          gid: ownership.gid,
          file_mode: ownership.file_mode,
          dir_mode: ownership.dir_mode,
          paths,
        },
      )
      .await?;
  }

  ensure_not_cancelled(cancel, OP)?;
  let sentinel = payload.manifest.to_json()?;
  runtime
    .run_staging(
      endpoint,
      volume,
      StagingOp::WriteFile {
        path: sentinel_path(&spec.target_path),
        contents: sentinel.into_bytes(),
      },
    )
    .await?;

  Ok(())
}

/// Paths the ownership policy touches, or `None` when it has nothing to do.
///
/// An empty list means the whole target path. With `preserve_existing` only managed files
/// are touched: the copied ones, or every file of the manifest when the declared owner
/// changed since the last sync.
fn ownership_paths(payload: &FilesetPayload, copied: Vec<String>) -> Option<Vec<String>> {
  let ownership = &payload.spec.ownership;
  if ownership.is_empty() {
    return None;
  }
  if !ownership.preserve_existing {
    return Some(Vec::new());
  }
  let paths = if payload.ownership_changed {
    payload.manifest.files.iter().map(|f| f.path.clone()).collect()
  } else {
    copied
  };
  (!paths.is_empty()).then_some(paths)
}

/// Tar the given source-relative paths, preserving their relative layout.
fn build_archive(source: &Path, paths: &[String]) -> Result<Vec<u8>> {
  let mut builder = tar::Builder::new(Vec::new());
  builder.follow_symlinks(false);
  for rel in paths {
    let full: PathBuf = source.join(rel);
    builder
      .append_path_with_name(&full, rel)
      .map_err(|e| Error::io(OP, full.display(), e))?;
  }
  builder
    .into_inner()
    .map_err(|e| Error::io(OP, source.display(), e))
}
