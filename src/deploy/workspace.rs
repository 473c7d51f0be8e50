//! On-disk workspace for one application.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

use crate::config::DEPLOYMENT_LOG_FILE;
use crate::errors::{DeployError, DeployResult};

/// Scratch subdirectory the fetcher clones into before promotion.
pub const STAGING_DIR: &str = ".gitdeploy-staging";

/// Entries of a fetched tree that are never promoted into the workspace.
const UNPROMOTED: &[&str] = &[".git", DEPLOYMENT_LOG_FILE];

pub fn staging_dir(workspace: &Path) -> PathBuf {
    workspace.join(STAGING_DIR)
}

/// Run a synchronous tree operation on the blocking pool. The calling task
/// stays cancellable, so a deployment timeout still fires mid-walk.
pub async fn blocking<F, R>(f: F) -> DeployResult<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DeployError::Unexpected(anyhow::anyhow!("Filesystem task panicked: {}", e)))
}

/// Top-level `*.log` files survive cleaning.
fn is_preserved(name: &OsStr) -> bool {
    Path::new(name).extension() == Some(OsStr::new("log"))
}

/// Guarantee a clean destination: create the directory if absent, otherwise
/// remove everything in it except top-level log files.
///
/// Not transactional. A failure part way through leaves a partially cleaned
/// directory.
pub fn prepare(workspace: &Path) -> Result<usize> {
    if !workspace.exists() {
        std::fs::create_dir_all(workspace)
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;
        return Ok(0);
    }
    if !workspace.is_dir() {
        bail!("Workspace {} exists and is not a directory", workspace.display());
    }

    let mut removed = 0;
    for entry in std::fs::read_dir(workspace)
        .with_context(|| format!("Failed to read workspace {}", workspace.display()))?
    {
        let entry = entry.context("Failed to read workspace entry")?;
        let file_type = entry.file_type().context("Failed to stat workspace entry")?;
        let path = entry.path();
        if file_type.is_file() && is_preserved(&entry.file_name()) {
            continue;
        }
        let result = if file_type.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.with_context(|| format!("Failed to remove {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

/// Move the contents of `staging` into `workspace` and delete `staging`.
///
/// A surviving log file in the workspace is never overwritten by a file of
/// the same name in the fetched tree.
pub fn promote(staging: &Path, workspace: &Path) -> Result<usize> {
    let mut moved = 0;
    for entry in std::fs::read_dir(staging)
        .with_context(|| format!("Failed to read staging directory {}", staging.display()))?
    {
        let entry = entry.context("Failed to read staging entry")?;
        let name = entry.file_name();
        if UNPROMOTED.iter().any(|skip| name == OsStr::new(skip)) {
            continue;
        }
        let target = workspace.join(&name);
        if target.exists() {
            if is_preserved(&name) {
                continue;
            }
            let result = if target.is_dir() {
                std::fs::remove_dir_all(&target)
            } else {
                std::fs::remove_file(&target)
            };
            result.with_context(|| format!("Failed to replace {}", target.display()))?;
        }
        std::fs::rename(entry.path(), &target)
            .with_context(|| format!("Failed to move {} into workspace", name.to_string_lossy()))?;
        moved += 1;
    }
    std::fs::remove_dir_all(staging)
        .with_context(|| format!("Failed to remove staging directory {}", staging.display()))?;
    Ok(moved)
}

/// Apply `mode` to every file and directory under `workspace`. Symlinks are
/// left alone.
#[cfg(unix)]
pub fn set_permissions(workspace: &Path, mode: u32) -> Result<usize> {
    use std::os::unix::fs::PermissionsExt;

    let mut changed = 0;
    for entry in WalkDir::new(workspace) {
        let entry = entry.context("Failed to walk workspace")?;
        if entry.path_is_symlink() {
            continue;
        }
        std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set permissions on {}", entry.path().display()))?;
        changed += 1;
    }
    Ok(changed)
}

#[cfg(not(unix))]
pub fn set_permissions(workspace: &Path, _mode: u32) -> Result<usize> {
    Ok(WalkDir::new(workspace).into_iter().count())
}

/// `chown -R owner workspace`. The owner string is validated at config load.
pub async fn chown(workspace: &Path, owner: &str) -> Result<()> {
    let output = tokio::process::Command::new("chown")
        .arg("-R")
        .arg(owner)
        .arg("--")
        .arg(workspace)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .context("Failed to run chown")?;
    if !output.status.success() {
        bail!(
            "chown exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
