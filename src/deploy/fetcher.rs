//! Source retrieval: shallow single-branch clone into a staging
//! subdirectory, then promotion into the workspace.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::workspace;
use crate::errors::{DeployError, DeployResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Commit at the tip of the fetched branch, when it could be determined.
    pub commit: Option<String>,
}

/// Produces a source tree for `repository@branch` in `staging`.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn retrieve(
        &self,
        repository: &str,
        branch: &str,
        staging: &Path,
    ) -> DeployResult<FetchOutcome>;
}

/// `git` CLI fetcher. Arguments are passed as an array; nothing is
/// interpolated into a shell.
pub struct GitFetcher {
    git: String,
}

impl GitFetcher {
    pub fn new(git: impl Into<String>) -> Self {
        Self { git: git.into() }
    }

    async fn head_commit(&self, repo: &Path) -> Option<String> {
        let output = Command::new(&self.git)
            .arg("-C")
            .arg(repo)
            .args(["rev-parse", "HEAD"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!commit.is_empty()).then_some(commit)
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn retrieve(
        &self,
        repository: &str,
        branch: &str,
        staging: &Path,
    ) -> DeployResult<FetchOutcome> {
        debug!(repository, branch, staging = %staging.display(), "cloning");
        let output = Command::new(&self.git)
            .args(["clone", "--depth", "1", "--single-branch", "--branch", branch, "--"])
            .arg(repository)
            .arg(staging)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DeployError::FetchFailed(format!("could not run '{}': {}", self.git, e)))?;

        if !output.status.success() {
            return Err(DeployError::FetchFailed(format!(
                "git clone exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(FetchOutcome {
            commit: self.head_commit(staging).await,
        })
    }
}

/// Fetch `repository@branch` into `workspace`.
///
/// On success the workspace holds the fetched tree and no staging
/// directory. A missing staging directory after retrieval is a fetch failure
/// whatever the fetcher reported.
pub async fn fetch_into(
    fetcher: &dyn SourceFetcher,
    repository: &str,
    branch: &str,
    workspace: &Path,
) -> DeployResult<FetchOutcome> {
    let staging = workspace::staging_dir(workspace);
    if staging.exists() {
        tokio::fs::remove_dir_all(&staging).await.map_err(|e| {
            DeployError::FetchFailed(format!("could not clear {}: {}", staging.display(), e))
        })?;
    }

    let result = fetcher.retrieve(repository, branch, &staging).await;

    if !staging.is_dir() {
        let detail = match result {
            Err(DeployError::FetchFailed(msg)) => msg,
            Err(e) => e.to_string(),
            Ok(_) => "fetcher reported success".to_string(),
        };
        return Err(DeployError::FetchFailed(format!(
            "{} was not created ({})",
            staging.display(),
            detail
        )));
    }
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                warn!(error = %cleanup, "failed to remove staging directory after failed fetch");
            }
            return Err(e);
        }
    };

    let target = workspace.to_path_buf();
    workspace::blocking(move || workspace::promote(&staging, &target))
        .await?
        .map_err(|e| {
            DeployError::FetchFailed(format!("could not promote fetched tree: {:#}", e))
        })?;
    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    /// Writes a fixed set of files instead of talking to a remote.
    pub(crate) struct ScriptedFetcher {
        pub files: BTreeMap<String, String>,
        pub create_tree: bool,
        pub fail_with: Option<String>,
    }

    impl ScriptedFetcher {
        pub(crate) fn with_files(files: &[(&str, &str)]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                create_tree: true,
                fail_with: None,
            }
        }

        pub(crate) fn unreachable() -> Self {
            Self {
                files: BTreeMap::new(),
                create_tree: false,
                fail_with: Some("could not resolve host example.invalid".to_string()),
            }
        }
    }

    #[async_trait]
    impl SourceFetcher for ScriptedFetcher {
        async fn retrieve(
            &self,
            _repository: &str,
            _branch: &str,
            staging: &Path,
        ) -> DeployResult<FetchOutcome> {
            if self.create_tree {
                for (name, content) in &self.files {
                    let path = staging.join(name);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent).map_err(anyhow::Error::from)?;
                    }
                    std::fs::write(&path, content).map_err(anyhow::Error::from)?;
                }
                std::fs::create_dir_all(staging).map_err(anyhow::Error::from)?;
            }
            match &self.fail_with {
                Some(msg) => Err(DeployError::FetchFailed(msg.clone())),
                None => Ok(FetchOutcome {
                    commit: Some("0123456789abcdef0123456789abcdef01234567".to_string()),
                }),
            }
        }
    }

    #[tokio::test]
    async fn test_fetch_into_promotes_tree() {
        let root = tempdir().unwrap();
        let ws = root.path().join("demo");
        std::fs::create_dir_all(&ws).unwrap();
        let fetcher = ScriptedFetcher::with_files(&[
            ("index.php", "<?php echo 'hi';"),
            ("lib/a.php", "<?php"),
        ]);

        let outcome = fetch_into(&fetcher, "https://example.com/demo.git", "main", &ws)
            .await
            .unwrap();
        assert!(outcome.commit.is_some());
        assert!(ws.join("index.php").is_file());
        assert!(ws.join("lib/a.php").is_file());
        assert!(!workspace::staging_dir(&ws).exists());
    }

    #[tokio::test]
    async fn test_missing_tree_is_a_failure_even_on_success() {
        let root = tempdir().unwrap();
        let ws = root.path().join("demo");
        std::fs::create_dir_all(&ws).unwrap();
        let fetcher = ScriptedFetcher {
            files: BTreeMap::new(),
            create_tree: false,
            fail_with: None,
        };

        match fetch_into(&fetcher, "https://example.com/demo.git", "main", &ws).await {
            Err(DeployError::FetchFailed(msg)) => assert!(msg.contains("reported success")),
            other => panic!("Expected FetchFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_staging_behind() {
        let root = tempdir().unwrap();
        let ws = root.path().join("demo");
        std::fs::create_dir_all(&ws).unwrap();
        let mut fetcher = ScriptedFetcher::with_files(&[("partial.txt", "x")]);
        fetcher.fail_with = Some("connection reset".to_string());

        let err = fetch_into(&fetcher, "https://example.com/demo.git", "main", &ws)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::FetchFailed(_)));
        assert!(!workspace::staging_dir(&ws).exists());
        assert!(!ws.join("partial.txt").exists());
    }

    #[tokio::test]
    async fn test_git_fetcher_reports_unreachable_repository() {
        if which::which("git").is_err() {
            return;
        }
        let root = tempdir().unwrap();
        let ws = root.path().join("demo");
        std::fs::create_dir_all(&ws).unwrap();
        let missing = root.path().join("does-not-exist.git");
        let url = format!("file://{}", missing.display());

        let err = fetch_into(&GitFetcher::new("git"), &url, "main", &ws)
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::FetchFailed(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_git_fetcher_reports_missing_binary() {
        let root = tempdir().unwrap();
        let ws = root.path().join("demo");
        std::fs::create_dir_all(&ws).unwrap();
        let fetcher = GitFetcher::new("/nonexistent/bin/git-not-here");

        match fetch_into(&fetcher, "https://example.com/demo.git", "main", &ws).await {
            Err(DeployError::FetchFailed(msg)) => assert!(msg.contains("could not run")),
            other => panic!("Expected FetchFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_git_fetcher_clones_local_repository() {
        if which::which("git").is_err() {
            return;
        }
        let root = tempdir().unwrap();
        let origin = root.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        let git = |args: &[&str]| {
            std::process::Command::new("git")
                .arg("-C")
                .arg(&origin)
                .args(args)
                .env("GIT_AUTHOR_NAME", "test")
                .env("GIT_AUTHOR_EMAIL", "test@example.com")
                .env("GIT_COMMITTER_NAME", "test")
                .env("GIT_COMMITTER_EMAIL", "test@example.com")
                .output()
                .unwrap()
        };
        assert!(git(&["init", "-q"]).status.success());
        assert!(git(&["symbolic-ref", "HEAD", "refs/heads/main"]).status.success());
        std::fs::write(origin.join("index.php"), "<?php echo 'hello';\n").unwrap();
        assert!(git(&["add", "."]).status.success());
        assert!(git(&["commit", "-q", "-m", "initial"]).status.success());

        let ws = root.path().join("demo");
        std::fs::create_dir_all(&ws).unwrap();
        let url = format!("file://{}", origin.display());
        let outcome = fetch_into(&GitFetcher::new("git"), &url, "main", &ws)
            .await
            .unwrap();

        assert_eq!(outcome.commit.as_ref().map(|c| c.len()), Some(40));
        assert!(ws.join("index.php").is_file());
        assert!(!ws.join(".git").exists());
        assert!(!workspace::staging_dir(&ws).exists());
    }
}
