//! The one-shot deployment worker.
//!
//! Drives a single deployment from `pending` to a terminal state:
//!
//! ```text
//! pending ──▶ running ──▶ prepare ─▶ fetch ─▶ permissions ─▶ install ─▶ inject ──▶ completed
//!                │                                                                │
//!                └──────────────── any fatal error or timeout ─────────────────▶ failed
//! ```
//!
//! Pipeline errors never escape `Worker::run`; they end up in the log and
//! the deployment is failed.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::db::DbHandle;
use super::fetcher::{self, GitFetcher, SourceFetcher};
use super::injector::{self, EntryPointAction};
use super::installer::Installer;
use super::log::DeploymentLog;
use super::models::{Deployment, DeploymentJob, DeploymentStatus};
use super::validate::{validate_branch, validate_directory, validate_repository_url};
use super::workspace;
use crate::config::DeployConfig;
use crate::errors::{DeployError, DeployResult};

/// Exit codes of the `worker` command.
pub const EXIT_COMPLETED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
/// The deployment was missing or already claimed; nothing was changed.
pub const EXIT_NOT_CLAIMED: i32 = 2;

pub struct Worker {
    db: DbHandle,
    config: Arc<DeployConfig>,
    fetcher: Arc<dyn SourceFetcher>,
}

impl Worker {
    pub fn new(db: DbHandle, config: Arc<DeployConfig>, fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self { db, config, fetcher }
    }

    /// Worker backed by the `git` binary named in the config.
    pub fn with_git(db: DbHandle, config: Arc<DeployConfig>) -> Self {
        let fetcher = Arc::new(GitFetcher::new(config.tools.git.clone()));
        Self::new(db, config, fetcher)
    }

    /// Run deployment `deployment_id` to completion and return its terminal
    /// row.
    ///
    /// Errors are returned only when the deployment cannot be claimed: it
    /// does not exist or is no longer `pending`.
    pub async fn run(&self, deployment_id: i64) -> DeployResult<Deployment> {
        let job = self
            .db
            .call(move |db| db.get_deployment_job(deployment_id))
            .await
            .map_err(DeployError::Database)?
            .ok_or_else(|| DeployError::deployment_not_found(deployment_id))?;
        if job.deployment.status != DeploymentStatus::Pending {
            return Err(DeployError::Unexpected(anyhow::anyhow!(
                "Deployment {} is {}, not pending",
                deployment_id,
                job.deployment.status
            )));
        }

        let log_file = validate_directory(&job.application.directory)
            .ok()
            .map(|_| self.config.deployment_log_path(&job.application.directory));
        let mut log = DeploymentLog::begin(self.db.clone(), deployment_id, log_file)
            .await
            .map_err(DeployError::Database)?;
        info!(
            deployment_id,
            application_id = job.application.id,
            directory = %job.application.directory,
            "deployment started"
        );

        let timeout = self.config.deployment_timeout();
        let outcome = match tokio::time::timeout(timeout, self.pipeline(&job, &mut log)).await {
            Ok(result) => result,
            Err(_) => Err(DeployError::Unexpected(anyhow::anyhow!(
                "Deployment timed out after {} seconds",
                timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(()) => self.finish_completed(log).await,
            Err(e) => self.finish_failed(log, e).await,
        }
    }

    async fn pipeline(&self, job: &DeploymentJob, log: &mut DeploymentLog) -> DeployResult<()> {
        let app = &job.application;
        let id = job.deployment.id;
        validate_directory(&app.directory)?;
        validate_branch(&app.branch)?;
        validate_repository_url(&app.repository)?;

        let dest = self.config.workspace_dir(&app.directory);
        log.line("Cleaning existing files...").await?;
        let target = dest.clone();
        let removed = workspace::blocking(move || workspace::prepare(&target)).await??;
        log.line(format!("Removed {} entries from {}", removed, dest.display()))
            .await?;

        log.line(format!("Cloning repository: {}", app.repository)).await?;
        log.line(format!("Branch: {}", app.branch)).await?;
        let fetched =
            fetcher::fetch_into(self.fetcher.as_ref(), &app.repository, &app.branch, &dest)
                .await?;
        match fetched.commit {
            Some(commit) => {
                log.line(format!("Fetched commit {}", commit)).await?;
                self.db
                    .call(move |db| db.set_commit_hash(id, &commit))
                    .await?;
            }
            None => log.line("Repository fetched").await?,
        }

        log.line("Setting file permissions...").await?;
        let mode = self.config.workspace.dir_mode;
        let target = dest.clone();
        let changed =
            workspace::blocking(move || workspace::set_permissions(&target, mode)).await??;
        log.line(format!("Applied mode {:o} to {} entries", mode, changed))
            .await?;
        if let Some(owner) = &self.config.workspace.owner {
            match workspace::chown(&dest, owner).await {
                Ok(()) => log.line(format!("Changed owner to {}", owner)).await?,
                Err(e) => {
                    warn!(deployment_id = id, error = %e, "chown failed");
                    log.line(format!("WARNING: could not change owner to {}: {:#}", owner, e))
                        .await?
                }
            }
        }

        Installer::new(self.config.tools.clone(), self.config.installer_home(&app.directory))
            .install(&dest, log)
            .await?;

        log.line("Setting up custom environment variables...").await?;
        let variables = self.db.call(|db| db.list_env_vars()).await?;
        let (target, target_app) = (dest.clone(), app.clone());
        let report =
            workspace::blocking(move || injector::inject(&target, &variables, &target_app))
                .await??;
        for key in &report.skipped_keys {
            log.line(format!("Skipped variable with invalid name '{}'", key)).await?;
        }
        if report.variables_written == 0 {
            log.line("No custom environment variables defined.").await?;
        } else {
            log.line(format!(
                "Created {} with {} variables.",
                injector::ENV_FILE,
                report.variables_written
            ))
            .await?;
        }
        log.line(format!("Created {}.", injector::BOOTSTRAP_FILE)).await?;
        let entry = match report.entry_point {
            EntryPointAction::Unchanged => "index.php already includes auto-include.php.",
            EntryPointAction::Rewritten => "Updated index.php to load auto-include.php.",
            EntryPointAction::Generated => "No index.php found; generated a landing page.",
        };
        log.line(entry).await?;
        if report.htaccess_written {
            log.line("Created default .htaccess file.").await?;
        }
        Ok(())
    }

    async fn finish_completed(&self, mut log: DeploymentLog) -> DeployResult<Deployment> {
        let id = log.deployment_id();
        log.append_local(&format!(
            "Deployment completed successfully at {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
        ))
        .await;
        let text = log.text().to_string();
        match self.db.call(move |db| db.complete_deployment(id, &text)).await {
            Ok(deployment) => {
                info!(deployment_id = id, "deployment completed");
                Ok(deployment)
            }
            // The row left `running` under us, typically expired by a sweep.
            Err(e) => self.current_row(id, e).await,
        }
    }

    async fn finish_failed(
        &self,
        mut log: DeploymentLog,
        cause: DeployError,
    ) -> DeployResult<Deployment> {
        let id = log.deployment_id();
        error!(deployment_id = id, error = %cause, "deployment failed");
        log.append_local(&format!("\nERROR: Deployment failed: {}", cause))
            .await;
        let text = log.text().to_string();
        match self.db.call(move |db| db.fail_deployment(id, &text)).await {
            Ok(deployment) => Ok(deployment),
            Err(e) => self.current_row(id, e).await,
        }
    }

    async fn current_row(&self, id: i64, cause: anyhow::Error) -> DeployResult<Deployment> {
        warn!(deployment_id = id, error = %cause, "terminal transition not applied");
        self.db
            .call(move |db| db.get_deployment(id))
            .await
            .map_err(DeployError::Database)?
            .ok_or_else(|| DeployError::deployment_not_found(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::db::DeployDb;
    use crate::deploy::db::tests::demo_app;
    use crate::deploy::fetcher::tests::ScriptedFetcher;
    use crate::deploy::models::NewApplication;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Harness {
        _dir: TempDir,
        db: DbHandle,
        config: Arc<DeployConfig>,
    }

    impl Harness {
        fn new() -> Result<Self> {
            let dir = tempdir()?;
            let config = DeployConfig {
                apps_root: dir.path().join("apps"),
                state_dir: dir.path().join("state"),
                tools: crate::config::ToolsConfig {
                    composer: "/nonexistent/composer".into(),
                    npm: "/nonexistent/npm".into(),
                    php: "/nonexistent/php".into(),
                    ..Default::default()
                },
                ..Default::default()
            };
            Ok(Self {
                _dir: dir,
                db: DbHandle::new(DeployDb::new_in_memory()?),
                config: Arc::new(config),
            })
        }

        async fn trigger(&self, app: NewApplication) -> Result<(i64, i64)> {
            let (app_id, dep_id) = self
                .db
                .call_typed(move |db| {
                    let app = db.create_application(&app)?;
                    let dep = db.create_pending_deployment(app.id, "Deployment initiated...\n")?;
                    Ok((app.id, dep.id))
                })
                .await?;
            Ok((app_id, dep_id))
        }

        fn worker(&self, fetcher: impl SourceFetcher + 'static) -> Worker {
            Worker::new(self.db.clone(), self.config.clone(), Arc::new(fetcher))
        }

        async fn deployed(&self, app_id: i64) -> Result<bool> {
            Ok(self
                .db
                .call(move |db| db.get_application(app_id))
                .await?
                .map(|a| a.deployed)
                .unwrap_or(false))
        }
    }

    #[tokio::test]
    async fn test_successful_deployment_end_to_end() -> Result<()> {
        let h = Harness::new()?;
        h.db
            .call(|db| db.set_env_var("API_KEY", "s3cr3t", None, true))
            .await?;
        let (app_id, dep_id) = h.trigger(demo_app()).await?;

        let fetcher = ScriptedFetcher::with_files(&[
            ("index.php", "<?php\necho 'demo';\n"),
            ("README.md", "# demo"),
        ]);
        let done = h.worker(fetcher).run(dep_id).await?;

        assert_eq!(done.status, DeploymentStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.commit_hash.as_deref(), Some("0123456789abcdef0123456789abcdef01234567"));
        assert!(done.log.starts_with("Starting deployment...\n"));
        assert!(done.log.contains("Cloning repository: https://example.com/demo.git"));
        assert!(done.log.contains("No dependency manifest found"));
        assert!(done.log.contains("Created custom-env.php with 1 variables."));
        assert!(done.log.contains("Deployment completed successfully"));
        assert!(h.deployed(app_id).await?);

        let ws = h.config.workspace_dir("demo");
        assert!(ws.join("README.md").is_file());
        assert!(ws.join("custom-env.php").is_file());
        assert!(ws.join("auto-include.php").is_file());
        assert!(ws.join(".htaccess").is_file());
        assert!(!workspace::staging_dir(&ws).exists());
        let index = std::fs::read_to_string(ws.join("index.php"))?;
        assert_eq!(index.matches("auto-include.php").count(), 1);
        let file_log = std::fs::read_to_string(ws.join("deployment.log"))?;
        assert!(file_log.contains("Deployment completed successfully"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_repository_fails_and_keeps_deployed_flag() -> Result<()> {
        let h = Harness::new()?;
        let (app_id, dep_id) = h.trigger(demo_app()).await?;

        let done = h.worker(ScriptedFetcher::unreachable()).run(dep_id).await?;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(done.completed_at.is_some());
        assert!(done.log.contains("ERROR: Deployment failed: Failed to fetch repository"));
        assert!(done.log.contains("could not resolve host"));
        assert!(!done.log.contains("Deployment completed successfully"));
        assert!(!h.deployed(app_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_redeploy_does_not_undeploy() -> Result<()> {
        let h = Harness::new()?;
        let (app_id, first) = h.trigger(demo_app()).await?;
        h.worker(ScriptedFetcher::with_files(&[("index.php", "<?php")]))
            .run(first)
            .await?;
        assert!(h.deployed(app_id).await?);

        let second = h
            .db
            .call_typed(move |db| db.create_pending_deployment(app_id, "Deployment initiated...\n"))
            .await?
            .id;
        let done = h.worker(ScriptedFetcher::unreachable()).run(second).await?;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(h.deployed(app_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_log_file_survives_repeated_deployments() -> Result<()> {
        let h = Harness::new()?;
        let (app_id, first) = h.trigger(demo_app()).await?;
        h.worker(ScriptedFetcher::with_files(&[("index.php", "<?php")]))
            .run(first)
            .await?;
        let log_path = h.config.deployment_log_path("demo");
        let after_first = std::fs::read_to_string(&log_path)?;
        assert!(!after_first.is_empty());

        let second = h
            .db
            .call_typed(move |db| db.create_pending_deployment(app_id, "Deployment initiated...\n"))
            .await?
            .id;
        h.worker(ScriptedFetcher::with_files(&[("index.php", "<?php")]))
            .run(second)
            .await?;
        let after_second = std::fs::read_to_string(&log_path)?;
        assert!(after_second.starts_with(&after_first));
        assert!(after_second.len() > after_first.len());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_directory_fails_before_touching_disk() -> Result<()> {
        let h = Harness::new()?;
        let app = NewApplication {
            directory: "../escape".to_string(),
            ..demo_app()
        };
        let (app_id, dep_id) = h.trigger(app).await?;

        let done = h
            .worker(ScriptedFetcher::with_files(&[("index.php", "<?php")]))
            .run(dep_id)
            .await?;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(done.log.contains("Invalid input: directory '../escape'"));
        assert!(!h.config.apps_root.join("..").join("escape").exists());
        assert!(!h.deployed(app_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_option_like_branch_is_rejected() -> Result<()> {
        let h = Harness::new()?;
        let app = NewApplication {
            branch: "--upload-pack=touch /tmp/pwned".to_string(),
            ..demo_app()
        };
        let (_, dep_id) = h.trigger(app).await?;
        let done = h.worker(ScriptedFetcher::with_files(&[])).run(dep_id).await?;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(done.log.contains("invalid branch name"));
        Ok(())
    }

    struct StallingFetcher;

    #[async_trait]
    impl SourceFetcher for StallingFetcher {
        async fn retrieve(
            &self,
            _: &str,
            _: &str,
            _: &Path,
        ) -> DeployResult<fetcher::FetchOutcome> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(fetcher::FetchOutcome::default())
        }
    }

    #[tokio::test]
    async fn test_timeout_fails_the_deployment() -> Result<()> {
        let mut h = Harness::new()?;
        Arc::get_mut(&mut h.config).unwrap().deployment_timeout_secs = 1;
        let (app_id, dep_id) = h.trigger(demo_app()).await?;

        let done = h.worker(StallingFetcher).run(dep_id).await?;
        assert_eq!(done.status, DeploymentStatus::Failed);
        assert!(done.log.contains("timed out after 1 seconds"));
        assert!(!h.deployed(app_id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_worker_refuses_non_pending_deployment() -> Result<()> {
        let h = Harness::new()?;
        let (_, dep_id) = h.trigger(demo_app()).await?;
        let worker = h.worker(ScriptedFetcher::with_files(&[("index.php", "<?php")]));
        worker.run(dep_id).await?;

        let err = worker.run(dep_id).await.unwrap_err();
        assert!(err.to_string().contains("not pending"));

        assert!(matches!(
            worker.run(dep_id + 100).await,
            Err(DeployError::NotFound { entity: "Deployment", .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_variables_still_bootstraps() -> Result<()> {
        let h = Harness::new()?;
        let (_, dep_id) = h.trigger(demo_app()).await?;
        let done = h
            .worker(ScriptedFetcher::with_files(&[("app.php", "<?php")]))
            .run(dep_id)
            .await?;
        assert_eq!(done.status, DeploymentStatus::Completed);
        assert!(done.log.contains("No custom environment variables defined."));
        assert!(done.log.contains("generated a landing page"));

        let ws = h.config.workspace_dir("demo");
        assert!(!ws.join("custom-env.php").exists());
        let bootstrap = std::fs::read_to_string(ws.join("auto-include.php"))?;
        for key in ["APP_NAME", "APP_ID", "APP_DIRECTORY"] {
            assert!(bootstrap.contains(key));
        }
        assert!(ws.join("index.php").is_file());
        Ok(())
    }
}
