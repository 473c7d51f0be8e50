//! Trigger boundary: single-flight admission and handoff to a worker.
//!
//! The `pending` row is the durable handoff. A launcher only has to get a
//! worker started for it; if that fails the row is failed on the spot so the
//! attempt is never silently lost.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::db::DbHandle;
use super::models::Deployment;
use super::worker::{EXIT_COMPLETED, EXIT_FAILED, EXIT_NOT_CLAIMED, Worker};
use crate::config::{DeployConfig, LauncherKind};
use crate::errors::{DeployError, DeployResult};

pub const INITIAL_LOG: &str = "Deployment initiated...\n";

/// Starts a worker for a `pending` deployment without waiting for it.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, deployment_id: i64) -> Result<()>;

    /// Wait for workers owned by this process. Detached workers are not
    /// owned, so the default returns immediately.
    async fn join_all(&self) {}
}

/// Runs `gitdeploy worker <id>` as a detached OS process.
pub struct ProcessLauncher {
    db: DbHandle,
    config: Arc<DeployConfig>,
    exe: PathBuf,
}

impl ProcessLauncher {
    pub fn new(db: DbHandle, config: Arc<DeployConfig>) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the gitdeploy executable")?;
        Ok(Self::with_executable(db, config, exe))
    }

    pub fn with_executable(db: DbHandle, config: Arc<DeployConfig>, exe: PathBuf) -> Self {
        Self { db, config, exe }
    }

    fn worker_log(&self, deployment_id: i64) -> Result<std::fs::File> {
        let dir = self.config.log_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create worker log directory {}", dir.display()))?;
        let path = dir.join(format!("worker-{}.log", deployment_id));
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open worker log {}", path.display()))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, deployment_id: i64) -> Result<()> {
        let stdout = self.worker_log(deployment_id)?;
        let stderr = stdout.try_clone().context("Failed to clone worker log handle")?;

        let mut cmd = tokio::process::Command::new(&self.exe);
        cmd.arg("worker").arg(deployment_id.to_string());
        if let Some(config_file) = &self.config.source_file {
            cmd.arg("--config").arg(config_file);
        }
        cmd.envs(self.config.worker_env())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        // Own process group: a signal aimed at the caller does not reach the worker.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.exe.display()))?;
        debug!(deployment_id, pid = ?child.id(), "worker process spawned");

        // Best effort: only runs while this process lives. A worker that
        // outlives us is covered by the stale sweep instead.
        let db = self.db.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status,
                Err(e) => {
                    warn!(deployment_id, error = %e, "failed to wait for worker process");
                    return;
                }
            };
            if matches!(status.code(), Some(EXIT_COMPLETED | EXIT_FAILED | EXIT_NOT_CLAIMED)) {
                debug!(deployment_id, %status, "worker process exited");
                return;
            }
            let message = format!("\nERROR: Deployment worker exited unexpectedly ({})\n", status);
            match db.call(move |db| db.abort_deployment(deployment_id, &message)).await {
                Ok(true) => error!(deployment_id, %status, "worker died; deployment failed"),
                Ok(false) => {}
                Err(e) => error!(deployment_id, error = %e, "failed to record worker exit"),
            }
        });
        Ok(())
    }
}

/// Runs the worker as a supervised tokio task in this process.
pub struct TaskLauncher {
    db: DbHandle,
    worker: Arc<Worker>,
    tasks: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl TaskLauncher {
    pub fn new(db: DbHandle, worker: Arc<Worker>) -> Self {
        Self {
            db,
            worker,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Deployment ids whose task is still running.
    pub fn active(&self) -> Vec<i64> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<i64> = tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl Launcher for TaskLauncher {
    async fn launch(&self, deployment_id: i64) -> Result<()> {
        let worker = self.worker.clone();
        let db = self.db.clone();
        let supervisor = tokio::spawn(async move {
            let run = tokio::spawn(async move { worker.run(deployment_id).await });
            match run.await {
                Ok(Ok(deployment)) => {
                    info!(deployment_id, status = %deployment.status, "deployment task finished")
                }
                Ok(Err(e)) => warn!(deployment_id, error = %e, "deployment task did not run"),
                Err(join_error) => {
                    let message = format!("\nERROR: Deployment worker crashed: {}\n", join_error);
                    let recorded = db
                        .call(move |db| db.abort_deployment(deployment_id, &message))
                        .await;
                    if let Err(e) = recorded {
                        error!(deployment_id, error = %e, "failed to record worker crash");
                    }
                }
            }
        });

        let mut tasks = self
            .tasks
            .lock()
            .map_err(|e| anyhow::anyhow!("task registry poisoned: {}", e))?;
        tasks.retain(|_, handle| !handle.is_finished());
        tasks.insert(deployment_id, supervisor);
        Ok(())
    }

    async fn join_all(&self) {
        let active = self.active();
        if !active.is_empty() {
            info!(?active, "waiting for in-process deployments");
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "deployment supervisor failed");
            }
        }
    }
}

/// Launcher selected by `config.launcher`.
pub fn launcher_for(db: DbHandle, config: Arc<DeployConfig>) -> Result<Arc<dyn Launcher>> {
    Ok(match config.launcher {
        LauncherKind::Process => Arc::new(ProcessLauncher::new(db, config)?),
        LauncherKind::Task => {
            let worker = Arc::new(Worker::with_git(db.clone(), config));
            Arc::new(TaskLauncher::new(db, worker))
        }
    })
}

#[derive(Clone)]
pub struct Dispatcher {
    db: DbHandle,
    config: Arc<DeployConfig>,
    launcher: Arc<dyn Launcher>,
}

impl Dispatcher {
    pub fn new(db: DbHandle, config: Arc<DeployConfig>, launcher: Arc<dyn Launcher>) -> Self {
        Self { db, config, launcher }
    }

    /// Admit a new deployment for `application_id` and hand it to a worker.
    ///
    /// Returns as soon as the worker has been started. `NotFound` and
    /// `Conflict` are decided by a single conditional insert.
    pub async fn start_deployment(&self, application_id: i64) -> DeployResult<Deployment> {
        let stale_after = self.config.stale_after();
        let deployment = self
            .db
            .call_typed(move |db| {
                let expired = db
                    .expire_stale_deployments(stale_after, Some(application_id))
                    .map_err(DeployError::Database)?;
                if !expired.is_empty() {
                    warn!(application_id, ?expired, "expired abandoned deployments");
                }
                db.create_pending_deployment(application_id, INITIAL_LOG)
            })
            .await?;
        info!(application_id, deployment_id = deployment.id, "deployment queued");

        if let Err(e) = self.launcher.launch(deployment.id).await {
            error!(deployment_id = deployment.id, error = %e, "failed to start deployment worker");
            let id = deployment.id;
            let message = format!("ERROR: Failed to start deployment worker: {:#}\n", e);
            if let Err(mark) = self.db.call(move |db| db.abort_deployment(id, &message)).await {
                error!(deployment_id = id, error = %mark, "failed to record launch failure");
            }
            return Err(DeployError::Unexpected(
                e.context(format!("Failed to start worker for deployment {}", id)),
            ));
        }
        Ok(deployment)
    }

    /// Fail every abandoned deployment. Returns the ids that were expired.
    pub async fn sweep(&self) -> Result<Vec<i64>> {
        let stale_after = self.config.stale_after();
        let expired = self
            .db
            .call(move |db| db.expire_stale_deployments(stale_after, None))
            .await?;
        if !expired.is_empty() {
            warn!(?expired, "expired abandoned deployments");
        }
        Ok(expired)
    }

    /// Launch workers for `pending` rows nobody picked up. Returns how many
    /// were launched.
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self.db.call(|db| db.list_pending_deployments()).await?;
        let mut launched = 0;
        for deployment in pending {
            let id = deployment.id;
            match self.launcher.launch(id).await {
                Ok(()) => launched += 1,
                Err(e) => {
                    error!(deployment_id = id, error = %e, "failed to resume deployment");
                    let message = format!("ERROR: Failed to start deployment worker: {:#}\n", e);
                    self.db.call(move |db| db.abort_deployment(id, &message)).await?;
                }
            }
        }
        if launched > 0 {
            info!(launched, "resumed pending deployments");
        }
        Ok(launched)
    }
}
