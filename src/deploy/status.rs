use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use super::db::DbHandle;
use super::models::{LogView, StatusReport};
use super::validate::validate_directory;
use crate::config::DeployConfig;
use crate::errors::{DeployError, DeployResult};

const LIVE_LOG_SEPARATOR: &str = "\n\n--- Live Deployment Log ---\n";

/// Read-only view of deployment progress for pollers.
#[derive(Clone)]
pub struct StatusReporter {
    db: DbHandle,
    config: Arc<DeployConfig>,
}

impl StatusReporter {
    pub fn new(db: DbHandle, config: Arc<DeployConfig>) -> Self {
        Self { db, config }
    }

    pub async fn status(&self, deployment_id: i64) -> DeployResult<StatusReport> {
        let job = self
            .db
            .call(move |db| db.get_deployment_job(deployment_id))
            .await
            .map_err(DeployError::Database)?
            .ok_or_else(|| DeployError::deployment_not_found(deployment_id))?;

        let log = match self.live_log_path(&job.application.directory) {
            Some(path) => merge_logs(&job.deployment.log, &path),
            None => job.deployment.log.clone(),
        };
        let status = job.deployment.status;
        Ok(StatusReport {
            app_name: job.application.name,
            status,
            log,
            progress: status.progress(),
            started_at: job.deployment.started_at.clone(),
            completed_at: job.deployment.completed_at.clone(),
            deployment: job.deployment,
        })
    }

    /// Latest deployment of an application with its combined log.
    pub async fn logs(&self, application_id: i64) -> DeployResult<LogView> {
        let (app, latest) = self
            .db
            .call(move |db| {
                let app = db.get_application(application_id)?;
                let latest = db.latest_deployment_for_application(application_id)?;
                Ok((app, latest))
            })
            .await
            .map_err(DeployError::Database)?;
        let app = app.ok_or_else(|| DeployError::application_not_found(application_id))?;

        let log_path = self.live_log_path(&app.directory);
        let log_file = log_path
            .as_ref()
            .filter(|path| path.is_file())
            .map(|path| path.display().to_string());
        let log = match &latest {
            Some(deployment) => match &log_path {
                Some(path) => merge_logs(&deployment.log, path),
                None => deployment.log.clone(),
            },
            None => format!("No deployment found for application '{}'.", app.name),
        };
        Ok(LogView {
            app_name: app.name,
            deployment: latest,
            log,
            log_file,
        })
    }

    /// Workspace log file, or `None` when the directory name would not stay
    /// under the apps root.
    fn live_log_path(&self, directory: &str) -> Option<PathBuf> {
        match validate_directory(directory) {
            Ok(()) => Some(self.config.deployment_log_path(directory)),
            Err(e) => {
                warn!(directory, error = %e, "not reading log file for invalid directory");
                None
            }
        }
    }
}

/// The persisted log, followed by the workspace log file when the two
/// differ. The file can be ahead of the last DB write during a run.
pub fn merge_logs(persisted: &str, log_file: &Path) -> String {
    let live = match std::fs::read_to_string(log_file) {
        Ok(live) => live,
        Err(_) => return persisted.to_string(),
    };
    if live.trim().is_empty() || live.trim() == persisted.trim() {
        return persisted.to_string();
    }
    format!("{}{}{}", persisted, LIVE_LOG_SEPARATOR, live)
}
