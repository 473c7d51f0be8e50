use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use gitdeploy::config::DeployConfig;
use gitdeploy::deploy::dispatcher::{Dispatcher, launcher_for};
use gitdeploy::deploy::models::DeploymentStatus;
use gitdeploy::deploy::status::StatusReporter;
use gitdeploy::deploy::worker::{EXIT_COMPLETED, EXIT_FAILED, EXIT_NOT_CLAIMED, Worker};
use gitdeploy::errors::DeployError;
use tracing::{error, info};

use super::setup::open_db;

/// Trigger a deployment. Returns the process exit code: non-zero only
/// when `--wait` observed a failed deployment.
pub async fn cmd_deploy(
    config: DeployConfig,
    application_id: i64,
    wait: bool,
    interval_secs: u64,
) -> Result<i32> {
    let config = Arc::new(config);
    let db = open_db(&config)?;
    let launcher = launcher_for(db.clone(), config.clone())?;
    let dispatcher = Dispatcher::new(db.clone(), config.clone(), launcher.clone());

    let deployment = match dispatcher.start_deployment(application_id).await {
        Ok(deployment) => deployment,
        Err(DeployError::Conflict { .. }) => {
            let active = db
                .call(move |db| db.active_deployment_for_application(application_id))
                .await?;
            match active {
                Some(active) => bail!(
                    "Deployment {} is already {} for application {}; check it with `gitdeploy status {}`",
                    active.id,
                    active.status,
                    application_id,
                    active.id
                ),
                None => bail!(
                    "A deployment is already in progress for application {}",
                    application_id
                ),
            }
        }
        Err(e) => return Err(e.into()),
    };
    println!(
        "Deployment {} queued for application {}",
        deployment.id, application_id
    );

    if !wait {
        // In-process workers would die with us.
        launcher.join_all().await;
        return Ok(EXIT_COMPLETED);
    }

    let reporter = StatusReporter::new(db, config);
    let interval = Duration::from_secs(interval_secs.max(1));
    let mut last = DeploymentStatus::Pending;
    let report = loop {
        let report = reporter.status(deployment.id).await?;
        if report.status != last {
            println!("Status: {}", report.status);
            last = report.status;
        }
        if report.status.is_terminal() {
            break report;
        }
        tokio::time::sleep(interval).await;
    };
    launcher.join_all().await;

    println!();
    println!("{}", report.log.trim_end());
    Ok(match report.status {
        DeploymentStatus::Completed => EXIT_COMPLETED,
        _ => EXIT_FAILED,
    })
}

/// Execute one deployment in this process. The exit code tells a
/// supervising launcher how the run ended.
pub async fn cmd_worker(config: DeployConfig, deployment_id: i64) -> Result<i32> {
    let config = Arc::new(config);
    let db = open_db(&config)?;
    let worker = Worker::with_git(db, config);
    match worker.run(deployment_id).await {
        Ok(deployment) => {
            info!(deployment_id, status = %deployment.status, "worker finished");
            Ok(match deployment.status {
                DeploymentStatus::Completed => EXIT_COMPLETED,
                _ => EXIT_FAILED,
            })
        }
        Err(e) => {
            error!(deployment_id, error = %e, "deployment not claimed");
            eprintln!("{}", e);
            Ok(EXIT_NOT_CLAIMED)
        }
    }
}

pub async fn cmd_sweep(config: DeployConfig) -> Result<()> {
    let config = Arc::new(config);
    let db = open_db(&config)?;
    let launcher = launcher_for(db.clone(), config.clone())?;
    let dispatcher = Dispatcher::new(db, config, launcher);

    let expired = dispatcher.sweep().await?;
    if expired.is_empty() {
        println!("No abandoned deployments.");
    } else {
        let ids: Vec<String> = expired.iter().map(|id| id.to_string()).collect();
        println!("Expired {} deployment(s): {}", expired.len(), ids.join(", "));
    }
    Ok(())
}
