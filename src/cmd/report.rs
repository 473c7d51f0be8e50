use std::sync::Arc;

use anyhow::Result;
use gitdeploy::config::DeployConfig;
use gitdeploy::deploy::status::StatusReporter;
use gitdeploy::errors::DeployError;

use super::setup::open_db;

pub async fn cmd_status(config: DeployConfig, deployment_id: i64, json: bool) -> Result<()> {
    let config = Arc::new(config);
    let reporter = StatusReporter::new(open_db(&config)?, config);
    let report = reporter.status(deployment_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("Deployment:  {}", report.deployment.id);
    println!("Application: {}", report.app_name);
    println!("Status:      {} ({}%)", report.status, report.progress);
    if let Some(commit) = &report.deployment.commit_hash {
        println!("Commit:      {}", commit);
    }
    println!("Started:     {}", report.started_at);
    if let Some(done) = &report.completed_at {
        println!("Completed:   {}", done);
    }
    println!();
    println!("{}", report.log.trim_end());
    Ok(())
}

pub async fn cmd_logs(config: DeployConfig, application_id: i64) -> Result<()> {
    let config = Arc::new(config);
    let reporter = StatusReporter::new(open_db(&config)?, config);
    let view = reporter.logs(application_id).await?;
    if let Some(deployment) = &view.deployment {
        println!("== {} / deployment {} ({}) ==", view.app_name, deployment.id, deployment.status);
    }
    println!("{}", view.log.trim_end());
    Ok(())
}

pub async fn cmd_history(config: &DeployConfig, application_id: i64, limit: i64) -> Result<()> {
    let db = open_db(config)?;
    let (app, deployments) = db
        .call(move |db| {
            let app = db.get_application(application_id)?;
            let deployments = db.list_deployments_for_application(application_id, limit)?;
            Ok((app, deployments))
        })
        .await?;
    let app = app.ok_or_else(|| DeployError::application_not_found(application_id))?;

    if deployments.is_empty() {
        println!("No deployments for {}.", app.name);
        return Ok(());
    }
    println!("{:<6} {:<10} {:<20} {:<20} {}", "ID", "STATUS", "STARTED", "COMPLETED", "COMMIT");
    for d in deployments {
        println!(
            "{:<6} {:<10} {:<20} {:<20} {}",
            d.id,
            d.status.as_str(),
            d.started_at,
            d.completed_at.as_deref().unwrap_or("-"),
            d.commit_hash.as_deref().map(|c| &c[..c.len().min(12)]).unwrap_or("-")
        );
    }
    Ok(())
}
