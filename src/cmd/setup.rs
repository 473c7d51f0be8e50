use anyhow::{Context, Result};
use gitdeploy::config::DeployConfig;
use gitdeploy::deploy::db::{DbHandle, DeployDb};
use gitdeploy::logging::{LogOptions, init_logging};
use tracing_appender::non_blocking::WorkerGuard;

use super::super::{Cli, Commands};

/// Resolve configuration: file, then `GITDEPLOY_*` environment, then flags.
pub fn load_config(cli: &Cli) -> Result<DeployConfig> {
    let mut config = DeployConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(root) = &cli.apps_root {
        config.apps_root = root.clone();
    }
    if cli.verbose {
        config.log_level = "debug".to_string();
    }
    if cli.log_json {
        config.log_json = true;
    }
    config.validate()?;
    Ok(config)
}

/// Workers and the server also write a rolling file under the state dir.
pub fn init_diagnostics(cli: &Cli, config: &DeployConfig) -> Result<Option<WorkerGuard>> {
    let file_prefix = match &cli.command {
        Commands::Worker { .. } => Some("worker.log"),
        Commands::Serve { .. } => Some("server.log"),
        _ => None,
    };
    let options = LogOptions {
        level: config.log_level.clone(),
        json: config.log_json,
        stderr: true,
        log_dir: file_prefix.map(|_| config.log_dir()),
        file_prefix: file_prefix.unwrap_or("gitdeploy.log").to_string(),
    };
    init_logging(&options)
}

pub fn open_db(config: &DeployConfig) -> Result<DbHandle> {
    config.ensure_directories()?;
    let db = DeployDb::new(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    Ok(DbHandle::new(db))
}

pub fn cmd_init(config: &DeployConfig) -> Result<()> {
    open_db(config)?;
    println!("Database:   {}", config.db_path.display());
    println!("Apps root:  {}", config.apps_root.display());
    println!("State dir:  {}", config.state_dir.display());
    println!();
    println!("Register an application with:");
    println!("  gitdeploy app add --name <NAME> --repository <URL> --directory <DIR>");
    Ok(())
}
