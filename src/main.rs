use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "gitdeploy")]
#[command(version, about = "Clone Git repositories into servable PHP applications")]
pub struct Cli {
    /// Path to gitdeploy.toml (defaults to ./gitdeploy.toml when present)
    #[arg(short, long, global = true, env = "GITDEPLOY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database path. Overrides the config file and environment.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Parent directory of all application workspaces
    #[arg(long, global = true)]
    pub apps_root: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit diagnostics as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and working directories
    Init,
    /// Register and list applications
    App {
        #[command(subcommand)]
        command: AppCommands,
    },
    /// Manage variables injected into every deployed application
    Env {
        #[command(subcommand)]
        command: EnvCommands,
    },
    /// Trigger a deployment for an application
    Deploy {
        application_id: i64,

        /// Poll until the deployment finishes
        #[arg(long)]
        wait: bool,

        /// Seconds between polls with --wait
        #[arg(long, default_value = "1")]
        interval: u64,
    },
    /// Run one pending deployment to completion (invoked by the dispatcher)
    Worker { deployment_id: i64 },
    /// Show the status of a deployment
    Status {
        deployment_id: i64,

        #[arg(long)]
        json: bool,
    },
    /// Show the latest deployment log of an application
    Logs { application_id: i64 },
    /// List deployments of an application, most recent first
    History {
        application_id: i64,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
    /// Fail deployments that were abandoned by their worker
    Sweep,
    /// Serve the JSON trigger and status API
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum AppCommands {
    /// Register an application
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        repository: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Workspace directory name under the apps root
        #[arg(long)]
        directory: String,

        #[arg(long)]
        description: Option<String>,
    },
    /// List registered applications
    List,
}

#[derive(Subcommand, Clone)]
pub enum EnvCommands {
    /// Set (or replace) a variable
    Set {
        key: String,
        value: String,

        #[arg(long)]
        description: Option<String>,

        /// Mask the value in listings
        #[arg(long)]
        sensitive: bool,
    },
    /// List variables (sensitive values masked)
    List,
    /// Remove a variable
    Unset { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = cmd::load_config(&cli)?;
    let log_guard = cmd::init_diagnostics(&cli, &config)?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::App { command } => cmd::cmd_app(&config, command.clone()).await?,
        Commands::Env { command } => cmd::cmd_env(&config, command.clone()).await?,
        Commands::Deploy {
            application_id,
            wait,
            interval,
        } => {
            let code = cmd::cmd_deploy(config, *application_id, *wait, *interval).await?;
            if code != 0 {
                drop(log_guard);
                std::process::exit(code);
            }
        }
        Commands::Worker { deployment_id } => {
            let code = cmd::cmd_worker(config, *deployment_id).await?;
            drop(log_guard);
            std::process::exit(code);
        }
        Commands::Status {
            deployment_id,
            json,
        } => cmd::cmd_status(config, *deployment_id, *json).await?,
        Commands::Logs { application_id } => cmd::cmd_logs(config, *application_id).await?,
        Commands::History {
            application_id,
            limit,
        } => cmd::cmd_history(&config, *application_id, *limit).await?,
        Commands::Sweep => cmd::cmd_sweep(config).await?,
        Commands::Serve { port, host } => {
            cmd::cmd_serve(config, *port, host.clone()).await?;
        }
    }

    Ok(())
}
