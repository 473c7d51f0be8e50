use anyhow::{Result, bail};
use gitdeploy::config::DeployConfig;
use gitdeploy::deploy::models::NewApplication;
use gitdeploy::deploy::validate::{
    is_valid_env_key, validate_branch, validate_directory, validate_repository_url,
};

use super::setup::open_db;
use super::super::{AppCommands, EnvCommands};

pub async fn cmd_app(config: &DeployConfig, command: AppCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        AppCommands::Add {
            name,
            repository,
            branch,
            directory,
            description,
        } => {
            validate_repository_url(&repository)?;
            validate_branch(&branch)?;
            validate_directory(&directory)?;
            let new_app = NewApplication {
                name,
                description,
                repository,
                branch,
                directory,
            };
            let app = db.call(move |db| db.create_application(&new_app)).await?;
            println!("Registered application {} ({})", app.id, app.name);
            println!("  Workspace: {}", config.workspace_dir(&app.directory).display());
        }
        AppCommands::List => {
            let apps = db.call(|db| db.list_applications()).await?;
            if apps.is_empty() {
                println!("No applications registered.");
                return Ok(());
            }
            println!(
                "{:<5} {:<20} {:<10} {:<10} {:<20} {}",
                "ID", "NAME", "STATUS", "DEPLOYED", "LAST DEPLOY", "REPOSITORY"
            );
            for app in apps {
                println!(
                    "{:<5} {:<20} {:<10} {:<10} {:<20} {} ({})",
                    app.id,
                    app.name,
                    app.status.as_str(),
                    if app.deployed { "yes" } else { "no" },
                    app.last_deploy.as_deref().unwrap_or("-"),
                    app.repository,
                    app.branch
                );
            }
        }
    }
    Ok(())
}

pub async fn cmd_env(config: &DeployConfig, command: EnvCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        EnvCommands::Set {
            key,
            value,
            description,
            sensitive,
        } => {
            if !is_valid_env_key(&key) {
                bail!("Invalid variable name '{}': use letters, digits and underscores", key);
            }
            let var = db
                .call(move |db| db.set_env_var(&key, &value, description.as_deref(), sensitive))
                .await?;
            println!("Set {}", var.key);
        }
        EnvCommands::List => {
            let vars = db.call(|db| db.list_env_vars()).await?;
            if vars.is_empty() {
                println!("No custom environment variables defined.");
                return Ok(());
            }
            for var in vars {
                match &var.description {
                    Some(desc) => println!("{}={}  # {}", var.key, var.display_value(), desc),
                    None => println!("{}={}", var.key, var.display_value()),
                }
            }
        }
        EnvCommands::Unset { key } => {
            let lookup = key.clone();
            if db.call(move |db| db.delete_env_var(&lookup)).await? {
                println!("Removed {}", key);
            } else {
                bail!("Variable '{}' is not defined", key);
            }
        }
    }
    Ok(())
}
