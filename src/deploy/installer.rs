//! Dependency installation for PHP (composer) and Node (npm) manifests.
//!
//! Installer failures never abort a deployment. Each one is reported as an
//! `InstallWarning` line in the deployment log and the pipeline carries on.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use tokio::process::Command;
use tracing::{info, warn};

use super::log::DeploymentLog;
use crate::config::ToolsConfig;
use crate::errors::{DeployError, DeployResult};

const COMPOSER_MANIFEST: &str = "composer.json";
const NPM_MANIFEST: &str = "package.json";

/// Lines of installer output kept in the deployment log on failure.
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manager {
    Composer,
    Npm,
}

impl Manager {
    pub fn manifest(&self) -> &'static str {
        match self {
            Self::Composer => COMPOSER_MANIFEST,
            Self::Npm => NPM_MANIFEST,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Composer => "composer",
            Self::Npm => "npm",
        }
    }
}

/// Managers whose manifest is present in `workspace`, PHP first.
pub fn detect_manifests(workspace: &Path) -> Vec<Manager> {
    [Manager::Composer, Manager::Npm]
        .into_iter()
        .filter(|m| workspace.join(m.manifest()).is_file())
        .collect()
}

pub struct Installer {
    tools: ToolsConfig,
    /// Private HOME and cache root. Never the invoking user's home.
    home: PathBuf,
}

impl Installer {
    pub fn new(tools: ToolsConfig, home: PathBuf) -> Self {
        Self { tools, home }
    }

    /// Run every applicable installer, writing progress to `log`.
    ///
    /// Only a failure to persist the log is returned as an error.
    pub async fn install(&self, workspace: &Path, log: &mut DeploymentLog) -> Result<()> {
        let managers = detect_manifests(workspace);
        if managers.is_empty() {
            log.line("No dependency manifest found, skipping install").await?;
            return Ok(());
        }

        for manager in managers {
            log.line(format!(
                "Found {}, installing {} dependencies...",
                manager.manifest(),
                manager.label()
            ))
            .await?;
            match self.run(manager, workspace).await {
                Ok(summary) => {
                    log.line(format!("{} install finished: {}", manager.label(), summary))
                        .await?
                }
                Err(e) => {
                    warn!(
                        deployment_id = log.deployment_id(),
                        error = %e,
                        "dependency install failed"
                    );
                    log.line(format!("WARNING: {}", e)).await?;
                }
            }
        }
        Ok(())
    }

    async fn run(&self, manager: Manager, workspace: &Path) -> DeployResult<String> {
        let program = match manager {
            Manager::Composer => self.resolve_composer().await?,
            Manager::Npm => which::which(&self.tools.npm).map_err(|_| {
                DeployError::InstallWarning(format!(
                    "'{}' not found; Node dependencies were not installed",
                    self.tools.npm
                ))
            })?,
        };
        let args: &[&str] = match manager {
            Manager::Composer => &[
                "install",
                "--no-dev",
                "--optimize-autoloader",
                "--no-interaction",
                "--no-progress",
            ],
            Manager::Npm => &["install", "--omit=dev", "--no-audit", "--no-fund"],
        };

        self.ensure_home()?;
        let output = self
            .command(&program)
            .args(args)
            .current_dir(workspace)
            .output()
            .await
            .map_err(|e| {
                DeployError::InstallWarning(format!("could not run {}: {}", program.display(), e))
            })?;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(DeployError::InstallWarning(format!(
                "{} install exited with {}:\n{}",
                manager.label(),
                output.status,
                tail(&combined, OUTPUT_TAIL_LINES)
            )));
        }
        Ok(tail(&combined, 1).trim().to_string())
    }

    /// Locate composer, bootstrapping it into the private home once when it
    /// is not installed.
    async fn resolve_composer(&self) -> DeployResult<PathBuf> {
        if let Ok(path) = which::which(&self.tools.composer) {
            return Ok(path);
        }
        let bootstrapped = self.home.join("bin").join("composer");
        if bootstrapped.is_file() {
            return Ok(bootstrapped);
        }
        info!(url = %self.tools.composer_installer_url, "composer not found, bootstrapping");
        self.bootstrap_composer(&bootstrapped).await.map_err(|e| {
            DeployError::InstallWarning(format!(
                "'{}' not found and bootstrap failed: {:#}",
                self.tools.composer, e
            ))
        })?;
        Ok(bootstrapped)
    }

    async fn bootstrap_composer(&self, target: &Path) -> Result<()> {
        let php = which::which(&self.tools.php)
            .map_err(|_| anyhow::anyhow!("'{}' not found", self.tools.php))?;
        self.ensure_home()?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let installer = client
            .get(&self.tools.composer_installer_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let setup = self.home.join("composer-setup.php");
        tokio::fs::write(&setup, &installer).await?;

        let install_dir = target
            .parent()
            .ok_or_else(|| anyhow::anyhow!("bootstrap target has no parent"))?;
        tokio::fs::create_dir_all(install_dir).await?;
        let output = self
            .command(&php)
            .arg(&setup)
            .arg(format!("--install-dir={}", install_dir.display()))
            .arg("--filename=composer")
            .output()
            .await?;
        let _ = tokio::fs::remove_file(&setup).await;
        if !output.status.success() || !target.is_file() {
            anyhow::bail!(
                "composer installer exited with {}: {}",
                output.status,
                tail(&String::from_utf8_lossy(&output.stderr), OUTPUT_TAIL_LINES)
            );
        }
        Ok(())
    }

    fn command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("HOME", &self.home)
            .env("COMPOSER_HOME", self.home.join("composer"))
            .env("COMPOSER_CACHE_DIR", self.home.join("cache").join("composer"))
            .env("npm_config_cache", self.home.join("cache").join("npm"))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn ensure_home(&self) -> DeployResult<()> {
        std::fs::create_dir_all(&self.home).map_err(|e| {
            DeployError::InstallWarning(format!(
                "could not create installer home {}: {}",
                self.home.display(),
                e
            ))
        })
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
