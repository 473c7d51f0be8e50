//! Layered configuration for gitdeploy.
//!
//! Values are resolved in order: built-in defaults, then `gitdeploy.toml`
//! (or the file named by `--config` / `GITDEPLOY_CONFIG`), then
//! `GITDEPLOY_*` environment variables, then CLI flags applied by the caller.
//!
//! ```toml
//! db_path = ".gitdeploy/gitdeploy.db"
//! apps_root = "/app/code/apps"
//! deployment_timeout_secs = 300
//! launcher = "process"
//!
//! [tools]
//! composer = "/usr/local/bin/composer"
//!
//! [workspace]
//! dir_mode = 0o755
//! owner = "www-data:www-data"
//!
//! [server]
//! port = 8087
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "gitdeploy.toml";

/// Name of the append-only log kept in every workspace.
pub const DEPLOYMENT_LOG_FILE: &str = "deployment.log";

/// How the dispatcher hands a deployment to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    /// Detached `gitdeploy worker <id>` OS process.
    #[default]
    Process,
    /// Supervised tokio task inside the current process.
    Task,
}

impl std::str::FromStr for LauncherKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "task" => Ok(Self::Task),
            _ => bail!("Invalid launcher '{}'. Valid values: process, task", s),
        }
    }
}

/// External programs the pipeline invokes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub git: String,
    pub composer: String,
    pub npm: String,
    pub php: String,
    /// Where the composer installer is downloaded from when `composer` is missing.
    pub composer_installer_url: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            composer: "composer".to_string(),
            npm: "npm".to_string(),
            php: "php".to_string(),
            composer_installer_url: "https://getcomposer.org/installer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Mode applied recursively to the workspace after the fetch.
    pub dir_mode: u32,
    /// Optional `user[:group]` handed to `chown -R`.
    pub owner: Option<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir_mode: 0o755,
            owner: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8087,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub db_path: PathBuf,
    pub apps_root: PathBuf,
    pub state_dir: PathBuf,
    pub deployment_timeout_secs: u64,
    pub stale_grace_secs: u64,
    pub launcher: LauncherKind,
    pub log_level: String,
    pub log_json: bool,
    pub tools: ToolsConfig,
    pub workspace: WorkspaceConfig,
    pub server: ServerSection,
    /// Config file this was loaded from; forwarded to spawned workers.
    #[serde(skip)]
    pub source_file: Option<PathBuf>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".gitdeploy/gitdeploy.db"),
            apps_root: PathBuf::from("apps"),
            state_dir: PathBuf::from(".gitdeploy"),
            deployment_timeout_secs: 300,
            stale_grace_secs: 60,
            launcher: LauncherKind::default(),
            log_level: "info".to_string(),
            log_json: false,
            tools: ToolsConfig::default(),
            workspace: WorkspaceConfig::default(),
            server: ServerSection::default(),
            source_file: None,
        }
    }
}

impl DeployConfig {
    /// Load configuration from `path`, or from `gitdeploy.toml` in the current
    /// directory when no path is given and that file exists. Environment
    /// overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.source_file = Some(path.to_path_buf());
        Ok(config)
    }

    /// Apply `GITDEPLOY_*` overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GITDEPLOY_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("GITDEPLOY_APPS_ROOT") {
            self.apps_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("GITDEPLOY_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("GITDEPLOY_TIMEOUT_SECS") {
            self.deployment_timeout_secs = v
                .parse()
                .with_context(|| format!("GITDEPLOY_TIMEOUT_SECS is not a number: '{}'", v))?;
        }
        if let Some(v) = lookup("GITDEPLOY_LAUNCHER") {
            self.launcher = v.parse()?;
        }
        if let Some(v) = lookup("GITDEPLOY_LOG_LEVEL") {
            self.log_level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.deployment_timeout_secs == 0 {
            bail!("deployment_timeout_secs must be greater than zero");
        }
        if let Some(owner) = &self.workspace.owner {
            validate_owner(owner)?;
        }
        Ok(())
    }

    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs)
    }

    /// Age after which a non-terminal deployment is treated as abandoned.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs + self.stale_grace_secs)
    }

    pub fn workspace_dir(&self, directory: &str) -> PathBuf {
        self.apps_root.join(directory)
    }

    pub fn deployment_log_path(&self, directory: &str) -> PathBuf {
        self.workspace_dir(directory).join(DEPLOYMENT_LOG_FILE)
    }

    /// Private HOME/cache root for dependency installers of one application.
    pub fn installer_home(&self, directory: &str) -> PathBuf {
        self.state_dir.join("homes").join(directory)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Environment that makes a spawned worker resolve the same settings as
    /// this process, whatever mix of file, env and flags produced them.
    pub fn worker_env(&self) -> Vec<(&'static str, OsString)> {
        vec![
            ("GITDEPLOY_DB_PATH", self.db_path.clone().into_os_string()),
            ("GITDEPLOY_APPS_ROOT", self.apps_root.clone().into_os_string()),
            ("GITDEPLOY_STATE_DIR", self.state_dir.clone().into_os_string()),
            (
                "GITDEPLOY_TIMEOUT_SECS",
                self.deployment_timeout_secs.to_string().into(),
            ),
            ("GITDEPLOY_LOG_LEVEL", self.log_level.clone().into()),
        ]
    }

    pub fn ensure_directories(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        std::fs::create_dir_all(&self.apps_root).context("Failed to create apps root")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }
}

fn validate_owner(owner: &str) -> Result<()> {
    let valid_part = |s: &str| {
        !s.is_empty()
            && !s.starts_with('-')
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    };
    let ok = match owner.split_once(':') {
        Some((user, group)) => valid_part(user) && valid_part(group),
        None => valid_part(owner),
    };
    if !ok {
        bail!("Invalid workspace owner '{}'. Expected user or user:group", owner);
    }
    Ok(())
}
