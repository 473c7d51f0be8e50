use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    #[default]
    Inactive,
    Active,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
        }
    }
}

impl FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(Self::Inactive),
            "active" => Ok(Self::Active),
            _ => Err(format!("Invalid application status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub repository: String,
    pub branch: String,
    pub directory: String,
    pub status: ApplicationStatus,
    pub deployed: bool,
    pub last_deploy: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields the admin surface supplies when registering an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApplication {
    pub name: String,
    pub description: Option<String>,
    pub repository: String,
    pub branch: String,
    pub directory: String,
}

/// Lifecycle of one deployment attempt.
///
/// `Pending → Running → Completed | Failed`. The two terminal states are
/// never left again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    /// Coarse progress for pollers. Only "not started / in progress / done /
    /// failed" is meaningful.
    pub fn progress(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 50,
            Self::Completed => 100,
            Self::Failed => 0,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: i64,
    pub application_id: i64,
    pub commit_hash: Option<String>,
    pub status: DeploymentStatus,
    pub log: String,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// A deployment joined with the application fields the worker needs.
#[derive(Debug, Clone)]
pub struct DeploymentJob {
    pub deployment: Deployment,
    pub application: Application,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomEnvVar {
    pub id: i64,
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub is_sensitive: bool,
}

impl CustomEnvVar {
    /// Value suitable for display: sensitive values are masked.
    pub fn display_value(&self) -> &str {
        if self.is_sensitive { "********" } else { &self.value }
    }
}

// API view types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub deployment: Deployment,
    pub app_name: String,
    pub status: DeploymentStatus,
    pub log: String,
    pub progress: u8,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogView {
    pub app_name: String,
    pub deployment: Option<Deployment>,
    pub log: String,
    pub log_file: Option<String>,
}
