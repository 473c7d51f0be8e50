//! Typed error hierarchy for the deployment pipeline.
//!
//! `DeployError` is what collaborators see. `NotFound` and `Conflict` are
//! raised synchronously by the dispatcher; every other variant is produced
//! inside a worker, written to the deployment log, and resolved by failing
//! the deployment.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("A deployment is already in progress for application {application_id}")]
    Conflict { application_id: i64 },

    #[error("Failed to fetch repository: {0}")]
    FetchFailed(String),

    #[error("Dependency install warning: {0}")]
    InstallWarning(String),

    #[error("Failed to write generated file {path}: {source}")]
    InjectionFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0:#}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl DeployError {
    pub fn application_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "Application",
            id,
        }
    }

    pub fn deployment_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: "Deployment",
            id,
        }
    }
}

pub type DeployResult<T> = std::result::Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_entity() {
        let err = DeployError::application_not_found(7);
        assert_eq!(err.to_string(), "Application 7 not found");
        let err = DeployError::deployment_not_found(3);
        assert_eq!(err.to_string(), "Deployment 3 not found");
    }

    #[test]
    fn conflict_carries_application_id() {
        let err = DeployError::Conflict { application_id: 42 };
        match &err {
            DeployError::Conflict { application_id } => assert_eq!(*application_id, 42),
            _ => panic!("Expected Conflict variant"),
        }
        assert!(err.to_string().contains("already in progress"));
    }

    #[test]
    fn injection_failed_exposes_io_source() {
        use std::error::Error as _;
        let err = DeployError::InjectionFailed {
            path: PathBuf::from("/apps/demo/index.php"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/apps/demo/index.php"));
        let source = err.source().expect("source should be set");
        assert!(source.to_string().contains("denied"));
    }

    #[test]
    fn anyhow_converts_to_unexpected() {
        fn fails() -> DeployResult<()> {
            Err(anyhow::anyhow!("disk on fire"))?
        }
        match fails() {
            Err(DeployError::Unexpected(e)) => assert_eq!(e.to_string(), "disk on fire"),
            other => panic!("Expected Unexpected, got {:?}", other),
        }
    }
}
