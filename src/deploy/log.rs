//! The user-visible deployment log.
//!
//! One writer per deployment. Every line goes to `deployment.log` in the
//! workspace and to the in-memory copy, which is then persisted to the
//! `deployments.log` column before the next line is accepted. Readers of
//! either store therefore see lines in the order they were written.

use std::path::PathBuf;

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::db::DbHandle;

pub const START_MARKER: &str = "Starting deployment...";

pub struct DeploymentLog {
    db: DbHandle,
    deployment_id: i64,
    file: Option<PathBuf>,
    buffer: String,
}

impl DeploymentLog {
    /// Move the deployment to `running`, seeding the persisted log with the
    /// start marker.
    pub async fn begin(db: DbHandle, deployment_id: i64, file: Option<PathBuf>) -> Result<Self> {
        let buffer = format!("{}\n", START_MARKER);
        let seed = buffer.clone();
        db.call(move |db| db.mark_running(deployment_id, &seed)).await?;

        let log = Self {
            db,
            deployment_id,
            file,
            buffer,
        };
        log.append_file(&format!(
            "Deployment {} started at {}\n",
            deployment_id,
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S")
        ))
        .await;
        Ok(log)
    }

    /// Append a line and persist the whole log.
    pub async fn line(&mut self, message: impl AsRef<str>) -> Result<()> {
        self.append_local(message.as_ref()).await;
        let snapshot = self.buffer.clone();
        let id = self.deployment_id;
        let persisted = self
            .db
            .call(move |db| db.update_running_log(id, &snapshot))
            .await?;
        if !persisted {
            warn!(deployment_id = id, "deployment is no longer running; log line not persisted");
        }
        Ok(())
    }

    /// Append without a DB write. The caller persists the text with the
    /// terminal transition.
    pub async fn append_local(&mut self, message: &str) {
        let mut text = message.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.append_file(&text).await;
        self.buffer.push_str(&text);
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn deployment_id(&self) -> i64 {
        self.deployment_id
    }

    async fn append_file(&self, text: &str) {
        let Some(path) = &self.file else {
            return;
        };
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(text.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(
                deployment_id = self.deployment_id,
                path = %path.display(),
                error = %e,
                "failed to append to deployment log file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::db::DeployDb;
    use crate::deploy::db::tests::demo_app;
    use crate::deploy::models::DeploymentStatus;

    fn setup() -> Result<(DbHandle, i64)> {
        let db = DeployDb::new_in_memory()?;
        let app = db.create_application(&demo_app())?;
        let dep = db.create_pending_deployment(app.id, "Deployment initiated...\n")?;
        Ok((DbHandle::new(db), dep.id))
    }

    #[tokio::test]
    async fn test_begin_marks_running_and_seeds_log() -> Result<()> {
        let (db, id) = setup()?;
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("demo").join("deployment.log");

        let log = DeploymentLog::begin(db.clone(), id, Some(file.clone())).await?;
        assert_eq!(log.text(), "Starting deployment...\n");

        let dep = db.call(move |db| db.get_deployment(id)).await?.unwrap();
        assert_eq!(dep.status, DeploymentStatus::Running);
        assert_eq!(dep.log, "Starting deployment...\n");

        let on_disk = std::fs::read_to_string(&file)?;
        assert!(on_disk.starts_with(&format!("Deployment {} started at", id)));
        Ok(())
    }

    #[tokio::test]
    async fn test_lines_are_persisted_in_order() -> Result<()> {
        let (db, id) = setup()?;
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("deployment.log");

        let mut log = DeploymentLog::begin(db.clone(), id, Some(file.clone())).await?;
        for i in 0..5 {
            log.line(format!("step {}", i)).await?;
            let expected = log.text().to_string();
            let persisted = db.call(move |db| db.get_deployment(id)).await?.unwrap().log;
            assert_eq!(persisted, expected, "DB must hold every line written so far");
        }

        let persisted = db.call(move |db| db.get_deployment(id)).await?.unwrap().log;
        let positions: Vec<usize> = (0..5)
            .map(|i| persisted.find(&format!("step {}\n", i)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));

        let on_disk = std::fs::read_to_string(&file)?;
        assert!(on_disk.ends_with("step 3\nstep 4\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_file_log_accumulates_across_runs() -> Result<()> {
        let (db, id) = setup()?;
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("deployment.log");
        std::fs::write(&file, "from an earlier run\n")?;

        let mut log = DeploymentLog::begin(db, id, Some(file.clone())).await?;
        log.line("fresh line").await?;

        let on_disk = std::fs::read_to_string(&file)?;
        assert!(on_disk.starts_with("from an earlier run\n"));
        assert!(on_disk.ends_with("fresh line\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_append_local_skips_db_until_terminal_write() -> Result<()> {
        let (db, id) = setup()?;
        let mut log = DeploymentLog::begin(db.clone(), id, None).await?;
        log.append_local("ERROR: boom").await;
        assert!(log.text().ends_with("ERROR: boom\n"));

        let persisted = db.call(move |db| db.get_deployment(id)).await?.unwrap().log;
        assert!(!persisted.contains("boom"));
        Ok(())
    }
}
