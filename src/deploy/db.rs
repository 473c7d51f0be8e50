use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::{DeployError, DeployResult};

/// Async-safe handle to the deployment database.
///
/// Wraps `DeployDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
/// off the async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<DeployDb>>,
}

impl DbHandle {
    pub fn new(db: DeployDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DeployDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Like `call`, for closures that already speak `DeployError`.
    pub async fn call_typed<F, R>(&self, f: F) -> DeployResult<R>
    where
        F: FnOnce(&DeployDb) -> DeployResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| DeployError::Database(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| DeployError::Unexpected(anyhow::anyhow!("DB task panicked: {}", e)))?
    }
}

const APPLICATION_COLUMNS: &str = "id, name, description, repository, branch, directory, status, \
     deployed, last_deploy, created_at, updated_at";
const DEPLOYMENT_COLUMNS: &str =
    "id, application_id, commit_hash, status, log, started_at, completed_at";

pub struct DeployDb {
    conn: Connection,
}

impl DeployDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    ///
    /// The connection uses WAL and a busy timeout so the dispatcher, detached
    /// workers, and pollers can share one file.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("Failed to enable WAL")?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            anyhow::bail!("SQLite refused WAL journal mode (got '{}')", journal_mode);
        }
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS applications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT,
                    repository TEXT NOT NULL,
                    branch TEXT NOT NULL DEFAULT 'main',
                    directory TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL DEFAULT 'inactive',
                    deployed INTEGER NOT NULL DEFAULT 0,
                    last_deploy TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    application_id INTEGER NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
                    commit_hash TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    log TEXT NOT NULL DEFAULT '',
                    started_at TEXT NOT NULL DEFAULT (datetime('now')),
                    claimed_at TEXT,
                    completed_at TEXT,
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS custom_env_vars (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    var_key TEXT NOT NULL UNIQUE,
                    var_value TEXT NOT NULL DEFAULT '',
                    description TEXT,
                    is_sensitive INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_applications_deployed ON applications(deployed);
                CREATE INDEX IF NOT EXISTS idx_deployments_app_id ON deployments(application_id);
                ",
            )
            .context("Failed to create tables")?;

        // Databases created before claims were timestamped.
        if !self.has_column("deployments", "claimed_at")? {
            self.conn
                .execute_batch("ALTER TABLE deployments ADD COLUMN claimed_at TEXT;")
                .context("Failed to add deployments.claimed_at")?;
        }

        // At most one non-terminal deployment per application. The insert in
        // `create_pending_deployment` relies on this index for atomicity.
        self.conn
            .execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_single_flight
                 ON deployments(application_id)
                 WHERE status IN ('pending', 'running');",
            )
            .context("Failed to create single-flight index")?;

        Ok(())
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .context("Failed to read table info")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .context("Failed to query table info")?;
        for name in names {
            if name.context("Failed to read column name")? == column {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ── Applications ──────────────────────────────────────────────────

    pub fn create_application(&self, app: &NewApplication) -> Result<Application> {
        self.conn
            .execute(
                "INSERT INTO applications (name, description, repository, branch, directory)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![app.name, app.description, app.repository, app.branch, app.directory],
            )
            .context("Failed to insert application")?;
        let id = self.conn.last_insert_rowid();
        self.get_application(id)?
            .context("Application not found after insert")
    }

    pub fn get_application(&self, id: i64) -> Result<Option<Application>> {
        let sql = format!("SELECT {} FROM applications WHERE id = ?1", APPLICATION_COLUMNS);
        self.conn
            .query_row(&sql, params![id], ApplicationRow::from_row)
            .optional()
            .context("Failed to query application")?
            .map(ApplicationRow::into_application)
            .transpose()
    }

    pub fn list_applications(&self) -> Result<Vec<Application>> {
        let sql = format!("SELECT {} FROM applications ORDER BY name, id", APPLICATION_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_applications")?;
        let rows = stmt
            .query_map([], ApplicationRow::from_row)
            .context("Failed to query applications")?;
        let mut apps = Vec::new();
        for row in rows {
            apps.push(row.context("Failed to read application row")?.into_application()?);
        }
        Ok(apps)
    }

    // ── Custom environment variables ──────────────────────────────────

    /// Insert or replace a variable by key.
    pub fn set_env_var(
        &self,
        key: &str,
        value: &str,
        description: Option<&str>,
        is_sensitive: bool,
    ) -> Result<CustomEnvVar> {
        self.conn
            .execute(
                "INSERT INTO custom_env_vars (var_key, var_value, description, is_sensitive)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(var_key) DO UPDATE SET
                    var_value = excluded.var_value,
                    description = excluded.description,
                    is_sensitive = excluded.is_sensitive,
                    updated_at = datetime('now')",
                params![key, value, description, is_sensitive],
            )
            .context("Failed to upsert custom env var")?;
        self.conn
            .query_row(
                "SELECT id, var_key, var_value, description, is_sensitive
                 FROM custom_env_vars WHERE var_key = ?1",
                params![key],
                env_var_from_row,
            )
            .context("Custom env var not found after upsert")
    }

    pub fn delete_env_var(&self, key: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM custom_env_vars WHERE var_key = ?1", params![key])
            .context("Failed to delete custom env var")?;
        Ok(n > 0)
    }

    pub fn list_env_vars(&self) -> Result<Vec<CustomEnvVar>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, var_key, var_value, description, is_sensitive
                 FROM custom_env_vars ORDER BY var_key",
            )
            .context("Failed to prepare list_env_vars")?;
        let rows = stmt
            .query_map([], env_var_from_row)
            .context("Failed to query custom env vars")?;
        let mut vars = Vec::new();
        for row in rows {
            vars.push(row.context("Failed to read custom env var row")?);
        }
        Ok(vars)
    }

    // ── Deployments ───────────────────────────────────────────────────

    /// Atomically create a `pending` deployment for an application.
    ///
    /// The insert selects from `applications`, so an unknown id inserts
    /// nothing (`NotFound`), and the single-flight index rejects a second
    /// non-terminal row (`Conflict`). There is no separate read before the
    /// write.
    pub fn create_pending_deployment(
        &self,
        application_id: i64,
        initial_log: &str,
    ) -> DeployResult<Deployment> {
        let inserted = self.conn.execute(
            "INSERT INTO deployments (application_id, status, log)
             SELECT id, 'pending', ?2 FROM applications WHERE id = ?1",
            params![application_id, initial_log],
        );
        match inserted {
            Ok(0) => Err(DeployError::application_not_found(application_id)),
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                self.get_deployment(id)
                    .map_err(DeployError::Database)?
                    .ok_or_else(|| DeployError::deployment_not_found(id))
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(DeployError::Conflict { application_id })
            }
            Err(e) => Err(DeployError::Database(
                anyhow::Error::new(e).context("Failed to insert deployment"),
            )),
        }
    }

    pub fn get_deployment(&self, id: i64) -> Result<Option<Deployment>> {
        let sql = format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS);
        self.conn
            .query_row(&sql, params![id], DeploymentRow::from_row)
            .optional()
            .context("Failed to query deployment")?
            .map(DeploymentRow::into_deployment)
            .transpose()
    }

    /// Deployment plus the application it belongs to.
    pub fn get_deployment_job(&self, id: i64) -> Result<Option<DeploymentJob>> {
        let Some(deployment) = self.get_deployment(id)? else {
            return Ok(None);
        };
        let application = self
            .get_application(deployment.application_id)?
            .with_context(|| {
                format!(
                    "Application {} for deployment {} not found",
                    deployment.application_id, id
                )
            })?;
        Ok(Some(DeploymentJob {
            deployment,
            application,
        }))
    }

    /// Deployments of one application, most recent first.
    pub fn list_deployments_for_application(
        &self,
        application_id: i64,
        limit: i64,
    ) -> Result<Vec<Deployment>> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE application_id = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2",
            DEPLOYMENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_deployments_for_application")?;
        let rows = stmt
            .query_map(params![application_id, limit], DeploymentRow::from_row)
            .context("Failed to query deployments")?;
        let mut deployments = Vec::new();
        for row in rows {
            deployments.push(row.context("Failed to read deployment row")?.into_deployment()?);
        }
        Ok(deployments)
    }

    pub fn latest_deployment_for_application(
        &self,
        application_id: i64,
    ) -> Result<Option<Deployment>> {
        Ok(self
            .list_deployments_for_application(application_id, 1)?
            .into_iter()
            .next())
    }

    pub fn active_deployment_for_application(
        &self,
        application_id: i64,
    ) -> Result<Option<Deployment>> {
        let sql = format!(
            "SELECT {} FROM deployments
             WHERE application_id = ?1 AND status IN ('pending', 'running')",
            DEPLOYMENT_COLUMNS
        );
        self.conn
            .query_row(&sql, params![application_id], DeploymentRow::from_row)
            .optional()
            .context("Failed to query active deployment")?
            .map(DeploymentRow::into_deployment)
            .transpose()
    }

    pub fn list_pending_deployments(&self) -> Result<Vec<Deployment>> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE status = 'pending' ORDER BY id",
            DEPLOYMENT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_pending_deployments")?;
        let rows = stmt
            .query_map([], DeploymentRow::from_row)
            .context("Failed to query pending deployments")?;
        let mut deployments = Vec::new();
        for row in rows {
            deployments.push(row.context("Failed to read deployment row")?.into_deployment()?);
        }
        Ok(deployments)
    }

    /// `pending → running`, replacing the log with the run's start marker.
    /// `claimed_at` starts the clock the worker's timeout runs on.
    pub fn mark_running(&self, id: i64, log: &str) -> Result<Deployment> {
        let n = self
            .conn
            .execute(
                "UPDATE deployments
                 SET status = 'running', log = ?1, claimed_at = datetime('now'),
                     updated_at = datetime('now')
                 WHERE id = ?2 AND status = 'pending'",
                params![log, id],
            )
            .context("Failed to mark deployment running")?;
        self.expect_transition(id, n, DeploymentStatus::Running)
    }

    /// Persist the running log. Returns false when the deployment is no
    /// longer running, in which case nothing is written.
    pub fn update_running_log(&self, id: i64, log: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE deployments SET log = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND status = 'running'",
                params![log, id],
            )
            .context("Failed to update deployment log")?;
        Ok(n > 0)
    }

    pub fn set_commit_hash(&self, id: i64, commit_hash: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE deployments SET commit_hash = ?1 WHERE id = ?2 AND status = 'running'",
                params![commit_hash, id],
            )
            .context("Failed to set commit hash")?;
        Ok(())
    }

    /// `running → completed` and flip `applications.deployed`, in one
    /// transaction.
    pub fn complete_deployment(&self, id: i64, log: &str) -> Result<Deployment> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin completion transaction")?;
        let n = tx
            .execute(
                "UPDATE deployments
                 SET status = 'completed', log = ?1,
                     completed_at = datetime('now'), updated_at = datetime('now')
                 WHERE id = ?2 AND status = 'running'",
                params![log, id],
            )
            .context("Failed to mark deployment completed")?;
        if n == 1 {
            tx.execute(
                "UPDATE applications
                 SET deployed = 1, last_deploy = datetime('now'), updated_at = datetime('now')
                 WHERE id = (SELECT application_id FROM deployments WHERE id = ?1)",
                params![id],
            )
            .context("Failed to mark application deployed")?;
        }
        tx.commit().context("Failed to commit completion")?;
        self.expect_transition(id, n, DeploymentStatus::Completed)
    }

    /// Any non-terminal status → `failed`. `applications.deployed` is left
    /// untouched.
    pub fn fail_deployment(&self, id: i64, log: &str) -> Result<Deployment> {
        let n = self
            .conn
            .execute(
                "UPDATE deployments
                 SET status = 'failed', log = ?1,
                     completed_at = datetime('now'), updated_at = datetime('now')
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![log, id],
            )
            .context("Failed to mark deployment failed")?;
        self.expect_transition(id, n, DeploymentStatus::Failed)
    }

    /// Fail a deployment if it is still non-terminal, appending `message` to
    /// whatever log it has. Returns false when it had already finished.
    pub fn abort_deployment(&self, id: i64, message: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "UPDATE deployments
                 SET status = 'failed', log = log || ?1,
                     completed_at = datetime('now'), updated_at = datetime('now')
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![message, id],
            )
            .context("Failed to abort deployment")?;
        Ok(n > 0)
    }

    /// Fail every abandoned deployment, optionally restricted to one
    /// application. Returns the expired ids.
    ///
    /// A `pending` row ages from its insert, a `running` row from its claim.
    /// A run that was claimed late still gets its whole budget.
    pub fn expire_stale_deployments(
        &self,
        older_than: Duration,
        application_id: Option<i64>,
    ) -> Result<Vec<i64>> {
        let modifier = format!("-{} seconds", older_than.as_secs());
        let message = format!(
            "\nERROR: Deployment expired: no terminal status after {} seconds\n",
            older_than.as_secs()
        );
        let mut stmt = self
            .conn
            .prepare(
                "UPDATE deployments
                 SET status = 'failed', log = log || ?1,
                     completed_at = datetime('now'), updated_at = datetime('now')
                 WHERE ((status = 'pending' AND started_at < datetime('now', ?2))
                     OR (status = 'running'
                         AND COALESCE(claimed_at, started_at) < datetime('now', ?2)))
                   AND (?3 IS NULL OR application_id = ?3)
                 RETURNING id",
            )
            .context("Failed to prepare expire_stale_deployments")?;
        let rows = stmt
            .query_map(params![message, modifier, application_id], |row| row.get(0))
            .context("Failed to expire stale deployments")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.context("Failed to read expired deployment id")?);
        }
        Ok(ids)
    }

    fn expect_transition(
        &self,
        id: i64,
        changed: usize,
        to: DeploymentStatus,
    ) -> Result<Deployment> {
        let deployment = self
            .get_deployment(id)?
            .with_context(|| format!("Deployment {} not found", id))?;
        if changed == 0 {
            if deployment.status.can_transition_to(to) {
                anyhow::bail!(
                    "Deployment {} changed concurrently; {} -> {} not applied",
                    id,
                    deployment.status,
                    to
                );
            }
            anyhow::bail!(
                "Illegal transition for deployment {}: {} -> {}",
                id,
                deployment.status,
                to
            );
        }
        Ok(deployment)
    }
}

fn env_var_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CustomEnvVar> {
    Ok(CustomEnvVar {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        description: row.get(3)?,
        is_sensitive: row.get(4)?,
    })
}

struct ApplicationRow {
    id: i64,
    name: String,
    description: Option<String>,
    repository: String,
    branch: String,
    directory: String,
    status: String,
    deployed: bool,
    last_deploy: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ApplicationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            repository: row.get(3)?,
            branch: row.get(4)?,
            directory: row.get(5)?,
            status: row.get(6)?,
            deployed: row.get(7)?,
            last_deploy: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_application(self) -> Result<Application> {
        let status = ApplicationStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse application status")?;
        Ok(Application {
            id: self.id,
            name: self.name,
            description: self.description,
            repository: self.repository,
            branch: self.branch,
            directory: self.directory,
            status,
            deployed: self.deployed,
            last_deploy: self.last_deploy,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct DeploymentRow {
    id: i64,
    application_id: i64,
    commit_hash: Option<String>,
    status: String,
    log: String,
    started_at: String,
    completed_at: Option<String>,
}

impl DeploymentRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            application_id: row.get(1)?,
            commit_hash: row.get(2)?,
            status: row.get(3)?,
            log: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
        })
    }

    fn into_deployment(self) -> Result<Deployment> {
        let status = DeploymentStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse deployment status")?;
        Ok(Deployment {
            id: self.id,
            application_id: self.application_id,
            commit_hash: self.commit_hash,
            status,
            log: self.log,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
