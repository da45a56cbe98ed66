use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the metadata store.
///
/// Wraps `MetadataStore` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<MetadataStore>>,
}

impl StoreHandle {
    pub fn new(store: MetadataStore) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&MetadataStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| anyhow::anyhow!("store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("store task panicked")?
    }
}

/// SQLite-backed metadata store holding Project, Deployment and EnvVariable
/// records. The core consumes this as an external collaborator; only the
/// operations the pipeline needs are exposed.
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    repo_url TEXT NOT NULL,
                    framework TEXT NOT NULL DEFAULT 'node',
                    production_branch TEXT NOT NULL DEFAULT 'main',
                    install_command TEXT,
                    build_command TEXT,
                    output_directory TEXT,
                    node_version TEXT,
                    auto_deploy INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS deployments (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'pending',
                    build_log TEXT NOT NULL DEFAULT '',
                    url TEXT,
                    branch TEXT NOT NULL,
                    commit_sha TEXT NOT NULL DEFAULT 'latest',
                    commit_message TEXT,
                    container_id TEXT,
                    port INTEGER,
                    is_preview INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                );
                CREATE INDEX IF NOT EXISTS idx_deployments_project
                    ON deployments(project_id);
                CREATE INDEX IF NOT EXISTS idx_deployments_status
                    ON deployments(status);

                CREATE TABLE IF NOT EXISTS env_variables (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    key TEXT NOT NULL,
                    value TEXT NOT NULL,
                    targets TEXT NOT NULL DEFAULT '[\"production\",\"preview\"]',
                    UNIQUE(project_id, key)
                );
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    // ── Projects ─────────────────────────────────────────────────────

    pub fn insert_project(&self, project: &Project) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO projects
                 (id, name, repo_url, framework, production_branch, install_command,
                  build_command, output_directory, node_version, auto_deploy)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    project.id,
                    project.name,
                    project.repo_url,
                    project.framework.as_str(),
                    project.production_branch,
                    project.install_command,
                    project.build_command,
                    project.output_directory,
                    project.node_version,
                    project.auto_deploy as i64,
                ],
            )
            .context("Failed to insert project")?;
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, repo_url, framework, production_branch, install_command,
                        build_command, output_directory, node_version, auto_deploy, created_at
                 FROM projects WHERE id = ?1",
                params![id],
                row_to_project,
            )
            .optional()
            .context("Failed to query project")
    }

    // ── Deployments ──────────────────────────────────────────────────

    /// Insert a new deployment in `pending` state.
    pub fn create_deployment(
        &self,
        id: &str,
        project_id: &str,
        branch: &str,
        commit_sha: &str,
        commit_message: Option<&str>,
        is_preview: bool,
    ) -> Result<Deployment> {
        self.conn
            .execute(
                "INSERT INTO deployments (id, project_id, branch, commit_sha, commit_message, is_preview)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, project_id, branch, commit_sha, commit_message, is_preview as i64],
            )
            .context("Failed to insert deployment")?;
        self.get_deployment(id)?
            .ok_or_else(|| anyhow::anyhow!("deployment {} vanished after insert", id))
    }

    pub fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_DEPLOYMENT),
                params![id],
                row_to_deployment,
            )
            .optional()
            .context("Failed to query deployment")
    }

    /// Advance a deployment's status. Returns `false` (without writing) when
    /// the transition would move the state machine backward.
    pub fn advance_status(&self, id: &str, to: DeploymentStatus) -> Result<bool> {
        let current = self
            .get_deployment(id)?
            .ok_or_else(|| anyhow::anyhow!("deployment {} not found", id))?;
        if current.status == to && to != DeploymentStatus::Building {
            return Ok(true);
        }
        if !can_transition(current.status, to) {
            tracing::warn!(
                deployment_id = id,
                from = %current.status,
                to = %to,
                "refusing backward status transition"
            );
            return Ok(false);
        }
        self.conn
            .execute(
                "UPDATE deployments
                 SET status = ?2, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
                 WHERE id = ?1",
                params![id, to.as_str()],
            )
            .context("Failed to update deployment status")?;
        Ok(true)
    }

    /// Append a fragment to the deployment's accumulated build log.
    /// The log is monotonically appended, never truncated.
    pub fn append_build_log(&self, id: &str, fragment: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE deployments SET build_log = build_log || ?2 WHERE id = ?1",
                params![id, fragment],
            )
            .context("Failed to append build log")?;
        Ok(())
    }

    /// Record the running container and mark the deployment ready.
    pub fn set_live(
        &self,
        id: &str,
        container_id: &str,
        port: u16,
        url: &str,
    ) -> Result<bool> {
        if !self.advance_status(id, DeploymentStatus::Ready)? {
            return Ok(false);
        }
        self.conn
            .execute(
                "UPDATE deployments SET container_id = ?2, port = ?3, url = ?4 WHERE id = ?1",
                params![id, container_id, port as i64, url],
            )
            .context("Failed to record live container")?;
        Ok(true)
    }

    /// Clear container fields and move the deployment to a retired state.
    pub fn release_container(&self, id: &str, to: DeploymentStatus) -> Result<()> {
        self.advance_status(id, to)?;
        self.conn
            .execute(
                "UPDATE deployments SET container_id = NULL, port = NULL WHERE id = ?1",
                params![id],
            )
            .context("Failed to clear container fields")?;
        Ok(())
    }

    /// Other `ready` deployments of the project that still hold a container.
    pub fn list_ready_with_container(
        &self,
        project_id: &str,
        exclude_id: &str,
    ) -> Result<Vec<Deployment>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE project_id = ?1 AND status = 'ready'
                 AND container_id IS NOT NULL AND id != ?2",
            SELECT_DEPLOYMENT
        ))?;
        let rows = stmt
            .query_map(params![project_id, exclude_id], row_to_deployment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_project_deployments(&self, project_id: &str) -> Result<Vec<Deployment>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE project_id = ?1 ORDER BY created_at DESC",
            SELECT_DEPLOYMENT
        ))?;
        let rows = stmt
            .query_map(params![project_id], row_to_deployment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Retired deployments beyond the newest `keep`, whose images are
    /// eligible for pruning.
    pub fn list_retired_beyond(&self, project_id: &str, keep: usize) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM deployments
             WHERE project_id = ?1 AND status IN ('stopped', 'failed', 'cancelled')
             ORDER BY created_at DESC LIMIT -1 OFFSET ?2",
        )?;
        let rows = stmt
            .query_map(params![project_id, keep as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// All live deployments across projects (startup port re-reservation).
    pub fn list_all_live(&self) -> Result<Vec<Deployment>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE status = 'ready' AND container_id IS NOT NULL AND port IS NOT NULL",
            SELECT_DEPLOYMENT
        ))?;
        let rows = stmt
            .query_map([], row_to_deployment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Newest `ready` deployment recorded under the given public URL.
    pub fn find_ready_by_url(&self, url: &str) -> Result<Option<Deployment>> {
        self.conn
            .query_row(
                &format!(
                    "{} WHERE url = ?1 AND status = 'ready' ORDER BY created_at DESC LIMIT 1",
                    SELECT_DEPLOYMENT
                ),
                params![url],
                row_to_deployment,
            )
            .optional()
            .context("Failed to query deployment by url")
    }

    /// Host port of a deployment, if it is currently live.
    pub fn find_live_port(&self, deployment_id: &str) -> Result<Option<u16>> {
        let port: Option<i64> = self
            .conn
            .query_row(
                "SELECT port FROM deployments WHERE id = ?1 AND status = 'ready' AND port IS NOT NULL",
                params![deployment_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query live port")?;
        Ok(port.map(|p| p as u16))
    }

    // ── Environment variables ────────────────────────────────────────

    pub fn upsert_env_variable(
        &self,
        project_id: &str,
        key: &str,
        encrypted_value: &str,
        targets: &[EnvTarget],
    ) -> Result<()> {
        let targets_json = serde_json::to_string(
            &targets.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        )?;
        self.conn
            .execute(
                "INSERT INTO env_variables (project_id, key, value, targets)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(project_id, key) DO UPDATE SET value = ?3, targets = ?4",
                params![project_id, key, encrypted_value, targets_json],
            )
            .context("Failed to upsert env variable")?;
        Ok(())
    }

    /// Encrypted `(key, value)` pairs whose target set contains `target`.
    pub fn env_for_target(
        &self,
        project_id: &str,
        target: EnvTarget,
    ) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value, targets FROM env_variables WHERE project_id = ?1 ORDER BY key",
        )?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut selected = Vec::new();
        for (key, value, targets_json) in rows {
            let targets: Vec<String> = serde_json::from_str(&targets_json).unwrap_or_default();
            if targets.iter().any(|t| t == target.as_str()) {
                selected.push((key, value));
            }
        }
        Ok(selected)
    }
}

const SELECT_DEPLOYMENT: &str = "SELECT id, project_id, status, build_log, url, branch, commit_sha,
        commit_message, container_id, port, is_preview, created_at, updated_at
 FROM deployments";

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let framework: String = row.get(3)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        repo_url: row.get(2)?,
        framework: Framework::from_str(&framework).unwrap_or(Framework::Node),
        production_branch: row.get(4)?,
        install_command: row.get(5)?,
        build_command: row.get(6)?,
        output_directory: row.get(7)?,
        node_version: row.get(8)?,
        auto_deploy: row.get::<_, i64>(9)? != 0,
        created_at: row.get(10)?,
    })
}

fn row_to_deployment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Deployment> {
    let status: String = row.get(2)?;
    Ok(Deployment {
        id: row.get(0)?,
        project_id: row.get(1)?,
        status: DeploymentStatus::from_str(&status).unwrap_or(DeploymentStatus::Failed),
        build_log: row.get(3)?,
        url: row.get(4)?,
        branch: row.get(5)?,
        commit_sha: row.get(6)?,
        commit_message: row.get(7)?,
        container_id: row.get(8)?,
        port: row.get::<_, Option<i64>>(9)?.map(|p| p as u16),
        is_preview: row.get::<_, i64>(10)? != 0,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
