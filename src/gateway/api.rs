//! Control API exposed to the (external) web/dashboard layer.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::QueueError;
use crate::hub::LogHub;
use crate::queue::{BuildJob, BuildQueue, JobPriority};
use crate::runtime::ContainerManager;
use crate::secrets::EnvCipher;
use crate::store::{DeploymentStatus, EnvTarget, Framework, Project, StoreHandle};

// ── Shared application state ─────────────────────────────────────────

pub struct AppState {
    pub store: StoreHandle,
    pub queue: Arc<BuildQueue>,
    pub hub: Arc<LogHub>,
    pub manager: Arc<ContainerManager>,
    pub cipher: EnvCipher,
}

pub type SharedState = Arc<AppState>;

// ── Request/response payloads ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EnqueueBuildRequest {
    pub project_id: String,
    pub branch: String,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub git_token: Option<String>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub output_directory: Option<String>,
    #[serde(default)]
    pub node_version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueBuildResponse {
    pub job_id: String,
    pub deployment_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub repo_url: String,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub production_branch: Option<String>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub output_directory: Option<String>,
    #[serde(default)]
    pub node_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertEnvRequest {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub targets: Option<Vec<String>>,
}

// ── Error handling ───────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", e))
    }
}

// ── Router ───────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/builds", post(enqueue_build))
        .route("/api/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/api/deployments/{id}", get(get_deployment))
        .route("/api/deployments/{id}/stop", post(stop_deployment))
        .route("/api/projects", post(create_project))
        .route("/api/projects/{id}/env", post(upsert_env))
        .route("/api/projects/{id}/cleanup", post(cleanup_project))
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Create the deployment record in `pending` and enqueue its build job.
/// Production-branch jobs outrank preview jobs.
async fn enqueue_build(
    State(state): State<SharedState>,
    Json(req): Json<EnqueueBuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .store
        .call({
            let id = req.project_id.clone();
            move |store| store.get_project(&id)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("project {} not found", req.project_id)))?;

    let is_preview = req.branch != project.production_branch;
    let deployment_id = Uuid::new_v4().to_string();
    let commit = req.commit.clone().unwrap_or_else(|| "latest".to_string());

    state
        .store
        .call({
            let deployment_id = deployment_id.clone();
            let project_id = project.id.clone();
            let branch = req.branch.clone();
            let commit = commit.clone();
            let commit_message = req.commit_message.clone();
            move |store| {
                store.create_deployment(
                    &deployment_id,
                    &project_id,
                    &branch,
                    &commit,
                    commit_message.as_deref(),
                    is_preview,
                )
            }
        })
        .await?;

    let job = BuildJob {
        deployment_id: deployment_id.clone(),
        project_id: project.id.clone(),
        user_id: req.user_id,
        repo_url: project.repo_url.clone(),
        branch: req.branch,
        commit,
        framework: project.framework,
        install_command: req.install_command.or(project.install_command),
        build_command: req.build_command.or(project.build_command),
        output_directory: req.output_directory.or(project.output_directory),
        node_version: req.node_version.or(project.node_version),
        git_token: req.git_token,
    };
    let priority = if is_preview { JobPriority::Preview } else { JobPriority::Production };
    let job_id = state.queue.enqueue(job, priority);

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueBuildResponse { job_id, deployment_id }),
    ))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .queue
        .status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {} not found", id)))
}

/// Cancel a queued job. Jobs already taken by a worker are not preemptible.
async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.queue.cancel(&id) {
        Ok(deployment_id) => {
            state
                .store
                .call({
                    let id = deployment_id.clone();
                    move |store| store.advance_status(&id, DeploymentStatus::Cancelled)
                })
                .await?;
            state
                .hub
                .publish(crate::hub::LogFrame::status(&deployment_id, DeploymentStatus::Cancelled));
            Ok(Json(serde_json::json!({"cancelled": true, "deployment_id": deployment_id})))
        }
        Err(QueueError::NotFound { id }) => Err(ApiError::NotFound(format!("job {} not found", id))),
        Err(e @ QueueError::AlreadyStarted { .. }) => Err(ApiError::Conflict(e.to_string())),
    }
}

/// Durable view of a deployment: status plus the accumulated log, so a
/// page reload shows the same state as the live stream.
async fn get_deployment(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .call({
            let id = id.clone();
            move |store| store.get_deployment(&id)
        })
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("deployment {} not found", id)))
}

async fn stop_deployment(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .manager
        .stop_deployment(&id)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    Ok(Json(serde_json::json!({"stopped": true})))
}

async fn cleanup_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .manager
        .cleanup_project(&id)
        .await
        .map_err(|e| ApiError::Internal(format!("{:#}", e)))?;
    Ok(Json(serde_json::json!({"cleaned": true})))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let framework = match req.framework.as_deref() {
        Some(tag) => Framework::from_str(tag).map_err(ApiError::BadRequest)?,
        None => Framework::Node,
    };
    let project = Project {
        id: Uuid::new_v4().to_string(),
        name: req.name,
        repo_url: req.repo_url,
        framework,
        production_branch: req.production_branch.unwrap_or_else(|| "main".to_string()),
        install_command: req.install_command,
        build_command: req.build_command,
        output_directory: req.output_directory,
        node_version: req.node_version,
        auto_deploy: true,
        created_at: String::new(),
    };
    state
        .store
        .call({
            let project = project.clone();
            move |store| store.insert_project(&project)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// Store an environment variable, encrypting the value at rest.
async fn upsert_env(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Json(req): Json<UpsertEnvRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let targets = match req.targets {
        Some(raw) => {
            let mut targets = Vec::new();
            for tag in raw {
                targets.push(EnvTarget::from_str(&tag).map_err(ApiError::BadRequest)?);
            }
            targets
        }
        None => vec![EnvTarget::Production, EnvTarget::Preview],
    };

    let exists = state
        .store
        .call({
            let id = project_id.clone();
            move |store| store.get_project(&id)
        })
        .await?
        .is_some();
    if !exists {
        return Err(ApiError::NotFound(format!("project {} not found", project_id)));
    }

    let encrypted = state
        .cipher
        .encrypt(&req.value)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let value = targets.clone();
    state
        .store
        .call({
            let key = req.key.clone();
            move |store| store.upsert_env_variable(&project_id, &key, &encrypted, &value)
        })
        .await?;
    Ok(Json(serde_json::json!({"key": req.key, "targets": targets})))
}
