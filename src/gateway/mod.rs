//! Gateway process: control API, build workers, container manager and the
//! log broadcast hub behind one listener.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::build::{BuildWorker, WorkerContext};
use crate::config::GatewayConfig;
use crate::hub::{LocalSink, LogHub, LogSink, RelaySink};
use crate::queue::BuildQueue;
use crate::runtime::{ContainerManager, RuntimeConfig, ScanningAllocator};
use crate::secrets::{EnvCipher, SECRET_KEY_ENV};
use crate::store::{MetadataStore, StoreHandle};

pub use api::AppState;

/// Development fallback key. Real deployments must set `SLIPWAY_SECRET_KEY`.
const DEV_SECRET_KEY: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0";

/// Build the full application router: API plus both WebSocket surfaces.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws", get(ws::viewer_handler))
        .route("/ws/ingest", get(ws::ingest_handler))
        .with_state(state)
}

/// Start the gateway and run until shutdown.
pub async fn start(config: GatewayConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    std::fs::create_dir_all(&config.builds_dir).context("Failed to create builds directory")?;

    let store = StoreHandle::new(
        MetadataStore::open(&config.db_path).context("Failed to open metadata store")?,
    );

    let cipher = match EnvCipher::from_env() {
        Ok(cipher) => cipher,
        Err(e) => {
            warn!("{}; using built-in dev key (set {} in production)", e, SECRET_KEY_ENV);
            EnvCipher::from_hex_key(DEV_SECRET_KEY).expect("dev key is valid")
        }
    };

    let docker = ContainerManager::connect()?;
    let ports = Arc::new(ScanningAllocator::new(config.port_range, Some(docker.clone())));
    let hub = Arc::new(LogHub::new());

    let sink: Arc<dyn LogSink> = match &config.hub_url {
        Some(url) => {
            info!(url = %url, "publishing build logs via relay");
            Arc::new(RelaySink::spawn(url.clone()))
        }
        None => Arc::new(LocalSink::new(Arc::clone(&hub))),
    };

    let manager = ContainerManager::new(
        docker,
        store.clone(),
        ports,
        cipher.clone(),
        Arc::clone(&sink),
        RuntimeConfig {
            base_domain: config.base_domain.clone(),
            ..Default::default()
        },
    );
    manager.load_existing().await;

    let queue = Arc::new(BuildQueue::new());

    let worker_ctx = WorkerContext {
        store: store.clone(),
        queue: Arc::clone(&queue),
        sink,
        manager: Arc::clone(&manager),
        cipher: cipher.clone(),
        builds_dir: config.builds_dir.clone(),
        install_timeout: config.install_timeout,
        build_timeout: config.build_timeout,
        image_timeout: config.image_timeout,
    };
    for id in 0..config.workers.max(1) {
        tokio::spawn(BuildWorker::new(worker_ctx.clone(), id).run());
    }

    let state = Arc::new(AppState {
        store,
        queue,
        hub,
        manager,
        cipher,
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, workers = config.workers, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// State over an in-memory store. The Docker handle is lazy: nothing
    /// touches the socket unless a container operation runs.
    fn test_state() -> Arc<AppState> {
        let store = StoreHandle::new(MetadataStore::open_in_memory().unwrap());
        let cipher = EnvCipher::from_hex_key(DEV_SECRET_KEY).unwrap();
        let docker = bollard::Docker::connect_with_local_defaults().unwrap();
        let ports = Arc::new(ScanningAllocator::new((4000, 4010), None));
        let hub = Arc::new(LogHub::new());
        let sink: Arc<dyn LogSink> = Arc::new(LocalSink::new(Arc::clone(&hub)));
        let manager = ContainerManager::new(
            docker,
            store.clone(),
            ports,
            cipher.clone(),
            sink,
            RuntimeConfig::default(),
        );
        Arc::new(AppState {
            store,
            queue: Arc::new(BuildQueue::new()),
            hub,
            manager,
            cipher,
        })
    }

    fn test_router() -> Router {
        build_router(test_state())
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = test_router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_enqueue_build_unknown_project_is_404() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/builds")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"project_id": "nope", "branch": "main"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_project_then_enqueue_and_poll_job() {
        let app = test_router();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/projects")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "name": "demo site",
                            "repo_url": "https://example.com/demo.git",
                            "framework": "next",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let project = json_body(response).await;
        let project_id = project["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/builds")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"project_id": project_id, "branch": "feature/x"})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted = json_body(response).await;
        let job_id = accepted["job_id"].as_str().unwrap().to_string();
        let deployment_id = accepted["deployment_id"].as_str().unwrap().to_string();

        // Job is queued; no worker is running in this test.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/jobs/{}", job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job = json_body(response).await;
        assert_eq!(job["state"], "queued");
        assert_eq!(job["progress"], 0);

        // Deployment record exists in pending with an empty log.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/deployments/{}", deployment_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let deployment = json_body(response).await;
        assert_eq!(deployment["status"], "pending");
        assert_eq!(deployment["is_preview"], true);
    }

    #[tokio::test]
    async fn test_cancel_queued_job_cancels_deployment() {
        let app = test_router();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/projects")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"name": "x", "repo_url": "https://example.com/x.git"})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let project_id = json_body(response).await["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/builds")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"project_id": project_id, "branch": "main"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let accepted = json_body(response).await;
        let job_id = accepted["job_id"].as_str().unwrap().to_string();
        let deployment_id = accepted["deployment_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/jobs/{}", job_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/deployments/{}", deployment_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let deployment = json_body(response).await;
        assert_eq!(deployment["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_env_upsert_requires_project() {
        let app = test_router();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/projects/nope/env")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"key": "K", "value": "v"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_env_values_stored_encrypted() {
        let state = test_state();
        let app = build_router(Arc::clone(&state));
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/projects")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"name": "x", "repo_url": "https://example.com/x.git"})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let project = json_body(response).await;
        let project_id = project["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/projects/{}/env", project_id))
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "key": "API_KEY",
                            "value": "super-secret",
                            "targets": ["production"],
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // At rest the value is ciphertext; decryption recovers it.
        let stored = state
            .store
            .call({
                let project_id = project_id.clone();
                move |store| store.env_for_target(&project_id, crate::store::EnvTarget::Production)
            })
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_ne!(stored[0].1, "super-secret");
        assert_eq!(state.cipher.decrypt(&stored[0].1).unwrap(), "super-secret");
    }
}
