//! Container lifecycle: start a built image, retire superseded containers,
//! reclaim old images, and tear down deployment/project resources.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{ListImagesOptions, RemoveImageOptions};
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use tracing::{info, warn};

use crate::build::dockerfile::image_tag;
use crate::errors::StartError;
use crate::hub::LogSink;
use crate::secrets::EnvCipher;
use crate::store::{Deployment, DeploymentStatus, Project, StoreHandle, slugify};

use super::ports::PortAllocator;

/// Settings for the lifecycle manager.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub base_domain: String,
    /// Grace period before a retired container is force-removed.
    pub stop_grace_secs: i64,
    /// Retired images kept per project before pruning.
    pub image_retention: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_domain: "slipway.local".to_string(),
            stop_grace_secs: 10,
            image_retention: 3,
        }
    }
}

/// Manages running deployment containers. At most one deployment per
/// project holds a live container: the previous `ready` containers are
/// retired before a new one starts.
pub struct ContainerManager {
    docker: Docker,
    store: StoreHandle,
    ports: Arc<dyn PortAllocator>,
    cipher: EnvCipher,
    sink: Arc<dyn LogSink>,
    config: RuntimeConfig,
}

/// Public URL a deployment is served under.
pub fn public_url(project: &Project, deployment: &Deployment, base_domain: &str) -> String {
    if deployment.is_preview {
        format!("https://{}.preview.{}", deployment.id, base_domain)
    } else {
        format!("https://{}.{}", slugify(&project.name, 40), base_domain)
    }
}

fn container_name(deployment_id: &str) -> String {
    format!("slipway-{}", deployment_id)
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { status_code: 404, .. }
    )
}

impl ContainerManager {
    pub fn new(
        docker: Docker,
        store: StoreHandle,
        ports: Arc<dyn PortAllocator>,
        cipher: EnvCipher,
        sink: Arc<dyn LogSink>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            docker,
            store,
            ports,
            cipher,
            sink,
            config,
        })
    }

    /// Connect to the local container runtime.
    pub fn connect() -> anyhow::Result<Docker> {
        Docker::connect_with_local_defaults()
            .map_err(|e| anyhow::anyhow!("failed to connect to container runtime: {}", e))
    }

    /// Re-reserve ports of deployments that were live before a restart.
    pub async fn load_existing(&self) {
        let live = match self.store.call(|store| store.list_all_live()).await {
            Ok(live) => live,
            Err(e) => {
                warn!("could not load live deployments at startup: {:#}", e);
                return;
            }
        };
        for deployment in &live {
            if let Some(port) = deployment.port {
                self.ports.reserve(port).await;
            }
        }
        info!(count = live.len(), "re-reserved ports for live deployments");
    }

    /// Verify an image is queryable in the runtime. Build-stream completion
    /// alone is not trusted.
    pub async fn image_exists(&self, image: &str) -> Result<bool, StartError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(StartError::Runtime(e.to_string())),
        }
    }

    /// Start a container for a verified image, retire the project's prior
    /// live deployments, and record the result. Returns the public URL.
    pub async fn start_container(
        self: &Arc<Self>,
        deployment_id: &str,
        image: &str,
    ) -> Result<String, StartError> {
        let (deployment, project) = self.load_records(deployment_id).await?;

        // Retiring before starting converges a PR-close teardown racing a
        // re-push for the same branch.
        self.retire_previous(&project.id, deployment_id).await;

        if !self.image_exists(image).await? {
            return Err(StartError::ImageMissing { image: image.to_string() });
        }

        let port = self.ports.allocate().await?;
        let internal_port = project.framework.container_port();
        let env = self
            .resolved_env(&deployment)
            .await
            .map_err(|e| StartError::Runtime(format!("env resolution failed: {:#}", e)))?;

        let container_id = match self.create_and_start(deployment_id, image, port, internal_port, env).await {
            Ok(id) => id,
            Err(e) => {
                // A failed start must not leave a half-created container or
                // a claimed port behind.
                self.remove_container_quietly(&container_name(deployment_id)).await;
                self.ports.release(port).await;
                return Err(e);
            }
        };

        let url = public_url(&project, &deployment, &self.config.base_domain);
        {
            let id = deployment_id.to_string();
            let container_id = container_id.clone();
            let url = url.clone();
            self.store
                .call(move |store| store.set_live(&id, &container_id, port, &url))
                .await
                .map_err(|e| StartError::Runtime(format!("failed to record container: {:#}", e)))?;
        }

        info!(
            deployment_id,
            container_id = %container_id,
            port,
            url = %url,
            "container started"
        );

        // Image pruning is best-effort housekeeping off the critical path.
        let manager = Arc::clone(self);
        let project_id = project.id.clone();
        tokio::spawn(async move {
            manager.cleanup_old_images(&project_id).await;
        });

        Ok(url)
    }

    /// Stop and remove a deployment's container, releasing its port.
    /// Absence of the container is success, not error.
    pub async fn stop_deployment(&self, deployment_id: &str) -> anyhow::Result<()> {
        let deployment = self
            .store
            .call({
                let id = deployment_id.to_string();
                move |store| store.get_deployment(&id)
            })
            .await?
            .ok_or_else(|| anyhow::anyhow!("deployment {} not found", deployment_id))?;

        if let Some(container_id) = &deployment.container_id {
            self.stop_and_remove(container_id).await;
        }
        if let Some(port) = deployment.port {
            self.ports.release(port).await;
        }
        {
            let id = deployment_id.to_string();
            self.store
                .call(move |store| store.release_container(&id, DeploymentStatus::Stopped))
                .await?;
        }
        self.sink.publish_status(deployment_id, DeploymentStatus::Stopped);
        info!(deployment_id, "deployment stopped");
        Ok(())
    }

    /// Idempotent teardown for deployment deletion: container and image
    /// both removed; not-found is the desired end state.
    pub async fn cleanup_deployment(&self, deployment_id: &str) -> anyhow::Result<()> {
        let deployment = self
            .store
            .call({
                let id = deployment_id.to_string();
                move |store| store.get_deployment(&id)
            })
            .await?;

        if let Some(deployment) = deployment {
            if let Some(container_id) = &deployment.container_id {
                self.stop_and_remove(container_id).await;
            }
            if let Some(port) = deployment.port {
                self.ports.release(port).await;
            }
            if deployment.status == DeploymentStatus::Ready {
                let id = deployment_id.to_string();
                let _ = self
                    .store
                    .call(move |store| store.release_container(&id, DeploymentStatus::Stopped))
                    .await;
            }
        }

        let image = image_tag(deployment_id);
        if let Err(e) = self
            .docker
            .remove_image(&image, Some(RemoveImageOptions { force: true, ..Default::default() }), None)
            .await
            && !is_not_found(&e)
        {
            warn!(deployment_id, "image removal failed: {}", e);
        }
        Ok(())
    }

    /// Idempotent teardown of every deployment resource of a project.
    pub async fn cleanup_project(&self, project_id: &str) -> anyhow::Result<()> {
        let deployments = self
            .store
            .call({
                let id = project_id.to_string();
                move |store| store.list_project_deployments(&id)
            })
            .await?;
        for deployment in deployments {
            if let Err(e) = self.cleanup_deployment(&deployment.id).await {
                warn!(deployment_id = %deployment.id, "cleanup failed: {:#}", e);
            }
        }
        info!(project_id, "project resources cleaned up");
        Ok(())
    }

    /// Keep only the newest retired images per project and prune dangling
    /// images runtime-wide. Failures are logged, never surfaced.
    pub async fn cleanup_old_images(&self, project_id: &str) {
        let retention = self.config.image_retention;
        let prunable = match self
            .store
            .call({
                let id = project_id.to_string();
                move |store| store.list_retired_beyond(&id, retention)
            })
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                warn!(project_id, "image retention query failed: {:#}", e);
                return;
            }
        };

        for deployment_id in prunable {
            let image = image_tag(&deployment_id);
            match self
                .docker
                .remove_image(&image, Some(RemoveImageOptions { force: true, ..Default::default() }), None)
                .await
            {
                Ok(_) => info!(image = %image, "pruned retired image"),
                Err(e) if is_not_found(&e) => {}
                Err(e) => warn!(image = %image, "image prune failed: {}", e),
            }
        }

        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["true".to_string()]);
        match self
            .docker
            .list_images(Some(ListImagesOptions::<String> { filters, ..Default::default() }))
            .await
        {
            Ok(images) => {
                for image in images {
                    if let Err(e) = self
                        .docker
                        .remove_image(&image.id, Some(RemoveImageOptions { force: true, ..Default::default() }), None)
                        .await
                        && !is_not_found(&e)
                    {
                        warn!(image = %image.id, "dangling image prune failed: {}", e);
                    }
                }
            }
            Err(e) => warn!("dangling image listing failed: {}", e),
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn load_records(
        &self,
        deployment_id: &str,
    ) -> Result<(Deployment, Project), StartError> {
        let id = deployment_id.to_string();
        let records = self
            .store
            .call(move |store| {
                let deployment = store.get_deployment(&id)?;
                let project = match &deployment {
                    Some(d) => store.get_project(&d.project_id)?,
                    None => None,
                };
                Ok(deployment.zip(project))
            })
            .await
            .map_err(|e| StartError::Runtime(e.to_string()))?;
        records.ok_or_else(|| StartError::DeploymentNotFound {
            id: deployment_id.to_string(),
        })
    }

    /// Stop and remove every other `ready` container of the project.
    /// The baseline rule treats the project as one slot; preview branches
    /// share it (see DESIGN.md).
    async fn retire_previous(&self, project_id: &str, current_deployment_id: &str) {
        let others = match self
            .store
            .call({
                let project_id = project_id.to_string();
                let current = current_deployment_id.to_string();
                move |store| store.list_ready_with_container(&project_id, &current)
            })
            .await
        {
            Ok(others) => others,
            Err(e) => {
                warn!(project_id, "could not list prior deployments: {:#}", e);
                return;
            }
        };

        for prior in others {
            info!(deployment_id = %prior.id, "retiring superseded deployment");
            if let Some(container_id) = &prior.container_id {
                self.stop_and_remove(container_id).await;
            }
            if let Some(port) = prior.port {
                self.ports.release(port).await;
            }
            let prior_id = prior.id.clone();
            if let Err(e) = self
                .store
                .call(move |store| store.release_container(&prior_id, DeploymentStatus::Stopped))
                .await
            {
                warn!(deployment_id = %prior.id, "could not mark deployment stopped: {:#}", e);
            }
            self.sink.publish_status(&prior.id, DeploymentStatus::Stopped);
        }
    }

    async fn create_and_start(
        &self,
        deployment_id: &str,
        image: &str,
        host_port: u16,
        internal_port: u16,
        env: Vec<String>,
    ) -> Result<String, StartError> {
        let exposed = format!("{}/tcp", internal_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            exposed.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(exposed, HashMap::new());

        let config = Config {
            image: Some(image.to_string()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name(deployment_id),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| StartError::Runtime(format!("create container: {}", e)))?;

        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| StartError::Runtime(format!("start container: {}", e)))?;

        Ok(created.id)
    }

    /// Decrypted environment for the deployment's target class plus the
    /// platform defaults.
    async fn resolved_env(&self, deployment: &Deployment) -> anyhow::Result<Vec<String>> {
        let target = deployment.env_target();
        let project_id = deployment.project_id.clone();
        let pairs = self
            .store
            .call(move |store| store.env_for_target(&project_id, target))
            .await?;

        let mut env = vec!["NODE_ENV=production".to_string()];
        for (key, encrypted) in pairs {
            match self.cipher.decrypt(&encrypted) {
                Ok(value) => env.push(format!("{}={}", key, value)),
                Err(e) => warn!(key = %key, "env variable could not be decrypted, skipping: {}", e),
            }
        }
        Ok(env)
    }

    async fn stop_and_remove(&self, container_id: &str) {
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: self.config.stop_grace_secs,
                }),
            )
            .await
        {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => return,
            Err(e) => warn!(container_id, "container stop failed: {}", e),
        }
        self.remove_container_quietly(container_id).await;
    }

    async fn remove_container_quietly(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await
            && !is_not_found(&e)
        {
            warn!(container_id, "container removal failed: {}", e);
        }
    }
}
