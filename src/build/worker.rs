//! Build worker: pulls one job at a time from the queue and drives it
//! through clone, install, build, containerize and start.
//!
//! Stages are strictly sequential. Any hard failure short-circuits the
//! rest, writes a single terminal `failed` status with the captured output
//! and always attempts working-directory cleanup. Clone failures are the
//! exception: they degrade to the placeholder scaffold and continue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::errors::BuildError;
use crate::hub::LogSink;
use crate::queue::{BuildJob, BuildQueue};
use crate::runtime::ContainerManager;
use crate::secrets::EnvCipher;
use crate::store::{DeploymentStatus, Framework, StoreHandle};

use super::clone::{self, SourceKind};
use super::commands::run_logged;
use super::detect::PackageManager;
use super::dockerfile::{self, DOCKERFILE_NAME, image_tag};
use super::hints::failure_message;
use super::next_config;
use super::{BuildStage, Emitter};

/// Everything a worker needs besides the job itself.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: StoreHandle,
    pub queue: Arc<BuildQueue>,
    pub sink: Arc<dyn LogSink>,
    pub manager: Arc<ContainerManager>,
    pub cipher: EnvCipher,
    pub builds_dir: PathBuf,
    pub install_timeout: Duration,
    pub build_timeout: Duration,
    pub image_timeout: Duration,
}

/// One worker task. Multiple instances may share a queue; each job is
/// delivered to exactly one of them and processed to completion there.
pub struct BuildWorker {
    ctx: WorkerContext,
    id: usize,
}

impl BuildWorker {
    pub fn new(ctx: WorkerContext, id: usize) -> Self {
        Self { ctx, id }
    }

    /// Pull and process jobs forever. Spawned as a background tokio task.
    pub async fn run(self) {
        info!(worker = self.id, "build worker started");
        loop {
            let (job_id, job) = self.ctx.queue.dequeue().await;
            info!(
                worker = self.id,
                job_id = %job_id,
                deployment_id = %job.deployment_id,
                branch = %job.branch,
                "processing build job"
            );
            self.process(&job_id, &job).await;
        }
    }

    /// Process one job to a terminal state. Never returns an error: the
    /// outcome is reported through the store, the hub and the queue.
    pub async fn process(&self, job_id: &str, job: &BuildJob) {
        let emitter = Emitter::new(
            self.ctx.store.clone(),
            self.ctx.sink.clone(),
            &job.deployment_id,
            job.git_token.clone(),
        );
        let workdir = self.ctx.builds_dir.join(&job.deployment_id);

        let result = self.execute(job_id, job, &workdir, &emitter).await;

        // Best-effort cleanup on every path; a cleanup failure must not
        // change the reported outcome.
        if workdir.exists()
            && let Err(e) = tokio::fs::remove_dir_all(&workdir).await
        {
            warn!(deployment_id = %job.deployment_id, "workdir cleanup failed: {}", e);
        }

        match result {
            Ok(url) => {
                emitter
                    .terminal(
                        DeploymentStatus::Ready,
                        &format!("deployment ready at {}", url),
                    )
                    .await;
                self.ctx.queue.set_progress(job_id, 100);
                self.ctx.queue.mark_completed(job_id);
                info!(deployment_id = %job.deployment_id, url = %url, "deployment ready");
            }
            Err(e) => {
                let message = emitter.scrub(&e.to_string());
                emitter.terminal(DeploymentStatus::Failed, &message).await;
                self.ctx.queue.mark_failed(job_id, &message);
                error!(deployment_id = %job.deployment_id, "build failed: {}", message);
            }
        }
    }

    async fn execute(
        &self,
        job_id: &str,
        job: &BuildJob,
        workdir: &Path,
        emitter: &Emitter,
    ) -> Result<String, BuildError> {
        let ctx = &self.ctx;

        // Stage 1: clone (masked failure -> scaffold)
        ctx.queue.set_progress(job_id, BuildStage::Cloning.progress());
        emitter.stage(BuildStage::Cloning).await;
        prepare_workdir(workdir)
            .await
            .context("could not prepare working directory")?;
        let source = clone::fetch_source(job, workdir, emitter).await?;
        let framework = match source {
            SourceKind::Repository => job.framework,
            // The scaffold is a plain node app regardless of what the
            // project would have been.
            SourceKind::Scaffold => Framework::Node,
        };

        // Stage 2: install dependencies
        ctx.queue.set_progress(job_id, BuildStage::Installing.progress());
        emitter.stage(BuildStage::Installing).await;
        let package_manager = PackageManager::detect(workdir);
        let install_command = job
            .install_command
            .clone()
            .unwrap_or_else(|| package_manager.install_command().to_string());
        emitter
            .log(&format!("using {}: {}\n", package_manager, install_command))
            .await;
        let out = run_logged(&install_command, workdir, &[], ctx.install_timeout, emitter)
            .await
            .context("install command could not be run")?;
        if !out.success() {
            return Err(BuildError::Install {
                message: format!(
                    "{} exited with code {}\n{}",
                    install_command, out.exit_code, out.tail
                ),
            });
        }

        // Stage 3: build
        ctx.queue.set_progress(job_id, BuildStage::Building.progress());
        emitter.stage(BuildStage::Building).await;
        if framework == Framework::Next {
            let note = next_config::ensure_standalone_output(workdir)
                .await
                .context("could not prepare next.js config")?;
            emitter.log(&format!("{}\n", note)).await;
        }
        let build_command = job
            .build_command
            .clone()
            .unwrap_or_else(|| framework.default_build_command().to_string());
        let env = self.build_env(job).await.context("could not resolve build env")?;
        emitter.log(&format!("running: {}\n", build_command)).await;
        let out = run_logged(&build_command, workdir, &env, ctx.build_timeout, emitter)
            .await
            .context("build command could not be run")?;
        if !out.success() {
            let summary = format!("{} exited with code {}", build_command, out.exit_code);
            return Err(BuildError::Build {
                message: format!("{}\n{}", failure_message(&summary, &out.tail), out.tail),
            });
        }

        // Stage 4: containerize
        ctx.queue.set_progress(job_id, BuildStage::Imaging.progress());
        emitter.stage(BuildStage::Imaging).await;
        let output_dir = job
            .output_directory
            .clone()
            .unwrap_or_else(|| framework.default_output_dir().to_string());
        let dockerfile = dockerfile::generate(framework, job.node_version.as_deref(), &output_dir);
        tokio::fs::write(workdir.join(DOCKERFILE_NAME), &dockerfile)
            .await
            .context("could not write generated Dockerfile")?;
        let image = image_tag(&job.deployment_id);
        let build_image = format!("docker build -f {} -t '{}' .", DOCKERFILE_NAME, image);
        let out = run_logged(&build_image, workdir, &[], ctx.image_timeout, emitter)
            .await
            .context("docker build could not be run")?;
        if !out.success() {
            return Err(BuildError::Containerize {
                message: format!("docker build exited with code {}\n{}", out.exit_code, out.tail),
            });
        }
        // The build stream finishing is not proof the image exists.
        match ctx.manager.image_exists(&image).await {
            Ok(true) => emitter.log(&format!("image {} verified\n", image)).await,
            Ok(false) => {
                return Err(BuildError::Containerize {
                    message: format!("image {} not queryable after build", image),
                });
            }
            Err(e) => return Err(BuildError::Start(e)),
        }

        // Stage 5: start
        ctx.queue.set_progress(job_id, BuildStage::Starting.progress());
        emitter.stage(BuildStage::Starting).await;
        let url = ctx
            .manager
            .start_container(&job.deployment_id, &image)
            .await?;
        Ok(url)
    }

    /// Build-time environment: decrypted variables for the deployment's
    /// target class plus the platform flags.
    async fn build_env(&self, job: &BuildJob) -> Result<Vec<(String, String)>> {
        let deployment = self
            .ctx
            .store
            .call({
                let id = job.deployment_id.clone();
                move |store| store.get_deployment(&id)
            })
            .await?
            .ok_or_else(|| anyhow::anyhow!("deployment {} not found", job.deployment_id))?;

        let target = deployment.env_target();
        let project_id = job.project_id.clone();
        let pairs = self
            .ctx
            .store
            .call(move |store| store.env_for_target(&project_id, target))
            .await?;

        let mut env = vec![
            ("CI".to_string(), "true".to_string()),
            ("NODE_ENV".to_string(), "production".to_string()),
            ("NEXT_TELEMETRY_DISABLED".to_string(), "1".to_string()),
        ];
        for (key, encrypted) in pairs {
            match self.ctx.cipher.decrypt(&encrypted) {
                Ok(value) => env.push((key, value)),
                Err(e) => warn!(key = %key, "env variable could not be decrypted, skipping: {}", e),
            }
        }
        Ok(env)
    }
}

/// Create a fresh per-deployment working directory.
async fn prepare_workdir(dir: &Path) -> Result<()> {
    if dir.exists() {
        tokio::fs::remove_dir_all(dir)
            .await
            .with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(())
}
