//! The five-stage build pipeline: clone, install, build, containerize, start.

pub mod clone;
pub mod commands;
pub mod detect;
pub mod dockerfile;
pub mod hints;
pub mod next_config;
pub mod scaffold;
pub mod worker;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::hub::LogSink;
use crate::store::{DeploymentStatus, StoreHandle};

pub use worker::{BuildWorker, WorkerContext};

/// Pipeline sub-stage, reported in log frames and as queue progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    Cloning,
    Installing,
    Building,
    Imaging,
    Starting,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloning => "cloning",
            Self::Installing => "installing",
            Self::Building => "building",
            Self::Imaging => "imaging",
            Self::Starting => "starting",
        }
    }

    /// Rough completion percentage when this stage begins.
    pub fn progress(&self) -> u8 {
        match self {
            Self::Cloning => 10,
            Self::Installing => 30,
            Self::Building => 50,
            Self::Imaging => 70,
            Self::Starting => 90,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Cloning => "cloning repository",
            Self::Installing => "installing dependencies",
            Self::Building => "building project",
            Self::Imaging => "creating container image",
            Self::Starting => "starting container",
        }
    }
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emits build output for one deployment to both the durable store
/// (append-only `build_log`, status field) and the log hub, so a live
/// viewer and a page reload see identical state. Scrubs the clone
/// credential from every line before it leaves the worker.
pub struct Emitter {
    store: StoreHandle,
    sink: Arc<dyn LogSink>,
    deployment_id: String,
    secret: Option<String>,
}

impl Emitter {
    pub fn new(
        store: StoreHandle,
        sink: Arc<dyn LogSink>,
        deployment_id: &str,
        secret: Option<String>,
    ) -> Self {
        Self {
            store,
            sink,
            deployment_id: deployment_id.to_string(),
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Replace the clone credential with `***` wherever it appears.
    pub fn scrub(&self, text: &str) -> String {
        match &self.secret {
            Some(secret) => text.replace(secret.as_str(), "***"),
            None => text.to_string(),
        }
    }

    /// Emit a log fragment (scrubbed) to store and hub.
    pub async fn log(&self, fragment: &str) {
        let fragment = self.scrub(fragment);
        self.append_store(&fragment, None).await;
        self.sink.publish_log(&self.deployment_id, &fragment, None);
    }

    /// Announce a stage start: status stays `building`, message goes to both
    /// the log and the status field consumers.
    pub async fn stage(&self, stage: BuildStage) {
        let line = format!("--> {}\n", stage.description());
        self.append_store(&line, Some(DeploymentStatus::Building)).await;
        self.sink
            .publish_log(&self.deployment_id, &line, Some(DeploymentStatus::Building));
    }

    /// Write a terminal status with its closing message.
    pub async fn terminal(&self, status: DeploymentStatus, message: &str) {
        let line = format!("{}\n", self.scrub(message));
        self.append_store(&line, Some(status)).await;
        self.sink.publish_log(&self.deployment_id, &line, Some(status));
    }

    async fn append_store(&self, fragment: &str, status: Option<DeploymentStatus>) {
        let id = self.deployment_id.clone();
        let fragment = fragment.to_string();
        let result = self
            .store
            .call(move |store| {
                if let Some(status) = status {
                    store.advance_status(&id, status)?;
                }
                store.append_build_log(&id, &fragment)
            })
            .await;
        if let Err(e) = result {
            warn!(deployment_id = %self.deployment_id, "failed to persist build log: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{LocalSink, LogHub};
    use crate::store::{MetadataStore, Project};

    fn seeded_handle() -> StoreHandle {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .insert_project(&Project {
                id: "p1".into(),
                name: "site".into(),
                repo_url: "https://github.com/acme/site.git".into(),
                framework: crate::store::Framework::Next,
                production_branch: "main".into(),
                install_command: None,
                build_command: None,
                output_directory: None,
                node_version: None,
                auto_deploy: true,
                created_at: String::new(),
            })
            .unwrap();
        store
            .create_deployment("d1", "p1", "main", "latest", None, false)
            .unwrap();
        StoreHandle::new(store)
    }

    #[test]
    fn test_stage_progress_is_monotonic() {
        let stages = [
            BuildStage::Cloning,
            BuildStage::Installing,
            BuildStage::Building,
            BuildStage::Imaging,
            BuildStage::Starting,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].progress() < pair[1].progress());
        }
    }

    #[tokio::test]
    async fn test_emitter_scrubs_credential_everywhere() {
        let handle = seeded_handle();
        let hub = Arc::new(LogHub::new());
        let sink = Arc::new(LocalSink::new(Arc::clone(&hub)));
        let emitter = Emitter::new(handle.clone(), sink, "d1", Some("ghp_secret123".into()));

        emitter
            .log("cloning https://ghp_secret123@github.com/acme/site.git\n")
            .await;

        let deployment = handle
            .call(|s| s.get_deployment("d1"))
            .await
            .unwrap()
            .unwrap();
        assert!(!deployment.build_log.contains("ghp_secret123"));
        assert!(deployment.build_log.contains("https://***@github.com"));

        let (snapshot, _) = hub.subscribe("d1");
        assert!(!snapshot.log.contains("ghp_secret123"));
    }

    #[tokio::test]
    async fn test_emitter_mirrors_store_and_hub() {
        let handle = seeded_handle();
        let hub = Arc::new(LogHub::new());
        let sink = Arc::new(LocalSink::new(Arc::clone(&hub)));
        let emitter = Emitter::new(handle.clone(), sink, "d1", None);

        emitter.stage(BuildStage::Cloning).await;
        emitter.log("Cloning into '.'...\n").await;
        emitter.terminal(DeploymentStatus::Failed, "build failed: boom").await;

        let deployment = handle
            .call(|s| s.get_deployment("d1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Failed);

        let (snapshot, _) = hub.subscribe("d1");
        assert_eq!(snapshot.log, deployment.build_log);
        assert_eq!(snapshot.status, Some(DeploymentStatus::Failed));
    }
}
