//! Cross-module pipeline tests: queue -> worker -> store/hub, exercised up
//! to the container-runtime boundary (no Docker daemon required).

use std::sync::Arc;
use std::time::Duration;

use slipway::build::{BuildWorker, WorkerContext};
use slipway::hub::{LocalSink, LogHub, LogSink};
use slipway::queue::{BuildJob, BuildQueue, JobPriority, JobState};
use slipway::runtime::{ContainerManager, RuntimeConfig, ScanningAllocator};
use slipway::secrets::EnvCipher;
use slipway::store::{
    DeploymentStatus, Framework, MetadataStore, Project, StoreHandle,
};

const TEST_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

struct Fixture {
    store: StoreHandle,
    queue: Arc<BuildQueue>,
    hub: Arc<LogHub>,
    worker: BuildWorker,
}

fn fixture(builds_dir: &std::path::Path) -> Fixture {
    let store = StoreHandle::new(MetadataStore::open_in_memory().unwrap());
    let queue = Arc::new(BuildQueue::new());
    let hub = Arc::new(LogHub::new());
    let sink: Arc<dyn LogSink> = Arc::new(LocalSink::new(Arc::clone(&hub)));
    let cipher = EnvCipher::from_hex_key(TEST_KEY).unwrap();

    // The Docker handle is lazy; these tests never reach a container call.
    let docker = bollard::Docker::connect_with_local_defaults().unwrap();
    let manager = ContainerManager::new(
        docker,
        store.clone(),
        Arc::new(ScanningAllocator::new((4000, 4010), None)),
        cipher.clone(),
        Arc::clone(&sink),
        RuntimeConfig::default(),
    );

    let ctx = WorkerContext {
        store: store.clone(),
        queue: Arc::clone(&queue),
        sink,
        manager,
        cipher,
        builds_dir: builds_dir.to_path_buf(),
        install_timeout: Duration::from_secs(60),
        build_timeout: Duration::from_secs(60),
        image_timeout: Duration::from_secs(60),
    };
    let worker = BuildWorker::new(ctx, 0);

    Fixture {
        store,
        queue,
        hub,
        worker,
    }
}

async fn seed(store: &StoreHandle, deployment_id: &str) {
    let id = deployment_id.to_string();
    store
        .call(move |store| {
            if store.get_project("p1").unwrap().is_none() {
                store.insert_project(&Project {
                    id: "p1".into(),
                    name: "demo".into(),
                    repo_url: "https://127.0.0.1:1/none/repo.git".into(),
                    framework: Framework::Node,
                    production_branch: "main".into(),
                    install_command: None,
                    build_command: None,
                    output_directory: None,
                    node_version: None,
                    auto_deploy: true,
                    created_at: String::new(),
                })?;
            }
            store.create_deployment(&id, "p1", "main", "latest", None, false)?;
            Ok(())
        })
        .await
        .unwrap();
}

fn job(deployment_id: &str, install: Option<&str>, build: Option<&str>) -> BuildJob {
    BuildJob {
        deployment_id: deployment_id.to_string(),
        project_id: "p1".to_string(),
        user_id: None,
        // Unreachable: the clone stage falls back to the scaffold.
        repo_url: "https://127.0.0.1:1/none/repo.git".to_string(),
        branch: "main".to_string(),
        commit: "latest".to_string(),
        framework: Framework::Node,
        install_command: install.map(String::from),
        build_command: build.map(String::from),
        output_directory: None,
        node_version: None,
        git_token: None,
    }
}

#[tokio::test]
async fn test_install_failure_is_terminal_with_no_container() {
    let builds = tempfile::tempdir().unwrap();
    let fx = fixture(builds.path());
    seed(&fx.store, "d1").await;

    let job_id = fx.queue.enqueue(job("d1", Some("exit 7"), None), JobPriority::Production);
    let (taken_id, taken) = fx.queue.dequeue().await;
    assert_eq!(taken_id, job_id);

    fx.worker.process(&taken_id, &taken).await;

    let deployment = fx
        .store
        .call(|store| store.get_deployment("d1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.container_id.is_none());
    assert!(deployment.port.is_none());
    assert!(deployment.build_log.contains("exited with code 7"));

    let status = fx.queue.status(&job_id).unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(status.failure_reason.unwrap().contains("exited with code 7"));

    // Working directory was cleaned up on the failure path.
    assert!(!builds.path().join("d1").exists());
}

#[tokio::test]
async fn test_build_failure_carries_remediation_hint() {
    let builds = tempfile::tempdir().unwrap();
    let fx = fixture(builds.path());
    seed(&fx.store, "d1").await;

    let job_id = fx.queue.enqueue(
        job(
            "d1",
            Some("true"),
            Some("echo \"Error: Cannot find module 'left-pad'\"; exit 1"),
        ),
        JobPriority::Production,
    );
    let (taken_id, taken) = fx.queue.dequeue().await;
    fx.worker.process(&taken_id, &taken).await;

    let deployment = fx
        .store
        .call(|store| store.get_deployment("d1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.build_log.contains("hint: 'left-pad'"));
    assert_eq!(fx.queue.status(&job_id).unwrap().state, JobState::Failed);
}

#[tokio::test]
async fn test_unreachable_repo_scaffolds_and_continues_to_imaging() {
    // A clone failure must not be terminal: the scaffold carries the
    // pipeline through install and build. The uppercase deployment id makes
    // the image tag invalid so the run stops deterministically at the image
    // build, whether or not a Docker daemon is present.
    let builds = tempfile::tempdir().unwrap();
    let fx = fixture(builds.path());
    seed(&fx.store, "d1-UPPER").await;

    fx.queue.enqueue(
        job("d1-UPPER", Some("true"), Some("true")),
        JobPriority::Production,
    );
    let (taken_id, taken) = fx.queue.dequeue().await;
    fx.worker.process(&taken_id, &taken).await;

    let deployment = fx
        .store
        .call(|store| store.get_deployment("d1-UPPER"))
        .await
        .unwrap()
        .unwrap();
    let log = &deployment.build_log;
    assert!(log.contains("placeholder site"), "clone fell back to scaffold");
    assert!(log.contains("--> installing dependencies"));
    assert!(log.contains("--> building project"));
    assert!(log.contains("--> creating container image"));
    assert!(
        !log.contains("dependency install failed"),
        "retrieval failure must not surface as a terminal install failure"
    );
}

#[tokio::test]
async fn test_live_subscriber_and_reload_see_identical_state() {
    let builds = tempfile::tempdir().unwrap();
    let fx = fixture(builds.path());
    seed(&fx.store, "d1").await;

    // Subscribe before the build starts, collect frames while it runs.
    let (snapshot, mut rx) = fx.hub.subscribe("d1");
    assert!(snapshot.log.is_empty());

    fx.queue.enqueue(job("d1", Some("exit 1"), None), JobPriority::Production);
    let (taken_id, taken) = fx.queue.dequeue().await;
    fx.worker.process(&taken_id, &taken).await;

    let mut streamed = String::new();
    let mut last_status = None;
    while let Ok(frame) = rx.try_recv() {
        if let Some(fragment) = frame.fragment {
            streamed.push_str(&fragment);
        }
        if let Some(status) = frame.status {
            last_status = Some(status);
        }
    }

    let deployment = fx
        .store
        .call(|store| store.get_deployment("d1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.log + &streamed, deployment.build_log);
    assert_eq!(last_status, Some(DeploymentStatus::Failed));
    assert_eq!(deployment.status, DeploymentStatus::Failed);
}

#[tokio::test]
async fn test_production_build_dequeued_before_earlier_previews() {
    let builds = tempfile::tempdir().unwrap();
    let fx = fixture(builds.path());

    fx.queue.enqueue(job("preview-a", None, None), JobPriority::Preview);
    fx.queue.enqueue(job("preview-b", None, None), JobPriority::Preview);
    fx.queue.enqueue(job("prod", None, None), JobPriority::Production);

    let (_, first) = fx.queue.dequeue().await;
    assert_eq!(first.deployment_id, "prod");
}
