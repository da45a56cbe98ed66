//! Clone stage: shallow-clone the requested branch, falling back to the
//! placeholder scaffold when the repository is unreachable.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use super::commands::run_logged;
use super::{Emitter, scaffold};
use crate::queue::BuildJob;

const CLONE_TIMEOUT: Duration = Duration::from_secs(300);

/// What the clone stage produced in the working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// The repository was cloned (and checked out if a SHA was pinned).
    Repository,
    /// Clone failed; the placeholder application was scaffolded instead.
    Scaffold,
}

/// Inject a credential into an https clone URL.
/// `https://host/owner/repo.git` -> `https://TOKEN@host/owner/repo.git`
pub fn authenticated_url(repo_url: &str, token: Option<&str>) -> String {
    match token {
        Some(token) if !token.is_empty() && repo_url.starts_with("https://") => {
            repo_url.replacen("https://", &format!("https://{}@", token), 1)
        }
        _ => repo_url.to_string(),
    }
}

/// Populate `dir` with the deployment's source. Never fails the pipeline
/// for retrieval reasons: an unreachable repository, bad credential or
/// missing branch all degrade to the scaffold.
pub async fn fetch_source(job: &BuildJob, dir: &Path, emitter: &Emitter) -> Result<SourceKind> {
    let clone_url = authenticated_url(&job.repo_url, job.git_token.as_deref());
    let command = format!(
        "git clone --depth 1 --branch '{}' '{}' .",
        job.branch.replace('\'', ""),
        clone_url.replace('\'', "")
    );

    let out = run_logged(&command, dir, &[], CLONE_TIMEOUT, emitter).await?;
    if !out.success() {
        emitter
            .log(&format!(
                "clone of {} failed (exit {}), deploying placeholder site instead\n",
                job.repo_url, out.exit_code
            ))
            .await;
        scaffold::write_placeholder(dir, &job.deployment_id).await?;
        return Ok(SourceKind::Scaffold);
    }
    emitter.log("repository cloned\n").await;

    if job.commit != "latest" && !job.commit.is_empty() {
        let checkout = format!("git fetch --depth 1 origin '{0}' && git checkout '{0}'", job.commit.replace('\'', ""));
        let out = run_logged(&checkout, dir, &[], CLONE_TIMEOUT, emitter).await?;
        if !out.success() {
            // Shallow clones may not contain the requested SHA; building the
            // branch head is still more useful than failing retrieval.
            emitter
                .log(&format!(
                    "checkout of {} failed, building branch head instead\n",
                    job.commit
                ))
                .await;
        }
    }

    Ok(SourceKind::Repository)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{LocalSink, LogHub};
    use crate::store::{Framework, MetadataStore, Project, StoreHandle};
    use std::sync::Arc;

    fn test_emitter(secret: Option<String>) -> (Emitter, Arc<LogHub>, StoreHandle) {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .insert_project(&Project {
                id: "p1".into(),
                name: "site".into(),
                repo_url: "https://example.invalid/repo.git".into(),
                framework: Framework::Node,
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
        let handle = StoreHandle::new(store);
        let hub = Arc::new(LogHub::new());
        let sink = Arc::new(LocalSink::new(Arc::clone(&hub)));
        (Emitter::new(handle.clone(), sink, "d1", secret), hub, handle)
    }

    fn test_job(repo_url: &str, token: Option<&str>) -> BuildJob {
        BuildJob {
            deployment_id: "d1".into(),
            project_id: "p1".into(),
            user_id: None,
            repo_url: repo_url.into(),
            branch: "main".into(),
            commit: "latest".into(),
            framework: Framework::Node,
            install_command: None,
            build_command: None,
            output_directory: None,
            node_version: None,
            git_token: token.map(String::from),
        }
    }

    #[test]
    fn test_authenticated_url_injection() {
        assert_eq!(
            authenticated_url("https://github.com/acme/site.git", Some("tok123")),
            "https://tok123@github.com/acme/site.git"
        );
        assert_eq!(
            authenticated_url("https://github.com/acme/site.git", None),
            "https://github.com/acme/site.git"
        );
        assert_eq!(
            authenticated_url("git@github.com:acme/site.git", Some("tok123")),
            "git@github.com:acme/site.git"
        );
        assert_eq!(
            authenticated_url("https://github.com/acme/site.git", Some("")),
            "https://github.com/acme/site.git"
        );
    }

    #[tokio::test]
    async fn test_unreachable_repository_scaffolds_and_continues() {
        let (emitter, _, handle) = test_emitter(None);
        let dir = tempfile::tempdir().unwrap();
        let job = test_job("https://127.0.0.1:1/owner/repo.git", None);

        let kind = fetch_source(&job, dir.path(), &emitter).await.unwrap();
        assert_eq!(kind, SourceKind::Scaffold);
        assert!(dir.path().join("package.json").exists());
        assert!(dir.path().join("server.js").exists());

        let deployment = handle
            .call(|s| s.get_deployment("d1"))
            .await
            .unwrap()
            .unwrap();
        assert!(deployment.build_log.contains("placeholder site"));
    }

    #[tokio::test]
    async fn test_credential_never_reaches_the_log() {
        let (emitter, hub, handle) = test_emitter(Some("tok-secret-xyz".into()));
        let dir = tempfile::tempdir().unwrap();
        let job = test_job("https://127.0.0.1:1/owner/repo.git", Some("tok-secret-xyz"));

        let _ = fetch_source(&job, dir.path(), &emitter).await.unwrap();

        let deployment = handle
            .call(|s| s.get_deployment("d1"))
            .await
            .unwrap()
            .unwrap();
        assert!(!deployment.build_log.contains("tok-secret-xyz"));
        let (snapshot, _) = hub.subscribe("d1");
        assert!(!snapshot.log.contains("tok-secret-xyz"));
    }

    #[tokio::test]
    async fn test_local_repository_clones_successfully() {
        // Build a real local repo so clone exercises the success path.
        let src = tempfile::tempdir().unwrap();
        let run = |args: &[&str], dir: &Path| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(dir)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.com")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.com")
                .output()
                .unwrap()
        };
        run(&["init", "-b", "main"], src.path());
        std::fs::write(src.path().join("index.html"), "<h1>hi</h1>").unwrap();
        run(&["add", "."], src.path());
        run(&["commit", "-m", "init"], src.path());

        let (emitter, _, _) = test_emitter(None);
        let dir = tempfile::tempdir().unwrap();
        let job = test_job(&format!("file://{}", src.path().display()), None);

        let kind = fetch_source(&job, dir.path(), &emitter).await.unwrap();
        assert_eq!(kind, SourceKind::Repository);
        assert!(dir.path().join("index.html").exists());
    }
}
