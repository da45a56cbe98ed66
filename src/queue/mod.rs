//! Durable-for-the-session, priority-ordered build queue.
//!
//! One entry per requested deployment build. Jobs whose branch is the
//! project's production branch outrank preview jobs so production deploys
//! are never starved behind a backlog of previews. There are zero automatic
//! retries: a failed build is terminal and must be re-triggered explicitly.
//! Finished job records are kept with bounded counts purely for operational
//! visibility; the durable outcome lives in the Deployment record.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::errors::QueueError;
use crate::store::Framework;

const COMPLETED_RETENTION: usize = 100;
const FAILED_RETENTION: usize = 50;

/// Transient work item consumed exactly once by a build worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub deployment_id: String,
    pub project_id: String,
    pub user_id: Option<String>,
    pub repo_url: String,
    pub branch: String,
    /// Commit SHA, or the sentinel `latest` for branch head.
    pub commit: String,
    pub framework: Framework,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub output_directory: Option<String>,
    pub node_version: Option<String>,
    /// Short-lived credential for private repository access. Injected into
    /// the clone URL and scrubbed from every emitted log line.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub git_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Preview,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// Operational view of a job, served by `getJobStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
    pub deployment_id: String,
    pub state: JobState,
    pub progress: u8,
    pub failure_reason: Option<String>,
}

struct QueuedEntry {
    id: String,
    priority: JobPriority,
    seq: u64,
    job: BuildJob,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedEntry {}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; FIFO (lower sequence) within a class.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedEntry>,
    records: HashMap<String, JobStatus>,
    seq: u64,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

/// In-process priority queue dispatching each job to exactly one worker.
pub struct BuildQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    completed_retention: usize,
    failed_retention: usize,
}

impl Default for BuildQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildQueue {
    pub fn new() -> Self {
        Self::with_retention(COMPLETED_RETENTION, FAILED_RETENTION)
    }

    pub fn with_retention(completed: usize, failed: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                records: HashMap::new(),
                seq: 0,
                completed: VecDeque::new(),
                failed: VecDeque::new(),
            }),
            notify: Notify::new(),
            completed_retention: completed,
            failed_retention: failed,
        }
    }

    /// Enqueue a job and return its handle immediately.
    pub fn enqueue(&self, job: BuildJob, priority: JobPriority) -> String {
        let id = Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.seq += 1;
            let seq = state.seq;
            state.records.insert(
                id.clone(),
                JobStatus {
                    id: id.clone(),
                    deployment_id: job.deployment_id.clone(),
                    state: JobState::Queued,
                    progress: 0,
                    failure_reason: None,
                },
            );
            state.heap.push(QueuedEntry {
                id: id.clone(),
                priority,
                seq,
                job,
            });
        }
        self.notify.notify_one();
        id
    }

    /// Block until a job is available and hand it to exactly one caller.
    pub async fn dequeue(&self) -> (String, BuildJob) {
        loop {
            if let Some(popped) = self.try_pop() {
                return popped;
            }
            self.notify.notified().await;
        }
    }

    fn try_pop(&self) -> Option<(String, BuildJob)> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let entry = state.heap.pop()?;
        if let Some(record) = state.records.get_mut(&entry.id) {
            record.state = JobState::Active;
        }
        // Chain the wakeup so a second ready job is never stranded when
        // several workers were notified for one push.
        if !state.heap.is_empty() {
            self.notify.notify_one();
        }
        Some((entry.id, entry.job))
    }

    pub fn set_progress(&self, job_id: &str, progress: u8) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if let Some(record) = state.records.get_mut(job_id) {
            record.progress = progress.min(100);
        }
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatus> {
        let state = self.state.lock().expect("queue lock poisoned");
        state.records.get(job_id).cloned()
    }

    /// Remove a not-yet-started job. Returns the deployment id it carried.
    /// A job already taken by a worker is not preemptible.
    pub fn cancel(&self, job_id: &str) -> Result<String, QueueError> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let record = state
            .records
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NotFound { id: job_id.to_string() })?;
        if record.state != JobState::Queued {
            return Err(QueueError::AlreadyStarted { id: job_id.to_string() });
        }
        record.state = JobState::Cancelled;
        let deployment_id = record.deployment_id.clone();
        state.heap.retain(|entry| entry.id != job_id);
        Ok(deployment_id)
    }

    pub fn mark_completed(&self, job_id: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if let Some(record) = state.records.get_mut(job_id) {
            record.state = JobState::Completed;
            record.progress = 100;
        }
        state.completed.push_back(job_id.to_string());
        while state.completed.len() > self.completed_retention {
            if let Some(old) = state.completed.pop_front() {
                state.records.remove(&old);
            }
        }
    }

    pub fn mark_failed(&self, job_id: &str, reason: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if let Some(record) = state.records.get_mut(job_id) {
            record.state = JobState::Failed;
            record.failure_reason = Some(reason.to_string());
        }
        state.failed.push_back(job_id.to_string());
        while state.failed.len() > self.failed_retention {
            if let Some(old) = state.failed.pop_front() {
                state.records.remove(&old);
            }
        }
    }

    /// Number of jobs waiting to be picked up.
    pub fn depth(&self) -> usize {
        let state = self.state.lock().expect("queue lock poisoned");
        state.heap.len()
    }
}
