//! Typed error hierarchy for the deployment core.
//!
//! Three top-level enums cover the three subsystems:
//! - `BuildError` — terminal failures from the five-stage build pipeline
//! - `StartError` — failures while bringing a built image online
//! - `QueueError` — job queue operation failures
//!
//! Retrieval (clone) failures never appear here: a failed clone is masked
//! by the placeholder-site fallback and the pipeline continues.

use thiserror::Error;

/// Terminal failures from the build pipeline. Each variant short-circuits
/// the remaining stages and is written verbatim to the deployment log.
/// None of these are retried automatically.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("dependency install failed: {message}")]
    Install { message: String },

    #[error("build failed: {message}")]
    Build { message: String },

    #[error("image build failed: {message}")]
    Containerize { message: String },

    #[error("container start failed: {0}")]
    Start(#[from] StartError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures while starting a built image. A failed start must not leave a
/// partially created container behind; the manager removes it on the way out.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("no free port in range {lo}-{hi}")]
    PortsExhausted { lo: u16, hi: u16 },

    #[error("image {image} not found")]
    ImageMissing { image: String },

    #[error("deployment {id} not found")]
    DeploymentNotFound { id: String },

    #[error("container runtime error: {0}")]
    Runtime(String),
}

/// Job queue operation failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {id} not found")]
    NotFound { id: String },

    #[error("job {id} already started; builds in progress cannot be cancelled")]
    AlreadyStarted { id: String },
}
