//! Host port allocation for deployment containers.
//!
//! The free-port search is a shared-resource critical section: the whole
//! scan runs under one async mutex so two concurrent container starts can
//! never race onto the same port. The allocator is a strategy trait so a
//! distributed deployment can substitute a reservation-backed
//! implementation without touching the manager.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::ListContainersOptions;
use tokio::sync::Mutex;
use tracing::warn;

use crate::errors::StartError;

#[async_trait]
pub trait PortAllocator: Send + Sync {
    /// Claim the lowest free port in range. Uniqueness must hold under
    /// concurrent calls.
    async fn allocate(&self) -> Result<u16, StartError>;

    /// Return a port to the pool.
    async fn release(&self, port: u16);

    /// Mark a port as taken (startup re-reservation of live deployments).
    async fn reserve(&self, port: u16);
}

/// Mutex-guarded scanning allocator over a fixed range, cross-checked
/// against ports bound by any container visible to the runtime.
pub struct ScanningAllocator {
    lo: u16,
    hi: u16,
    docker: Option<Docker>,
    in_use: Mutex<BTreeSet<u16>>,
}

impl ScanningAllocator {
    pub fn new(range: (u16, u16), docker: Option<Docker>) -> Self {
        Self {
            lo: range.0,
            hi: range.1,
            docker,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// Ports currently published by running containers. Failures degrade to
    /// the tracked set alone; allocation must not die because the runtime
    /// momentarily cannot be queried.
    async fn runtime_ports(&self) -> BTreeSet<u16> {
        let Some(docker) = &self.docker else {
            return BTreeSet::new();
        };
        let containers = match docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
        {
            Ok(containers) => containers,
            Err(e) => {
                warn!("could not list containers for port cross-check: {}", e);
                return BTreeSet::new();
            }
        };

        let mut bound = BTreeSet::new();
        for container in containers {
            for port in container.ports.unwrap_or_default() {
                if let Some(public) = port.public_port {
                    bound.insert(public as u16);
                }
            }
        }
        bound
    }
}

#[async_trait]
impl PortAllocator for ScanningAllocator {
    async fn allocate(&self) -> Result<u16, StartError> {
        let mut in_use = self.in_use.lock().await;
        let bound = self.runtime_ports().await;
        for candidate in self.lo..=self.hi {
            if !in_use.contains(&candidate) && !bound.contains(&candidate) {
                in_use.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(StartError::PortsExhausted {
            lo: self.lo,
            hi: self.hi,
        })
    }

    async fn release(&self, port: u16) {
        self.in_use.lock().await.remove(&port);
    }

    async fn reserve(&self, port: u16) {
        self.in_use.lock().await.insert(port);
    }
}
