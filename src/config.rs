//! Runtime configuration for the gateway and proxy processes.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the gateway process (API, queue, workers, log hub).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub builds_dir: PathBuf,
    pub base_domain: String,
    /// Number of concurrent build worker tasks.
    pub workers: usize,
    /// When set, workers publish log frames to this WebSocket ingest URL
    /// instead of the in-process hub.
    pub hub_url: Option<String>,
    pub port_range: (u16, u16),
    pub install_timeout: Duration,
    pub build_timeout: Duration,
    pub image_timeout: Duration,
    pub dev_mode: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 3100,
            db_path: PathBuf::from("slipway.db"),
            builds_dir: PathBuf::from("builds"),
            base_domain: "slipway.local".to_string(),
            workers: 2,
            hub_url: None,
            port_range: (4000, 4999),
            install_timeout: Duration::from_secs(600),
            build_timeout: Duration::from_secs(900),
            image_timeout: Duration::from_secs(900),
            dev_mode: false,
        }
    }
}

/// Configuration for the host router process.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub addr: String,
    pub db_path: PathBuf,
    pub base_domain: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("slipway.db"),
            base_domain: "slipway.local".to_string(),
        }
    }
}
