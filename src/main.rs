//! Slipway — self-hosted deployment platform.
//!
//! Two long-running processes share one metadata store:
//! `slipway serve` runs the gateway (control API, build queue and workers,
//! log broadcast hub); `slipway proxy` runs the host router that serves
//! deployed applications by hostname.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use slipway::config::{GatewayConfig, ProxyConfig};

#[derive(Parser)]
#[command(name = "slipway")]
#[command(version, about = "Self-hosted deployment platform")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway: control API, build workers and log hub
    Serve {
        #[arg(long, env = "SLIPWAY_PORT", default_value = "3100")]
        port: u16,

        #[arg(long, env = "SLIPWAY_DB", default_value = "slipway.db")]
        db_path: PathBuf,

        /// Directory holding per-deployment build working directories
        #[arg(long, env = "SLIPWAY_BUILDS_DIR", default_value = "builds")]
        builds_dir: PathBuf,

        /// Base domain deployments are served under
        #[arg(long, env = "SLIPWAY_BASE_DOMAIN", default_value = "slipway.local")]
        base_domain: String,

        /// Concurrent build workers
        #[arg(long, env = "SLIPWAY_WORKERS", default_value = "2")]
        workers: usize,

        /// Publish build logs to a remote gateway's /ws/ingest instead of
        /// the in-process hub
        #[arg(long, env = "SLIPWAY_HUB_URL")]
        hub_url: Option<String>,

        #[arg(long, env = "SLIPWAY_PORT_RANGE_START", default_value = "4000")]
        port_range_start: u16,

        #[arg(long, env = "SLIPWAY_PORT_RANGE_END", default_value = "4999")]
        port_range_end: u16,

        /// Wall-clock bound for the dependency install step, in seconds
        #[arg(long, env = "SLIPWAY_INSTALL_TIMEOUT", default_value = "600")]
        install_timeout: u64,

        /// Wall-clock bound for the build step, in seconds
        #[arg(long, env = "SLIPWAY_BUILD_TIMEOUT", default_value = "900")]
        build_timeout: u64,

        /// Wall-clock bound for the image build, in seconds
        #[arg(long, env = "SLIPWAY_IMAGE_TIMEOUT", default_value = "900")]
        image_timeout: u64,

        /// Permissive CORS for local dashboard development
        #[arg(long)]
        dev: bool,
    },
    /// Run the host router (reverse proxy)
    Proxy {
        #[arg(long, env = "SLIPWAY_PROXY_ADDR", default_value = "0.0.0.0:8080")]
        addr: String,

        #[arg(long, env = "SLIPWAY_DB", default_value = "slipway.db")]
        db_path: PathBuf,

        #[arg(long, env = "SLIPWAY_BASE_DOMAIN", default_value = "slipway.local")]
        base_domain: String,
    },
}

fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            port,
            db_path,
            builds_dir,
            base_domain,
            workers,
            hub_url,
            port_range_start,
            port_range_end,
            install_timeout,
            build_timeout,
            image_timeout,
            dev,
        } => {
            let config = GatewayConfig {
                port,
                db_path,
                builds_dir,
                base_domain,
                workers,
                hub_url,
                port_range: (port_range_start, port_range_end),
                install_timeout: Duration::from_secs(install_timeout),
                build_timeout: Duration::from_secs(build_timeout),
                image_timeout: Duration::from_secs(image_timeout),
                dev_mode: dev,
            };
            slipway::gateway::start(config).await
        }
        Commands::Proxy {
            addr,
            db_path,
            base_domain,
        } => {
            let config = ProxyConfig {
                addr,
                db_path,
                base_domain,
            };
            slipway::proxy::run(config).await
        }
    }
}
