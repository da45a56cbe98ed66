//! Host router: wildcard-host reverse proxy in front of deployment
//! containers.
//!
//! Each inbound request's hostname is resolved to a live deployment —
//! either a preview subdomain encoding the deployment id, or an exact
//! match against a `ready` deployment's recorded URL — and proxied to
//! `localhost:<port>` preserving method, headers, body and protocol
//! upgrades. No match yields a 404. `/healthz` answers before routing.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HOST, HeaderValue, UPGRADE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::store::{MetadataStore, StoreHandle};

/// Resolves request hostnames to live deployment ports.
pub struct HostRouter {
    store: StoreHandle,
    base_domain: String,
}

/// Extract the deployment id from a preview hostname:
/// `<deployment-id>.preview.<base_domain>`.
pub fn preview_deployment_id<'a>(host: &'a str, base_domain: &str) -> Option<&'a str> {
    let suffix = format!(".preview.{}", base_domain);
    host.strip_suffix(suffix.as_str())
        .filter(|id| !id.is_empty() && !id.contains('.'))
}

impl HostRouter {
    pub fn new(store: StoreHandle, base_domain: &str) -> Self {
        Self {
            store,
            base_domain: base_domain.to_ascii_lowercase(),
        }
    }

    /// Resolve a request host to the target port of a live deployment.
    pub async fn resolve(&self, host: &str) -> Option<u16> {
        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();

        if let Some(deployment_id) = preview_deployment_id(&host, &self.base_domain) {
            let id = deployment_id.to_string();
            return self
                .store
                .call(move |store| store.find_live_port(&id))
                .await
                .ok()
                .flatten();
        }

        let url = format!("https://{}", host);
        self.store
            .call(move |store| store.find_ready_by_url(&url))
            .await
            .ok()
            .flatten()
            .and_then(|deployment| deployment.port)
    }
}

/// Run the proxy until shutdown.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let store = StoreHandle::new(
        MetadataStore::open(&config.db_path).context("Failed to open metadata store")?,
    );
    let router = Arc::new(HostRouter::new(store, &config.base_domain));

    let listener = TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.addr))?;
    info!(addr = %listener.local_addr()?, base_domain = %config.base_domain, "host router listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle(req, Arc::clone(&router)));
            let served = hyper::server::conn::http1::Builder::new()
                .preserve_header_case(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await;
            if let Err(e) = served {
                debug!(peer = %peer, "connection ended with error: {}", e);
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    router: Arc<HostRouter>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
    // Health check lives outside the routing logic and needs no host match.
    if req.uri().path() == "/healthz" {
        return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#));
    }

    let Some(host) = request_host(&req) else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "missing host header"));
    };

    let Some(port) = router.resolve(&host).await else {
        debug!(host = %host, "no live deployment for host");
        return Ok(text_response(StatusCode::NOT_FOUND, "deployment not found"));
    };

    match forward(req, port).await {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!(host = %host, port, "proxy forward failed: {:#}", e);
            Ok(text_response(StatusCode::BAD_GATEWAY, "upstream unavailable"))
        }
    }
}

/// Forward a request to `127.0.0.1:<port>`, passing protocol upgrades
/// through by joining both upgraded byte streams.
async fn forward(
    mut req: Request<Incoming>,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
    let authority = format!("127.0.0.1:{}", port);

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    *req.uri_mut() = path_and_query.parse::<Uri>().context("invalid request path")?;
    req.headers_mut()
        .insert(HOST, HeaderValue::from_str(&authority).context("invalid authority")?);

    // Take the client-side upgrade handle before the request is consumed.
    let client_upgrade = req
        .headers()
        .contains_key(UPGRADE)
        .then(|| hyper::upgrade::on(&mut req));

    let stream = TcpStream::connect(&authority)
        .await
        .with_context(|| format!("connect to {}", authority))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .context("backend handshake")?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("backend connection error: {}", e);
        }
    });

    let mut response = sender.send_request(req).await.context("backend request")?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS
        && let Some(client_upgrade) = client_upgrade
    {
        let backend_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            match (client_upgrade.await, backend_upgrade.await) {
                (Ok(client), Ok(backend)) => {
                    let mut client = TokioIo::new(client);
                    let mut backend = TokioIo::new(backend);
                    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                        debug!("upgraded stream closed: {}", e);
                    }
                }
                (client, backend) => {
                    debug!(
                        "upgrade join failed (client: {}, backend: {})",
                        client.is_ok(),
                        backend.is_ok()
                    );
                }
            }
        });
    }

    Ok(response.map(|body| body.boxed()))
}

fn request_host(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
}

fn text_response(status: StatusCode, body: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("static response")
}

fn json_response(status: StatusCode, body: &'static str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .expect("static response")
}

fn full_body(body: &'static str) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from_static(body.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeploymentStatus, Framework, Project};

    fn router_with_live_deployments() -> HostRouter {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .insert_project(&Project {
                id: "p1".into(),
                name: "Acme Site".into(),
                repo_url: "https://example.com/acme.git".into(),
                framework: Framework::Next,
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
            .create_deployment("prod-1", "p1", "main", "latest", None, false)
            .unwrap();
        store.advance_status("prod-1", DeploymentStatus::Building).unwrap();
        store
            .set_live("prod-1", "c1", 4001, "https://acme-site.slipway.local")
            .unwrap();

        store
            .create_deployment("prev-1", "p1", "feature/x", "latest", None, true)
            .unwrap();
        store.advance_status("prev-1", DeploymentStatus::Building).unwrap();
        store
            .set_live("prev-1", "c2", 4002, "https://prev-1.preview.slipway.local")
            .unwrap();

        HostRouter::new(StoreHandle::new(store), "slipway.local")
    }

    #[test]
    fn test_preview_deployment_id_parsing() {
        assert_eq!(
            preview_deployment_id("abc123.preview.slipway.local", "slipway.local"),
            Some("abc123")
        );
        assert_eq!(preview_deployment_id("abc.def.preview.slipway.local", "slipway.local"), None);
        assert_eq!(preview_deployment_id("preview.slipway.local", "slipway.local"), None);
        assert_eq!(preview_deployment_id("acme.slipway.local", "slipway.local"), None);
        assert_eq!(preview_deployment_id("abc.preview.other.host", "slipway.local"), None);
    }

    #[tokio::test]
    async fn test_resolve_production_host() {
        let router = router_with_live_deployments();
        assert_eq!(router.resolve("acme-site.slipway.local").await, Some(4001));
        // Port suffixes and case are normalized away.
        assert_eq!(router.resolve("Acme-Site.slipway.local:443").await, Some(4001));
    }

    #[tokio::test]
    async fn test_resolve_preview_host() {
        let router = router_with_live_deployments();
        assert_eq!(router.resolve("prev-1.preview.slipway.local").await, Some(4002));
        assert_eq!(router.resolve("missing.preview.slipway.local").await, None);
    }

    #[tokio::test]
    async fn test_resolve_unknown_host_is_none() {
        let router = router_with_live_deployments();
        assert_eq!(router.resolve("other.slipway.local").await, None);
        assert_eq!(router.resolve("example.com").await, None);
    }

    #[tokio::test]
    async fn test_resolve_ignores_retired_deployments() {
        let router = router_with_live_deployments();
        router
            .store
            .call(|store| store.release_container("prod-1", DeploymentStatus::Stopped))
            .await
            .unwrap();
        assert_eq!(router.resolve("acme-site.slipway.local").await, None);
    }
}
