use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::tokio::TokioIo;
use portmap_core::{LoadOutcome, MappingStore, StorePaths};
use portmap_pods::{KubePodResolver, PodSelector};
use portmap_proxy::{ProxyRouter, RequestForwarder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod identity;

use api::Gateway;
use config::GatewayConfig;
use identity::IdentityResolver;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting portmap-gateway...");
    let config = GatewayConfig::from_env();

    let paths = StorePaths::select(
        config.state_file.clone(),
        config.data_dir.clone(),
        config.default_state_file.clone(),
    );
    let (store, outcome) = MappingStore::open(&paths);
    match &outcome {
        LoadOutcome::Loaded(count) => {
            info!("Loaded {} mappings from {}", count, paths.state_file.display())
        }
        LoadOutcome::Missing => info!(
            "No mapping state at {}, starting empty",
            paths.state_file.display()
        ),
        LoadOutcome::SeededFromDefault(count) => info!(
            "Seeded {} mappings into {} from the default location",
            count,
            paths.state_file.display()
        ),
        LoadOutcome::Corrupt => warn!(
            "Mapping state at {} was unreadable, starting empty",
            paths.state_file.display()
        ),
    }
    let store = Arc::new(store);

    let selector = PodSelector {
        namespace: config.namespace.clone(),
        label_selector: config.label_selector.clone(),
    };
    let resolver = Arc::new(
        KubePodResolver::new(selector)
            .await
            .context("failed to construct the pod inventory client")?,
    );
    info!(
        "Pod resolver initialized (namespace {}, selector {})",
        config.namespace, config.label_selector
    );

    let forwarder = RequestForwarder::new(config.proxy_timeout);
    info!("Request forwarder initialized with {:?} timeout", config.proxy_timeout);

    let router = ProxyRouter::new(store.clone(), resolver.clone(), forwarder);
    let gateway_identity = IdentityResolver::new(&config);
    if config.disable_auth {
        warn!("Authentication is DISABLED - identities are accepted unverified");
    }

    let gateway = Arc::new(Gateway::new(
        store,
        resolver,
        router,
        gateway_identity,
        config.public_base_url.clone(),
    ));

    let listener = TcpListener::bind(&config.bind).await?;
    info!("HTTP server listening on {}", config.bind);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let gateway = gateway.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let gateway = gateway.clone();
                async move { Ok::<_, std::convert::Infallible>(gateway.handle(req).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving connection from {}: {}", peer_addr, e);
            }
        });
    }
}
