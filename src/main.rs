// Binary entry point
// Loads configuration, assembles both planes around the in-process
// collaborator seams, serves the gateway, and handles graceful shutdown
//
// Numan Thabit 2025 Nov

use anyhow::{anyhow, Context, Result};
use aware_gateway::clustering::ClusteringEngine;
use aware_gateway::config::AppConfig;
use aware_gateway::controlplane::ControlPlane;
use aware_gateway::embedding::{EmbeddingService, HashEmbedder};
use aware_gateway::gateway::Gateway;
use aware_gateway::policy::PolicyEngine;
use aware_gateway::server::{self, AppState};
use aware_gateway::store::{MemoryBus, MemoryConfigStore, MemoryVectorStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing().context("initialize tracing subscriber")?;

    if let Err(err) = run().await {
        tracing::error!(error = ?err, "fatal gateway error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "configs/gateway.yaml".to_string());
    let config = AppConfig::load(&config_path).context("load configuration")?;

    // Collaborator seams. The in-memory bus / kv / vector store carry the
    // same contracts the external bindings do, which keeps the two planes
    // honestly decoupled inside one process.
    let bus = Arc::new(MemoryBus::new());
    let kv = Arc::new(MemoryConfigStore::new());
    let vectors = Arc::new(MemoryVectorStore::new());

    let embedding = Arc::new(EmbeddingService::new(
        &config.embedding,
        Arc::new(HashEmbedder::new(config.embedding.dimension)),
    ));

    // Control plane
    let clustering = Arc::new(ClusteringEngine::new(
        config.clustering.clone(),
        embedding.clone(),
        vectors,
    ));
    let policy_engine = Arc::new(PolicyEngine::new(
        config.policy.clone(),
        config.breaker.clone(),
        clustering.clone(),
        kv.clone(),
    ));
    let control_plane = Arc::new(ControlPlane::new(
        &config,
        clustering.clone(),
        policy_engine,
        bus.clone(),
    ));
    control_plane.start();

    // Data plane
    let gateway = Gateway::new(&config, embedding, bus, kv);
    gateway
        .start(control_plane.subscribe_snapshots())
        .await
        .context("start gateway")?;

    let upstream = match &config.server.upstream {
        Some(raw) => {
            let base = url::Url::parse(raw).with_context(|| format!("parse upstream URL {raw}"))?;
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("build upstream HTTP client")?;
            info!(upstream = %base, "proxying /api traffic to downstream");
            Some((client, base))
        }
        None => {
            warn!("no upstream configured; /api answers with simulated responses");
            None
        }
    };

    let state = AppState {
        limiter: gateway.limiter.clone(),
        breaker: gateway.breaker.clone(),
        sampler: gateway.sampler.clone(),
        vector_agent: gateway.vector_agent.clone(),
        watcher: gateway.watcher.clone(),
        clustering: clustering.clone(),
        upstream,
        metrics_enabled: config.metrics.enabled,
    };
    let router = server::create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(address = %addr, "gateway server online");

    let server_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            warn!(error = %err, "server error");
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                info!(
                    clusters = clustering.cluster_count(),
                    limiter_buckets = gateway.limiter.bucket_count(),
                    policies = gateway.watcher.policy_count(),
                    "gateway heartbeat"
                );
            }
            res = tokio::signal::ctrl_c() => {
                if let Err(err) = res {
                    warn!(error = %err, "ctrl_c listener error");
                }
                info!("shutdown signal received, exiting");
                break;
            }
        }
    }

    gateway.stop();
    control_plane.stop();
    server_handle.abort();
    info!("gateway stopped");
    Ok(())
}

fn init_tracing() -> Result<()> {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,hyper=warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("tracing subscriber init: {err}"))
}
