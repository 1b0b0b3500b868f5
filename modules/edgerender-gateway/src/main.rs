use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use edgerender_cache::{CacheStore, RedisMetaStore, RedisRecacheQueue};
use edgerender_cluster::{spawn_heartbeat, Distributor, EgRegistration, Registry, ShardClient};
use edgerender_common::Config;
use renderer_client::RendererClient;

mod auth;
mod bypass;
mod debug_har;
mod error;
mod har;
mod internal;
mod metrics;
mod pipeline;
mod public;
mod recache;
mod singleflight;
mod state;

use metrics::Metrics;
use singleflight::SingleFlight;
use state::{AppState, HarStore};

/// Most recent HARs retained per host for the debug endpoint.
const HAR_RING_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "gateway", about = "EdgeRender edge gateway")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yaml")]
    config: String,
    /// Listen address override, e.g. 0.0.0.0:8080.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("edgerender=info".parse()?))
        .init();

    let args = Args::parse();
    let config_path = std::env::var("CONFIG_PATH").unwrap_or(args.config);

    info!(config = config_path.as_str(), "EdgeRender gateway starting...");

    let mut config = Config::load(&config_path)?;
    config.apply_env();
    let config = Arc::new(config);

    let eg = config
        .eg
        .clone()
        .context("gateway config requires an `eg` section")?;

    let client = redis::Client::open(config.redis.addr.as_str())
        .context("invalid redis address")?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("failed to connect to redis")?;

    let registry = Arc::new(Registry::new(conn.clone(), config.registry.ttl));
    registry
        .guard_unsharded_start(config.sharding.enabled)
        .await?;

    let registration = EgRegistration {
        eg_id: eg.id.clone(),
        address: eg.address.clone(),
        sharding_enabled: config.sharding.enabled,
    };
    registry.register(&registration).await?;
    info!(eg_id = eg.id.as_str(), "Registered in cluster");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat = spawn_heartbeat(Arc::clone(&registry), registration, shutdown_rx);

    let store = CacheStore::new(&eg.base_path, Arc::new(RedisMetaStore::new(conn.clone())));
    let queues = Arc::new(RedisRecacheQueue::new(conn));

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        eg,
        store,
        registry,
        distributor: Distributor::new(
            config.sharding.strategy,
            config.sharding.replication_factor,
        ),
        shard: ShardClient::new(
            config.auth.internal_key.clone(),
            config.sharding.inter_eg_timeout,
        ),
        renderer: RendererClient::new(),
        queues,
        flights: SingleFlight::new(),
        har_store: HarStore::new(HAR_RING_CAPACITY),
        metrics: Metrics::new(),
        origin: reqwest::Client::new(),
        started_at: Instant::now(),
    });

    let app = Router::new()
        .route("/", get(public::health))
        .route("/render", get(public::render_handler))
        .route("/internal/cache/pull", get(internal::pull))
        .route("/internal/cache/push", post(internal::push))
        .route("/internal/cache/status", get(internal::status))
        .route("/internal/cache/recache", post(internal::recache))
        .route("/internal/cache/invalidate", post(internal::invalidate))
        .route("/debug/har/{host_id}/{request_id}", get(debug_har::fetch_har))
        .route("/debug/har/render", get(debug_har::render_har))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listen = args
        .listen
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(listen = listen.as_str(), "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Stop the heartbeat and leave the cluster before exiting.
    let _ = shutdown_tx.send(true);
    let _ = heartbeat.await;
    info!("Gateway stopped");
    Ok(())
}
