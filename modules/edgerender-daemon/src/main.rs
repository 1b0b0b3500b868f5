use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use edgerender_cache::{RecacheQueue, RedisRecacheQueue};
use edgerender_cluster::Registry;
use edgerender_common::Config;

mod capacity;
mod control;
mod dispatcher;
mod scheduler;
mod stats;

use control::DaemonState;
use dispatcher::Dispatcher;
use scheduler::Scheduler;
use stats::DaemonStats;

#[derive(Parser)]
#[command(name = "daemon", about = "EdgeRender cache daemon")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, default_value = "config.yaml")]
    config: String,
    /// Listen address override, e.g. 0.0.0.0:8090.
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

    info!(config = config_path.as_str(), "EdgeRender cache daemon starting...");

    let mut config = Config::load(&config_path)?;
    config.apply_env();
    let config = Arc::new(config);

    let daemon_id = config
        .daemon
        .clone()
        .context("daemon config requires a `daemon` section")?
        .id;

    let client = redis::Client::open(config.redis.addr.as_str())
        .context("invalid redis address")?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("failed to connect to redis")?;

    let registry = Arc::new(Registry::new(conn.clone(), config.registry.ttl));
    let queues: Arc<dyn RecacheQueue> = Arc::new(RedisRecacheQueue::new(conn));
    let stats = Arc::new(DaemonStats::new());

    let (tx, rx) = mpsc::channel(config.recache.internal_queue_max_size);
    let (paused_tx, paused_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let host_ids: Vec<i32> = config.hosts.iter().map(|h| h.id).collect();
    info!(hosts = host_ids.len(), daemon_id = daemon_id.as_str(), "Scheduler covering hosts");

    let scheduler = Scheduler::new(
        Arc::clone(&queues),
        config.recache.clone(),
        host_ids,
        tx.clone(),
        Arc::clone(&stats),
    );
    let scheduler_task = tokio::spawn(scheduler.run(paused_rx, shutdown_rx.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&queues),
        Arc::clone(&registry),
        config.recache.clone(),
        config.auth.internal_key.clone(),
        Arc::clone(&stats),
    ));
    let dispatcher_task = tokio::spawn(dispatcher.run(rx, shutdown_rx));

    let state = Arc::new(DaemonState {
        config: Arc::clone(&config),
        daemon_id,
        queues,
        registry,
        stats,
        paused: paused_tx,
        channel_probe: tx,
    });

    let app = Router::new()
        .route("/", get(control::health))
        .route("/status", get(control::status))
        .route("/internal/scheduler/pause", post(control::pause))
        .route("/internal/scheduler/resume", post(control::resume))
        .route("/internal/cache/recache", post(control::schedule_recache))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listen = args
        .listen
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(listen = listen.as_str(), "Daemon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Stop the tick loop and dispatch workers. Channel items not yet
    // dispatched are lost; Redis still holds every unacknowledged member.
    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    let _ = dispatcher_task.await;
    info!("Daemon stopped");
    Ok(())
}
