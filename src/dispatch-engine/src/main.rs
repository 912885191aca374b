//! Dispatch Engine: rate-limited outbound message delivery.
//!
//! Main entry point that wires the store, queue, worker pool and API server.

use anyhow::Context;
use clap::Parser;
use dispatch_admission::QueueAdmissionService;
use dispatch_api::{ApiServer, AppState};
use dispatch_core::config::{AppConfig, QueueBackend};
use dispatch_core::{Clock, SystemClock};
use dispatch_limiter::TokenBucketLimiter;
use dispatch_queue::{DeliveryQueue, JetStreamQueue, MemoryQueue};
use dispatch_store::{AtomicStore, IdempotencyStore, LocalStore, RedisStore, SenderLease};
use dispatch_worker::{DeliveryStats, HttpDeliveryClient, WorkerContext, WorkerPool, WorkerSettings};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dispatch-engine")]
#[command(about = "Rate-limited outbound message dispatch engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "DISPATCH_ENGINE__NODE_ID")]
    node_id: Option<String>,

    /// Number of dispatch workers (overrides config)
    #[arg(long, env = "DISPATCH_ENGINE__WORKER__COUNT")]
    workers: Option<usize>,

    /// HTTP port (overrides config)
    #[arg(long, env = "DISPATCH_ENGINE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Queue backend: memory or jetstream (overrides config)
    #[arg(long, env = "DISPATCH_ENGINE__QUEUE__BACKEND")]
    queue_backend: Option<String>,

    /// Accept and administer messages without running workers
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

fn parse_backend(s: &str) -> anyhow::Result<QueueBackend> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(QueueBackend::Memory),
        "jetstream" | "nats" => Ok(QueueBackend::Jetstream),
        other => anyhow::bail!("unknown queue backend '{other}'"),
    }
}

async fn build_store(config: &AppConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<dyn AtomicStore>> {
    if config.redis.enabled {
        let store = RedisStore::connect(&config.redis)
            .await
            .context("Redis connection required when redis.enabled is set")?;
        return Ok(Arc::new(store));
    }

    warn!("Redis disabled, using in-process store (single node only)");
    let local = Arc::new(LocalStore::new(clock));
    let for_eviction = local.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let evicted = for_eviction.evict_expired();
            if evicted > 0 {
                info!(evicted, remaining = for_eviction.len(), "Evicted expired store keys");
            }
        }
    });
    let store: Arc<dyn AtomicStore> = local;
    Ok(store)
}

async fn build_queue(config: &AppConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<dyn DeliveryQueue>> {
    match config.queue.backend {
        QueueBackend::Memory => {
            warn!("In-memory delivery queue: messages do not survive a restart");
            Ok(Arc::new(MemoryQueue::new(
                clock,
                config.queue.visibility_timeout(),
                config.queue.max_receive_count,
            )))
        }
        QueueBackend::Jetstream => {
            let queue = JetStreamQueue::connect(&config.nats, &config.queue, clock)
                .await
                .context("NATS JetStream connection failed")?;
            Ok(Arc::new(queue))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dispatch_engine=info,dispatch_worker=info,dispatch_queue=info,dispatch_store=info,dispatch_admission=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Dispatch Engine starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(workers) = cli.workers {
        config.worker.count = workers;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(backend) = cli.queue_backend.as_deref() {
        config.queue.backend = parse_backend(backend)?;
    }
    config.validate()?;

    info!(
        node_id = %config.node_id,
        workers = config.worker.count,
        http_port = config.api.http_port,
        queue_backend = ?config.queue.backend,
        redis = config.redis.enabled,
        capacity = config.limiter.capacity,
        refill_per_minute = config.limiter.refill_per_minute,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = build_store(&config, clock.clone()).await?;
    let queue = build_queue(&config, clock.clone()).await?;
    let stats = Arc::new(DeliveryStats::default());

    let ctx = Arc::new(WorkerContext {
        queue: queue.clone(),
        limiter: Arc::new(TokenBucketLimiter::new(
            store.clone(),
            clock.clone(),
            &config.limiter,
            config.redis.key_prefix.clone(),
        )),
        idempotency: IdempotencyStore::from_config(store.clone(), &config),
        lease: SenderLease::from_config(store.clone(), &config),
        client: Arc::new(HttpDeliveryClient::new(&config.delivery)?),
        stats: stats.clone(),
        clock: clock.clone(),
        settings: WorkerSettings::from_config(&config),
    });

    let mut pool = WorkerPool::new(ctx, config.node_id.clone(), config.worker.count);
    if cli.api_only {
        info!("Running in API-only mode (no dispatch workers)");
    } else {
        pool.start();
    }

    let admission = Arc::new(QueueAdmissionService::new(
        queue,
        stats,
        clock,
        config.admission.clone(),
    ));
    let state = AppState {
        admission,
        store,
        node_id: config.node_id.clone(),
        start_time: Instant::now(),
    };
    let api_server = ApiServer::new(config.clone(), state);

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Dispatch Engine is ready to serve traffic");

    let served = api_server.start_http(shutdown_signal()).await;

    info!("Draining dispatch workers");
    pool.stop().await;
    served?;

    info!("Dispatch Engine stopped");
    Ok(())
}
