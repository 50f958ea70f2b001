//! Consume enrichment requests from a `PgQueue` and land the results in Postgres.
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use harvest_common::buffer::BatchSink;
use harvest_common::health::HealthRegistry;
use harvest_common::metrics::{serve, setup_metrics_routes, status_router};
use harvest_common::pgqueue::{connect_pool, PgQueue};
use harvest_common::queue::Publisher;
use harvest_common::records::Enriched;
use harvest_common::shutdown::spawn_signal_listener;
use harvest_common::storage::PgStore;
use harvest_common::upstream::build_http_client;
use harvest_worker::config::{Config, StageMode};
use harvest_worker::detail::DetailLookup;
use harvest_worker::lookup::Lookup;
use harvest_worker::profile::ProfileLookup;
use harvest_worker::worker::{run_workers, StageWorker};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

/// Long enough for one message spending every lookup attempt at the maximum backoff.
fn liveness_deadline(config: &Config) -> Duration {
    let attempts = config.lookup_max_attempts.max(1);
    let deadline = config.backoff.maximum_interval.0 * attempts
        + config.request_timeout_ms.0 * attempts
        + config.poll_interval.0;
    deadline.max(Duration::from_secs(60))
}

async fn run_stage<L>(
    config: &Config,
    source: &PgQueue,
    lookup: &L,
    store: &PgStore,
    forward_to: Option<&dyn Publisher>,
    liveness: &HealthRegistry,
    shutdown: &CancellationToken,
) -> Result<()>
where
    L: Lookup,
    PgStore: BatchSink<Enriched<L::Output>>,
{
    let settings = config.worker_settings();
    let deadline = liveness_deadline(config);

    let workers: Vec<_> = (0..config.worker_count.max(1))
        .map(|i| {
            let name = format!("{}-{}", config.worker_name, i);
            let handle = liveness.register(&name, deadline);
            StageWorker::new(
                &name,
                source,
                lookup,
                store,
                forward_to,
                settings.clone(),
                handle,
            )
        })
        .collect();

    info!(
        workers = workers.len(),
        queue = config_queue_name(config),
        "starting enrichment stage"
    );
    let reason = run_workers(&workers, shutdown).await?;
    info!(reason = ?reason, "enrichment stage finished");

    Ok(())
}

fn config_queue_name(config: &Config) -> &str {
    match config.mode {
        StageMode::Profile => config.profile_queue_name.as_str(),
        StageMode::Detail => config.detail_queue_name.as_str(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().context("invalid configuration")?;
    config.validate()?;

    let pool = connect_pool(
        &config.database_url,
        config.max_pg_connections,
        "harvest-worker",
    )
    .await?;
    let store = PgStore::new(pool.clone());
    let client = build_http_client(config.request_timeout_ms.0, &config.user_agent)?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let liveness = HealthRegistry::new("liveness");
    let router = setup_metrics_routes(status_router(liveness.clone(), shutdown.clone()))?;
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve probes and metrics: {}", e);
        }
    });

    let source = PgQueue::new_from_pool(config_queue_name(&config), pool.clone());
    match config.mode {
        StageMode::Profile => {
            let lookup = ProfileLookup::new(client, &config.profile_api_url);
            let detail_queue = PgQueue::new_from_pool(config.detail_queue_name.as_str(), pool);
            let forward_to: &dyn Publisher = &detail_queue;
            run_stage(
                &config,
                &source,
                &lookup,
                &store,
                Some(forward_to),
                &liveness,
                &shutdown,
            )
            .await?;
        }
        StageMode::Detail => {
            let lookup = DetailLookup::new(client, &config.detail_api_url);
            run_stage(
                &config,
                &source,
                &lookup,
                &store,
                None,
                &liveness,
                &shutdown,
            )
            .await?;
        }
    }

    Ok(())
}
