//! Crawl the upstream search partition by partition and publish enrichment requests.
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use harvest_common::checkpoint::{CheckpointStore, FileCheckpointStore, PgCheckpointStore};
use harvest_common::health::{ComponentStatus, HealthRegistry};
use harvest_common::metrics::{serve, setup_metrics_routes, status_router};
use harvest_common::pgqueue::{connect_pool, PgQueue};
use harvest_common::shutdown::spawn_signal_listener;
use harvest_common::storage::PgStore;
use harvest_common::upstream::build_http_client;
use harvest_crawler::config::{CheckpointBackend, Config};
use harvest_crawler::crawl::Crawler;
use harvest_crawler::search::SearchClient;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().context("invalid configuration")?;

    let pool = connect_pool(
        &config.database_url,
        config.max_pg_connections,
        "harvest-crawler",
    )
    .await?;
    let store = PgStore::new(pool.clone());
    let queue = PgQueue::new_from_pool(config.queue_name.as_str(), pool.clone());

    let checkpoints: Box<dyn CheckpointStore> = match config.checkpoint_backend {
        CheckpointBackend::File => Box::new(FileCheckpointStore::new(&config.checkpoint_path)),
        CheckpointBackend::Postgres => Box::new(PgCheckpointStore::new(pool, &config.crawl_name)),
    };
    if config.reset_checkpoint {
        checkpoints.reset().await?;
        info!("checkpoint reset on request");
    }

    let client = build_http_client(config.request_timeout_ms.0, &config.user_agent)?;
    let source = SearchClient::new(client, &config.search_api_url);

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let liveness = HealthRegistry::new("liveness");
    // One page can spend every search attempt at the maximum backoff interval.
    let search_policy = config.backoff.policy(config.search_max_attempts);
    let deadline = search_policy.maximum_interval * (config.search_max_attempts + 1)
        + config.request_timeout_ms.0 * config.search_max_attempts;
    let crawler_liveness = liveness.register("crawler", deadline.max(Duration::from_secs(60)));

    let router = setup_metrics_routes(status_router(liveness, shutdown.clone()))?;
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve probes and metrics: {}", e);
        }
    });

    let crawler = Crawler::new(
        config.partitions.0.clone(),
        &source,
        &store,
        &queue,
        checkpoints.as_ref(),
        search_policy,
        config.backoff.policy(config.publish_max_attempts),
        &crawler_liveness,
    );

    let summary = crawler.run(&shutdown).await?;
    crawler_liveness.report_status(ComponentStatus::Finished);
    info!(
        pages = summary.pages,
        emitted = summary.emitted,
        interrupted = summary.interrupted,
        "crawl finished"
    );

    shutdown.cancel();
    Ok(())
}
