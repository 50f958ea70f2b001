//! Rebuild `joined_records` once, or on an interval until signalled.
use std::time::Duration;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use sqlx::postgres::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use harvest_common::health::{ComponentStatus, HealthHandle, HealthRegistry};
use harvest_common::metrics::{serve, setup_metrics_routes, status_router};
use harvest_common::pgqueue::connect_pool;
use harvest_common::shutdown::spawn_signal_listener;
use harvest_sync::config::Config;
use harvest_sync::materialize::rebuild;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn sync_loop(
    pool: PgPool,
    liveness: HealthHandle,
    interval_secs: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        if let Err(e) = rebuild(&pool).await {
            error!("sync failed with: {}", e);
        }
        liveness.report_healthy();
    }

    liveness.report_status(ComponentStatus::Finished);
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    let pool = connect_pool(
        &config.database_url,
        config.max_pg_connections,
        "harvest-sync",
    )
    .await?;

    if config.run_once() {
        let rows = rebuild(&pool).await?;
        info!(rows, "sync complete");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let liveness = HealthRegistry::new("liveness");
    let sync_liveness = liveness.register(
        "sync",
        Duration::from_secs(config.sync_interval_secs * 4),
    );

    let router = setup_metrics_routes(status_router(liveness, shutdown.clone()))?;
    let bind = config.bind();
    let http_server = tokio::spawn(async move { serve(router, &bind).await });

    info!(interval_secs = config.sync_interval_secs, "starting periodic sync");
    let sync = tokio::spawn(sync_loop(
        pool,
        sync_liveness,
        config.sync_interval_secs,
        shutdown.clone(),
    ));

    tokio::select! {
        res = sync => {
            if let Err(e) = res {
                error!("sync loop failed with: {}", e);
            }
        }
        res = http_server => {
            error!("http server exited");
            match res {
                Ok(Err(e)) => error!("server failed with: {}", e),
                Err(e) => error!("server task failed with: {}", e),
                Ok(Ok(())) => {}
            }
            shutdown.cancel();
        }
    }

    info!("exiting");
    Ok(())
}
