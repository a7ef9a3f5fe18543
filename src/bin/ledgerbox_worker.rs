//! ledgerbox-worker: outbox relay and scheduled jobs
//!
//! Delivers committed outbox events to the GL posting consumer and runs the
//! idempotency retention job. Any number of workers can share one database;
//! outbox leases and job locks keep them from doing the same work twice.
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - LEDGERBOX_CONFIG: config file path when no argument is given
//! - LEDGERBOX__<SECTION>__<KEY>: overrides, e.g. LEDGERBOX__STORAGE__PATH
//! - LEDGERBOX_LOG: tracing filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use ledgerbox::config::Config;
use ledgerbox::dispatch::{spawn_relay, Dispatcher};
use ledgerbox::ledger::{GlPostingConsumer, GlPostingEngine};
use ledgerbox::scheduler::{JobRun, JobScheduler};
use ledgerbox::utils::bootstrap::{build_publisher, init_pool, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    let pool = init_pool(&config).await?;

    // The relay delivers whatever the engine's own commands emit.
    let engine = Arc::new(
        GlPostingEngine::new(pool.clone(), &config.ledger)
            .with_publisher(build_publisher(&config, pool.clone(), None)),
    );
    let dispatcher = Arc::new(
        Dispatcher::new(pool.clone(), &config.outbox)
            .with_consumer(Arc::new(GlPostingConsumer::new(engine))),
    );
    let relay = spawn_relay(dispatcher.clone(), config.outbox.poll_interval());

    let scheduler = JobScheduler::new(pool);
    let mut tick = tokio::time::interval(config.scheduler.tick());

    info!(worker_id = dispatcher.worker_id(), "ledgerbox-worker started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                match scheduler.run_retention_cleanup(&config.scheduler).await {
                    Ok(JobRun::Ran(purged)) => info!(purged, "Retention job finished"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Retention job failed"),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    info!("Shutting down");
    relay.shutdown().await;
    Ok(())
}
