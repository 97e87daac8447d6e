mod config;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use tessera_auth::{
    InMemoryRefreshTokenRepository, InMemorySigningKeyStore, RefreshTokenStore, SigningKeyring,
};
use tessera_core::{Clock, SystemClock};
use tessera_events::InMemoryEventBus;
use tessera_infra::jobs::{
    InMemoryRecurringJobStore, JobScheduler, MaintenanceJobs, register_maintenance_jobs,
};
use tessera_infra::outbox::{InMemoryDatabase, OutboxProcessor, OutboxStore, PostgresOutboxStore};

use crate::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    tessera_observability::init(config.log_format);
    info!(environment = %config.environment, "tessera starting");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let keyring = Arc::new(SigningKeyring::open(
        Arc::new(InMemorySigningKeyStore::new()),
        clock.clone(),
        config.auth.clone(),
    )?);
    let refresh_tokens = Arc::new(RefreshTokenStore::new(
        Arc::new(InMemoryRefreshTokenRepository::new()),
        clock.clone(),
        &config.auth,
    ));

    let outbox_store: Arc<dyn OutboxStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            let store = PostgresOutboxStore::new(pool)?;
            store.migrate().await?;
            info!("postgres outbox ready");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; outbox is in-memory and lost on exit");
            InMemoryDatabase::arc(())
        }
    };

    let outbox = Arc::new(OutboxProcessor::new(
        outbox_store,
        Arc::new(InMemoryEventBus::new()),
        clock.clone(),
        config.outbox.clone(),
    ));

    let scheduler = Arc::new(JobScheduler::new(
        InMemoryRecurringJobStore::arc(),
        clock.clone(),
        config.scheduler.clone(),
    ));
    let jobs = register_maintenance_jobs(
        &scheduler,
        MaintenanceJobs {
            outbox,
            keyring: keyring.clone(),
            refresh_tokens,
            clock,
        },
    )?;
    let handle = Arc::clone(&scheduler).spawn()?;
    info!(
        jobs = jobs.len(),
        signing_key = %keyring.current_key().id,
        "scheduler running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested; waiting for running jobs");

    // Joining blocks; keep it off the async workers.
    tokio::task::spawn_blocking(move || handle.shutdown()).await?;
    info!("tessera stopped");
    Ok(())
}
