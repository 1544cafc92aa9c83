use branchlock::config::AppConfig;
use branchlock::logic::CleanupReaper;
use branchlock::model::SystemClock;
use branchlock::store::PostgresStore;
use log::info;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    info!(
        "Configuration loaded: cleanup every {:?}, max lock lifetime {}s",
        config.locks.cleanup_interval(),
        config.locks.max_lock_lifetime_secs
    );

    info!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let store = PostgresStore::new(
        &database_url,
        config.database.max_connections.unwrap_or(20),
    )
    .await?;
    store.migrate().await?;
    info!("Lock tables ready");

    let reaper = CleanupReaper::standalone(Arc::new(store), &config, Arc::new(SystemClock)).spawn();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    reaper.shutdown().await;

    Ok(())
}
