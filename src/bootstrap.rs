use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    chain::{evm::EvmChainClient, ChainClient},
    config::Config,
    error::AppResult,
    ledger::{ClaimStore, LedgerRepository},
    notifications::spawn_outbox,
    settlement::{SettlementEngine, SettlementScheduler},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    // Database pool
    let pool = initialize_database(&config.database_url).await?;
    let store: Arc<dyn ClaimStore> = Arc::new(LedgerRepository::new(pool));

    // Ledger client with the admin signer
    let chain: Arc<dyn ChainClient> = Arc::new(EvmChainClient::try_new(&config.ledger)?);
    info!(
        signer = %chain.signer(),
        contract = %chain.dispatch_contract(),
        "✅ Ledger client initialized"
    );

    // Notification outbox
    if config.notification_webhook_url.is_none() {
        warn!("⚠️  NOTIFICATION_WEBHOOK_URL not set - notifications will only be logged");
    }
    let (notifier, _outbox) = spawn_outbox(config.notification_webhook_url.clone());

    let engine = Arc::new(SettlementEngine::new(
        store.clone(),
        chain,
        notifier,
        config.settlement.clone(),
    ));

    if config.settlement.enabled {
        SettlementScheduler::new(
            engine.clone(),
            Duration::from_secs(config.settlement.interval_secs),
        )
        .start();
        info!(
            interval_secs = config.settlement.interval_secs,
            batch_size = config.settlement.max_batch_size,
            concurrency = config.settlement.concurrency,
            "✅ Settlement scheduler started"
        );
    } else {
        warn!("⚠️  Settlement disabled - only forced runs will settle claims");
    }

    Ok(AppState {
        store,
        engine,
        claims: config.claims.clone(),
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
