use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use migration::MigratorTrait;
use sea_orm::ConnectOptions;
use sea_orm::Database;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use token_ledger::config::LedgerConfig;
use token_ledger::http;
use token_ledger::ledger::{BalanceFeed, LedgerService, PgLedgerStore};
use token_ledger::state::{AppState, CheckoutCatalog};
use token_ledger::stripe::{StripeClient, WebhookVerifier};
use token_ledger::webhook::{
    WebhookProcessor, WebhookSettings, recent_events_cache, webhook_channel,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = LedgerConfig::load().context("Failed to load configuration")?;
    let database = connect_database(&config).await?;
    run_migrations(&database).await?;

    let store = Arc::new(PgLedgerStore::new(database));
    let ledger = LedgerService::new(
        store,
        Arc::new(BalanceFeed::default()),
        config.ledger.signup_bonus,
    );

    let verifier = WebhookVerifier::new(
        &config.stripe.webhook_secret,
        config.stripe.signature_tolerance(),
    )
    .context("Failed to initialize webhook verifier")?;
    let stripe_client = StripeClient::new(
        &config.stripe.api_base,
        &config.stripe.secret_key,
        config.stripe.request_timeout(),
    )
    .context("Failed to initialize Stripe client")?;

    let processor = WebhookProcessor::new(
        ledger.clone(),
        recent_events_cache(
            config.cache.recent_events_max_capacity,
            config.cache.recent_events_ttl(),
        ),
        WebhookSettings::new(config.webhook.max_attempts, config.webhook.retry_backoff()),
    );
    let (queue, worker) = webhook_channel(processor, config.webhook.queue_capacity);

    let app_state = AppState::new(
        ledger,
        verifier,
        Arc::new(stripe_client),
        CheckoutCatalog::from_config(&config),
        queue.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let listener = TcpListener::bind(config.server.address())
        .await
        .context("Failed to bind HTTP listener")?;
    let local_addr = listener
        .local_addr()
        .context("Failed to obtain listener address")?;
    info!("Token ledger listening on {local_addr}");

    let streams = app_state.clone();
    let router: Router = http::router(app_state);
    let server = axum::serve(listener, router.into_make_service());
    let served = server
        .with_graceful_shutdown(shutdown_signal(streams))
        .await
        .context("HTTP server exited with error");

    // No handler can enqueue any more; drain the queue, then the overflow tasks.
    shutdown_tx.send(true).ok();
    if let Err(join_err) = worker_handle.await {
        error!("Webhook worker join error: {join_err}");
    }
    queue.wait_detached().await;
    info!("Webhook processing settled");
    served?;

    Ok(())
}

fn init_tracing() {
    let default_filter = "info";
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    assert!(!filter.is_empty(), "Tracing filter must not be empty");
    assert!(filter.len() < 256, "Tracing filter length exceeds bounds");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .compact()
        .init();
}

async fn connect_database(config: &LedgerConfig) -> Result<sea_orm::DatabaseConnection> {
    let mut options = ConnectOptions::new(config.database.url.clone());
    options
        .max_connections(config.database.max_connections)
        .sqlx_logging(true)
        .sqlx_logging_level(tracing::log::LevelFilter::Debug)
        .acquire_timeout(Duration::from_secs(10));

    if let Some(min) = config.database.min_connections {
        options.min_connections(min);
    }

    assert!(
        config.database.max_connections >= config.database.min_connections.unwrap_or(1),
        "Max connections must be >= min connections"
    );
    assert!(
        config.database.max_connections <= 128,
        "Connection pool oversized"
    );

    Database::connect(options)
        .await
        .context("Failed to connect to PostgreSQL")
}

async fn run_migrations(database: &sea_orm::DatabaseConnection) -> Result<()> {
    migration::Migrator::up(database, None)
        .await
        .context("Database migrations failed")
}

async fn shutdown_signal(state: AppState) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    state.close_streams();
    info!("Shutdown signal received; finishing in-flight requests");
}
