//! Card Ledger Webhooks - Main Application Entry Point
//!
//! This is a webhook receiver that keeps card and card-user balances in step with a card issuing provider. It authorizes spends, applies spend and deposit ledger events exactly once, and tracks card, user and contract updates.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx (async queries)
//! - **Concurrency**: distributed lock per transaction and card, PostgreSQL advisory locks by default
//! - **Authentication**: HMAC-SHA256 body signature from the provider
//! - **Format**: JSON requests/responses
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool
//! 3. Run database migrations
//! 4. Wire store, lock, provider client, notifier and reconciliation engine
//! 5. Start the unsettled fee sweep
//! 6. Build HTTP router and start server on configured port

mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;

#[cfg(test)]
mod test_support;

use std::{sync::Arc, time::Duration};

use tracing_subscriber::EnvFilter;

use crate::{
    config::{Config, LockBackend},
    db::{EntityStore, postgres::PgStore},
    handlers::AppState,
    services::{
        lock::{DistributedLock, LocalLock, PgAdvisoryLock},
        notifications::{LogNotifier, Notifier, WebhookNotifier},
        profiles::ProfileService,
        provider::HttpCardProvider,
        reconciliation::ReconciliationEngine,
        router::EventRouter,
    },
};

/// Unsettled fee lines picked up per sweep.
const FEE_RETRY_BATCH: i64 = 100;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with tracing subscriber. Reads RUST_LOG environment variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let store: Arc<dyn EntityStore> = Arc::new(PgStore::new(pool.clone()));

    let lock: Arc<dyn DistributedLock> = match config.lock_backend {
        LockBackend::Postgres => Arc::new(PgAdvisoryLock::new(pool.clone(), config.lock_wait())),
        LockBackend::Local => {
            tracing::warn!("Using in-process locks; run a single instance only");
            Arc::new(LocalLock::new())
        }
    };

    let provider = Arc::new(HttpCardProvider::new(
        &config.provider_api_url,
        &config.provider_api_key,
    )?);

    let notifier: Arc<dyn Notifier> = match &config.notification_url {
        Some(url) => Arc::new(WebhookNotifier::new(url, config.notification_secret.clone())?),
        None => {
            tracing::info!("NOTIFICATION_URL not set, notifications are logged only");
            Arc::new(LogNotifier)
        }
    };

    let engine = Arc::new(ReconciliationEngine::new(
        store.clone(),
        lock,
        provider,
        notifier,
        config.fee_schedule(),
        config.engine_settings(),
    ));

    if let Some(period) = config.fee_retry_interval() {
        spawn_fee_sweep(engine.clone(), period);
    }

    let router = EventRouter::new(engine, ProfileService::new(store.clone()));

    let app = handlers::routes(AppState {
        store,
        router: Arc::new(router),
        signing_secret: Arc::from(config.webhook_signing_secret.as_str()),
    });

    // Bind to network address and start server
    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Start serving HTTP requests
    // This blocks forever, handling requests concurrently with tokio
    axum::serve(listener, app).await?;

    Ok(())
}

/// Retry fee charges that failed after commit, every `period`.
fn spawn_fee_sweep(engine: Arc<ReconciliationEngine>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match engine.fees().retry_unsettled(FEE_RETRY_BATCH).await {
                Ok(summary) if summary.attempted > 0 => tracing::info!(
                    attempted = summary.attempted,
                    settled = summary.settled,
                    failed = summary.failed,
                    "Unsettled fee sweep finished"
                ),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Unsettled fee sweep failed"),
            }
        }
    });
}
