use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use tenant_migrator::app::{router, AppState};
use tenant_migrator::config;
use tenant_migrator::database::{DatabaseManager, PgDatastoreProvider, PgSystemStore};
use tenant_migrator::is_production;
use tenant_migrator::middleware::RoleGate;
use tenant_migrator::services::{MigrationOrchestrator, PgAuditSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present so cargo run picks up DATABASE_URL, JWT_SECRET, etc.
    let _ = dotenvy::dotenv();

    // Initialize configuration (this loads the config singleton)
    let config = config::config();

    let default_filter = if config.api.enable_request_logging {
        "info,tower_http=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!("Starting tenant migrator in {:?} mode", config.environment);

    if config.security.jwt_secret.is_empty() {
        anyhow::bail!("JWT_SECRET must be set");
    }
    if is_production!() && config.security.cors_origins.iter().any(|o| o == "*") {
        tracing::warn!("CORS allows any origin in production");
    }

    let manager = DatabaseManager::new(config.database.clone());
    let shared = manager.shared_location()?;
    let system_pool = manager
        .system_pool()
        .await
        .context("failed to connect to the system database")?;

    let store = Arc::new(PgSystemStore::new(system_pool.clone(), shared.clone()));
    store
        .ensure_schema()
        .await
        .context("failed to prepare the system schema")?;

    let orchestrator = Arc::new(MigrationOrchestrator::new(
        store.clone(),
        store,
        Arc::new(PgDatastoreProvider::new(manager.clone())),
        Arc::new(PgAuditSink::new(system_pool)),
        shared,
        config.migration.clone(),
    )?);
    tracing::info!(
        "Migrating {} collections per organization",
        orchestrator.catalog().len()
    );

    let app = router(AppState {
        orchestrator: orchestrator.clone(),
        gate: Arc::new(RoleGate::default()),
        security: config.security.clone(),
        database: Some(manager.clone()),
    });

    let bind_addr = format!("0.0.0.0:{}", config.api.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    tracing::info!("Tenant migrator listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    orchestrator.shutdown().await;
    manager.close_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
