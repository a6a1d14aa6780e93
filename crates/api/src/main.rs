//! Marketplace API Server
//!
//! Receives payment webhooks and runs them through the settlement pipeline.

use std::net::SocketAddr;

use market_api::{routes::create_router, AppState, Config};
use market_settlement::Settlement;
use market_shared::{create_migration_pool, create_pool, run_migrations};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,market_api=debug,market_settlement=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Marketplace API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        // Direct URL bypasses PgBouncer
        let migration_pool = create_migration_pool(config.migration_url()).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    let settlement = Settlement::from_env(pool)?;
    tracing::info!("Settlement pipeline initialized");

    let addr: SocketAddr = config.bind_address.parse()?;
    let app = create_router(AppState::new(config, settlement));

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
