//! Shared building blocks for the marketplace services
//!
//! Database pool construction, the versioned schema migrations and the
//! seller subscription tier used by every crate in the workspace.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create the connection pool used for regular queries
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Create a small pool with generous timeouts for running migrations
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(60))
        .connect(database_url)
        .await
}

/// Apply all pending schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Seller subscription tier
///
/// The tier decides the platform fee taken from every sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellerTier {
    #[default]
    Free,
    Starter,
    Pro,
}

impl SellerTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SellerTier::Free => "free",
            SellerTier::Starter => "starter",
            SellerTier::Pro => "pro",
        }
    }

    /// Platform fee in basis points (1/100 of a percent)
    pub fn platform_fee_bps(&self) -> u32 {
        match self {
            SellerTier::Free => 1200,
            SellerTier::Starter => 1000,
            SellerTier::Pro => 800,
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, SellerTier::Free)
    }
}

impl std::fmt::Display for SellerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown seller tier: {0}")]
pub struct UnknownTier(pub String);

impl std::str::FromStr for SellerTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(SellerTier::Free),
            "starter" => Ok(SellerTier::Starter),
            "pro" => Ok(SellerTier::Pro),
            other => Err(UnknownTier(other.to_string())),
        }
    }
}
