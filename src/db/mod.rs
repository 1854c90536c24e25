//! Database connection management and repositories
//!
//! All state transitions go through atomic CAS updates
//! (`UPDATE ... WHERE status = <expected>`); callers inspect
//! `rows_affected` instead of racing a read-modify-write. No repository
//! method holds a connection across an exchange network call.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;

pub mod failed_orders;
pub mod orders;
pub mod strategies;
pub mod trades;

pub use failed_orders::FailedOrderRepo;
pub use orders::{OrderContext, OrderRepo, PendingOrderRepo};
pub use strategies::{AccountRepo, StrategyAccountRepo, StrategyRepo};
pub use trades::TradeRepo;

/// Database layer error
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Conflicting state transition: {0}")]
    Conflict(String),
}

/// PostgreSQL database connection pool
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let max_connections = std::env::var("PG_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        tracing::info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
