//! Database layer for the controller.
//!
//! This module provides:
//! - Connection pool management
//! - [`PgDeclarationStore`]: declarations with conditional writes
//! - [`PgMemberCatalog`]: the member cluster catalog
//!
//! The database layer uses SQLx with Postgres and runtime-checked queries.

mod declarations;
mod error;
mod members;

pub use declarations::PgDeclarationStore;
pub use error::DbError;
pub use members::PgMemberCatalog;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/fleetclass".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// Read `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`,
    /// keeping defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let number = |key: &str, fallback: u32| {
            std::env::var(key)
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(fallback)
        };

        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| defaults.database_url.clone()),
            max_connections: number("DB_MAX_CONNECTIONS", defaults.max_connections),
            min_connections: number("DB_MIN_CONNECTIONS", defaults.min_connections),
            ..defaults
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Apply the controller's migrations.
    ///
    /// The directory is looked up relative to the working directory first so
    /// a deployed binary can ship migrations next to it.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let candidates = [
            PathBuf::from("migrations"),
            PathBuf::from("services/controller/migrations"),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let Some(dir) = candidates.iter().find(|dir| dir.is_dir()) else {
            return Err(DbError::MigrationDirNotFound {
                tried: candidates
                    .iter()
                    .map(|dir| dir.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        };

        let migrator = Migrator::new(dir.as_path())
            .await
            .map_err(DbError::Migration)?;
        info!(
            migrations_dir = %dir.display(),
            pending = migrator.iter().count(),
            "Applying declaration schema"
        );
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        Ok(())
    }

    pub fn declaration_store(&self) -> PgDeclarationStore {
        PgDeclarationStore::new(self.pool.clone())
    }

    pub fn member_catalog(&self) -> PgMemberCatalog {
        PgMemberCatalog::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert!(config.database_url.ends_with("/fleetclass"));
    }
}
