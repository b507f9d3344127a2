//! Database error types.

use thiserror::Error;

use crate::fleet::CatalogError;
use crate::store::StoreError;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("no migrations directory found (tried {tried})")]
    MigrationDirNotFound { tried: String },
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

impl From<DbError> for CatalogError {
    fn from(err: DbError) -> Self {
        CatalogError::Unavailable(err.to_string())
    }
}
