//! Postgres declaration store.
//!
//! Each declaration is one row: the full body as JSONB plus a
//! `resource_version` that is bumped on every write. Conditional updates lock
//! the row, compare the version, and write back with
//! `WHERE resource_version = $expected` as a second guard.

use async_trait::async_trait;
use chrono::Utc;
use fleetclass_api::{Declaration, DeclarationStatus, VersionToken};
use fleetclass_names::DeclarationName;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use tracing::debug;

use super::DbError;
use crate::store::{
    ready_for_removal, DeclarationPatch, DeclarationStore, DeleteOutcome, StoreError,
    StoredDeclaration, UpdateOutcome,
};

fn query_err(err: sqlx::Error) -> StoreError {
    DbError::Query(err).into()
}

fn from_row(row: &PgRow) -> Result<StoredDeclaration, StoreError> {
    let version: i64 = row.try_get("resource_version").map_err(query_err)?;
    let Json(declaration): Json<Declaration> = row
        .try_get("body")
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(StoredDeclaration {
        declaration,
        version: VersionToken::new(version),
    })
}

/// Declaration store backed by the `declarations` table.
#[derive(Clone)]
pub struct PgDeclarationStore {
    pool: PgPool,
}

impl PgDeclarationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_row(
        tx: &mut Transaction<'_, Postgres>,
        name: &DeclarationName,
    ) -> Result<StoredDeclaration, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT resource_version, body
            FROM declarations
            WHERE name = $1
            FOR UPDATE
            "#,
        )
        .bind(name.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(query_err)?
        .ok_or_else(|| StoreError::NotFound(name.clone()))?;

        from_row(&row)
    }

    async fn write_row(
        tx: &mut Transaction<'_, Postgres>,
        declaration: &Declaration,
        expected: VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE declarations
            SET body = $2,
                generation = $3,
                resource_version = resource_version + 1,
                updated_at = now()
            WHERE name = $1 AND resource_version = $4
            RETURNING resource_version
            "#,
        )
        .bind(declaration.name().as_str())
        .bind(Json(declaration))
        .bind(declaration.generation())
        .bind(expected.value())
        .fetch_optional(&mut **tx)
        .await
        .map_err(query_err)?;

        version.map(VersionToken::new).ok_or_else(|| StoreError::Conflict {
            name: declaration.name().clone(),
            expected,
            actual: expected.next(),
        })
    }

    async fn remove_row(
        tx: &mut Transaction<'_, Postgres>,
        name: &DeclarationName,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM declarations WHERE name = $1")
            .bind(name.as_str())
            .execute(&mut **tx)
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[async_trait]
impl DeclarationStore for PgDeclarationStore {
    async fn get(&self, name: &DeclarationName) -> Result<Option<StoredDeclaration>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT resource_version, body
            FROM declarations
            WHERE name = $1
            "#,
        )
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        row.as_ref().map(from_row).transpose()
    }

    async fn list_names(&self) -> Result<Vec<DeclarationName>, StoreError> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM declarations ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(query_err)?;

        names
            .iter()
            .map(|n| DeclarationName::parse(n).map_err(|e| StoreError::Corrupt(e.to_string())))
            .collect()
    }

    async fn create(&self, declaration: Declaration) -> Result<StoredDeclaration, StoreError> {
        let mut declaration = declaration;
        declaration.meta.generation = 1;
        declaration.meta.deletion_requested_at = None;
        declaration.status = DeclarationStatus::default();

        let inserted = sqlx::query(
            r#"
            INSERT INTO declarations (name, resource_version, generation, body)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(declaration.name().as_str())
        .bind(VersionToken::INITIAL.value())
        .bind(declaration.generation())
        .bind(Json(&declaration))
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(declaration.name().clone()));
        }

        Ok(StoredDeclaration {
            declaration,
            version: VersionToken::INITIAL,
        })
    }

    async fn update(
        &self,
        name: &DeclarationName,
        patch: &DeclarationPatch,
        expected: VersionToken,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let mut stored = Self::lock_row(&mut tx, name).await?;

        if stored.version != expected {
            return Err(StoreError::Conflict {
                name: name.clone(),
                expected,
                actual: stored.version,
            });
        }

        patch.apply_to(&mut stored.declaration);

        if ready_for_removal(&stored.declaration) {
            Self::remove_row(&mut tx, name).await?;
            tx.commit().await.map_err(query_err)?;
            debug!(declaration = %name, "Last finalizer removed, declaration deleted");
            return Ok(UpdateOutcome::Removed);
        }

        stored.version = Self::write_row(&mut tx, &stored.declaration, expected).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(UpdateOutcome::Updated(stored))
    }

    async fn delete(&self, name: &DeclarationName) -> Result<DeleteOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let mut stored = Self::lock_row(&mut tx, name).await?;

        if stored.declaration.meta.finalizers.is_empty() {
            Self::remove_row(&mut tx, name).await?;
            tx.commit().await.map_err(query_err)?;
            return Ok(DeleteOutcome::Removed);
        }

        if stored.declaration.meta.deletion_requested_at.is_none() {
            stored.declaration.meta.deletion_requested_at = Some(Utc::now());
            stored.version = Self::write_row(&mut tx, &stored.declaration, stored.version).await?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(DeleteOutcome::Pending(stored))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }
}
