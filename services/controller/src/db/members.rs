//! Postgres member catalog.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleetclass_api::Member;
use fleetclass_names::MemberId;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use super::DbError;
use crate::fleet::{CatalogError, MemberCatalog};

struct MemberRow {
    namespace: String,
    name: String,
    labels: BTreeMap<String, String>,
    api_url: String,
}

impl<'r> sqlx::FromRow<'r, PgRow> for MemberRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let Json(labels) = row.try_get("labels")?;
        Ok(Self {
            namespace: row.try_get("namespace")?,
            name: row.try_get("name")?,
            labels,
            api_url: row.try_get("api_url")?,
        })
    }
}

impl TryFrom<MemberRow> for Member {
    type Error = CatalogError;

    fn try_from(row: MemberRow) -> Result<Self, Self::Error> {
        let id = MemberId::new(&row.namespace, &row.name)
            .map_err(|e| CatalogError::InvalidEntry(e.to_string()))?;
        Ok(Member {
            id,
            labels: row.labels,
            api_url: row.api_url,
        })
    }
}

/// Member catalog backed by the `members` table.
#[derive(Clone)]
pub struct PgMemberCatalog {
    pool: PgPool,
}

impl PgMemberCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a member or replace its labels and endpoint.
    pub async fn upsert(&self, member: &Member) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO members (namespace, name, labels, api_url)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (namespace, name)
            DO UPDATE SET labels = EXCLUDED.labels, api_url = EXCLUDED.api_url, updated_at = now()
            "#,
        )
        .bind(member.id.namespace())
        .bind(member.id.name())
        .bind(Json(&member.labels))
        .bind(&member.api_url)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }

    /// Remove a member. Returns false if it was not registered.
    pub async fn remove(&self, id: &MemberId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM members WHERE namespace = $1 AND name = $2")
            .bind(id.namespace())
            .bind(id.name())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MemberCatalog for PgMemberCatalog {
    async fn list_members(&self) -> Result<Vec<Member>, CatalogError> {
        let rows = sqlx::query_as::<_, MemberRow>(
            r#"
            SELECT namespace, name, labels, api_url
            FROM members
            ORDER BY namespace, name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        rows.into_iter().map(Member::try_from).collect()
    }
}
