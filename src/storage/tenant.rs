//! Tenant-scoped transactional context.
//!
//! A [`TenantTx`] is the only handle through which commands, consumers and the
//! ledger touch tenant data. The tenant is fixed when the transaction begins and
//! every statement this crate issues through it stamps or filters `tenant_id`
//! with that value.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteQueryResult, SqliteRow};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;

use super::Result;

/// Identifier of the tenant owning a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A database transaction bound to one tenant.
///
/// Dropping a `TenantTx` without calling [`TenantTx::commit`] rolls it back.
pub struct TenantTx<'c> {
    tenant: TenantId,
    tx: Transaction<'c, Sqlite>,
}

impl TenantTx<'static> {
    /// Begin a new top-level transaction for `tenant`.
    pub async fn begin(pool: &SqlitePool, tenant: TenantId) -> Result<Self> {
        let tx = pool.begin().await?;
        debug!(tenant_id = %tenant, "Transaction started");
        Ok(Self { tenant, tx })
    }
}

impl<'c> TenantTx<'c> {
    /// Tenant this transaction is scoped to.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Raw connection for statements that need bound parameters.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Execute a rendered statement.
    pub async fn execute(&mut self, sql: &str) -> Result<SqliteQueryResult> {
        Ok(sqlx::query(sql).execute(&mut *self.tx).await?)
    }

    pub async fn fetch_optional(&mut self, sql: &str) -> Result<Option<SqliteRow>> {
        Ok(sqlx::query(sql).fetch_optional(&mut *self.tx).await?)
    }

    pub async fn fetch_all(&mut self, sql: &str) -> Result<Vec<SqliteRow>> {
        Ok(sqlx::query(sql).fetch_all(&mut *self.tx).await?)
    }

    /// Open a savepoint-backed sub-transaction for the same tenant.
    ///
    /// Rolling back (or dropping) the nested context undoes only the work done
    /// through it; the outer transaction stays usable.
    pub async fn nested(&mut self) -> Result<TenantTx<'_>> {
        let tx = sqlx::Connection::begin(&mut *self.tx).await?;
        Ok(TenantTx {
            tenant: self.tenant.clone(),
            tx,
        })
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        debug!(tenant_id = %self.tenant, "Transaction committed");
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        debug!(tenant_id = %self.tenant, "Transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::Row;

    use super::*;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE items (tenant_id TEXT NOT NULL, name TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    async fn count(pool: &SqlitePool) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM items")
            .fetch_one(pool)
            .await
            .unwrap()
            .get("n")
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let pool = pool().await;
        {
            let mut tx = TenantTx::begin(&pool, TenantId::from("t1")).await.unwrap();
            tx.execute("INSERT INTO items VALUES ('t1', 'a')")
                .await
                .unwrap();
        }
        assert_eq!(count(&pool).await, 0);
    }

    #[tokio::test]
    async fn test_nested_rollback_keeps_outer_work() {
        let pool = pool().await;
        let mut tx = TenantTx::begin(&pool, TenantId::from("t1")).await.unwrap();
        tx.execute("INSERT INTO items VALUES ('t1', 'outer')")
            .await
            .unwrap();

        {
            let mut inner = tx.nested().await.unwrap();
            assert_eq!(inner.tenant().as_str(), "t1");
            inner
                .execute("INSERT INTO items VALUES ('t1', 'inner')")
                .await
                .unwrap();
            inner.rollback().await.unwrap();
        }

        let rows = tx.fetch_all("SELECT name FROM items").await.unwrap();
        assert_eq!(rows.len(), 1);
        tx.commit().await.unwrap();
        assert_eq!(count(&pool).await, 1);
    }

    #[tokio::test]
    async fn test_nested_commit_is_visible_after_outer_commit() {
        let pool = pool().await;
        let mut tx = TenantTx::begin(&pool, TenantId::from("t1")).await.unwrap();
        {
            let mut inner = tx.nested().await.unwrap();
            inner
                .execute("INSERT INTO items VALUES ('t1', 'inner')")
                .await
                .unwrap();
            inner.commit().await.unwrap();
        }
        tx.commit().await.unwrap();
        assert_eq!(count(&pool).await, 1);
    }
}
