//! PostgreSQL query engine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{QueryEngine, Row, hydrate};
use crate::plan::render;
use crate::plan::types::{CountQuery, QueryPlan};

/// Runs plans against PostgreSQL.
///
/// Each statement runs in its own transaction with `SET LOCAL
/// statement_timeout`, so the timeout resets on commit or rollback.
#[derive(Clone)]
pub struct PgQueryEngine {
    pool: PgPool,
    statement_timeout_secs: u64,
}

impl PgQueryEngine {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            statement_timeout_secs: 10,
        }
    }

    /// Connect a small pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Per-statement timeout in seconds; 0 disables it.
    pub fn with_statement_timeout(mut self, secs: u64) -> Self {
        self.statement_timeout_secs = secs;
        self
    }

    fn timeout_sql(&self) -> Option<String> {
        (self.statement_timeout_secs > 0).then(|| {
            format!(
                "SET LOCAL statement_timeout = '{}s'",
                self.statement_timeout_secs
            )
        })
    }
}

#[async_trait]
impl QueryEngine for PgQueryEngine {
    async fn fetch_rows(&self, plan: &QueryPlan) -> Result<Vec<Row>> {
        let sql = render::row_query(plan)?;
        tracing::debug!(sql = %sql, "executing row query");

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        if let Some(timeout) = self.timeout_sql() {
            sqlx::query(&timeout)
                .execute(&mut *tx)
                .await
                .context("failed to set statement timeout")?;
        }

        let rows: Vec<serde_json::Value> =
            sqlx::query_scalar(&format!("SELECT row_to_json(t) FROM ({sql}) t"))
                .fetch_all(&mut *tx)
                .await
                .context("failed to execute row query")?;

        tx.commit()
            .await
            .context("failed to commit query transaction")?;

        let flat: Vec<Row> = rows
            .into_iter()
            .filter_map(|row| match row {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        Ok(hydrate(plan, flat))
    }

    async fn count(&self, query: &CountQuery) -> Result<u64> {
        let sql = render::count_query(query)?;
        tracing::debug!(sql = %sql, "executing count query");

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin transaction")?;

        if let Some(timeout) = self.timeout_sql() {
            sqlx::query(&timeout)
                .execute(&mut *tx)
                .await
                .context("failed to set statement timeout")?;
        }

        let total: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&mut *tx)
            .await
            .context("failed to execute count query")?;

        tx.commit()
            .await
            .context("failed to commit query transaction")?;

        Ok(u64::try_from(total).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_statement() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/datagrid")
            .unwrap_or_else(|e| panic!("lazy pool: {e}"));
        let engine = PgQueryEngine::new(pool);
        assert_eq!(
            engine.timeout_sql().as_deref(),
            Some("SET LOCAL statement_timeout = '10s'")
        );
        assert!(engine.with_statement_timeout(0).timeout_sql().is_none());
    }
}
