//! Query engine abstraction.
//!
//! The planner never talks to a database itself. A [`QueryEngine`] executes
//! row plans and count queries; the PostgreSQL implementation renders them
//! with SeaQuery and runs them through sqlx.
//!
//! Engines must return one row per root record, nested by association:
//! to-one associations as mappings, collection associations as lists of
//! mappings. [`hydrate`] builds that shape from flat joined rows.

pub mod hydrate;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;

pub use hydrate::hydrate;
pub use postgres::PgQueryEngine;

use crate::plan::types::{CountQuery, QueryPlan};

/// One result row.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Executes plans built by the planner.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Fetch the rows of one page.
    async fn fetch_rows(&self, plan: &QueryPlan) -> Result<Vec<Row>>;

    /// Count distinct root records.
    async fn count(&self, query: &CountQuery) -> Result<u64>;
}
