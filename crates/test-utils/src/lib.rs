//! Datagrid test utilities.
//!
//! Helpers for integration testing: a shop schema fixture, a builder for
//! DataTables request parameters, and an in-memory query engine that
//! records every plan it is asked to run.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use datagrid_kernel::engine::{QueryEngine, Row};
use datagrid_kernel::plan::types::{CountQuery, QueryPlan};
use datagrid_kernel::schema::{Association, EntityMetadata, JoinTable, SchemaCatalog};

/// Schema used across the integration tests.
///
/// ```text
/// Order ─customer→ Customer ─location→ Location
///   └─lines→ [OrderLine] ─product→ Product ─tags→ [Tag] (product_tag)
/// Employee ─manager→ Employee, ─mentor→ Employee, ─department→ Department ─head→ Employee
/// ```
pub fn shop_schema() -> SchemaCatalog {
    SchemaCatalog::new()
        .with_namespace("Shop", "App\\Shop")
        .with_entity(
            EntityMetadata::new("Order", "orders")
                .with_fields(&["reference", "placedAt", "status"])
                .with_association(Association::many_to_one("customer", "Customer", "customer_id"))
                .with_association(Association::one_to_many("lines", "OrderLine", "order_id")),
        )
        .with_entity(
            EntityMetadata::new("Customer", "customer")
                .with_fields(&["name", "email", "tenantId"])
                .with_association(Association::many_to_one("location", "Location", "location_id")),
        )
        .with_entity(
            EntityMetadata::new("Location", "location")
                .with_fields(&["address", "city"])
                .with_column("address", "street_address"),
        )
        .with_entity(
            EntityMetadata::new("OrderLine", "order_line")
                .with_fields(&["quantity", "amount"])
                .with_association(Association::many_to_one("product", "Product", "product_id")),
        )
        .with_entity(
            EntityMetadata::new("Product", "product")
                .with_fields(&["name", "sku"])
                .with_association(Association::many_to_many(
                    "tags",
                    "Tag",
                    JoinTable {
                        table: "product_tag".to_string(),
                        source_column: "product_id".to_string(),
                        target_column: "tag_id".to_string(),
                    },
                )),
        )
        .with_entity(EntityMetadata::new("Tag", "tag").with_fields(&["label"]))
        .with_entity(
            EntityMetadata::new("Employee", "employee")
                .with_fields(&["name", "title"])
                .with_association(Association::many_to_one("manager", "Employee", "manager_id"))
                .with_association(Association::many_to_one("mentor", "Employee", "mentor_id"))
                .with_association(Association::many_to_one(
                    "department",
                    "Department",
                    "department_id",
                )),
        )
        .with_entity(
            EntityMetadata::new("Department", "department")
                .with_fields(&["name"])
                .with_association(Association::many_to_one("head", "Employee", "head_id")),
        )
        .with_entity(
            EntityMetadata::new("App\\Shop\\Invoice", "invoice").with_fields(&["number"]),
        )
}

/// Builder for DataTables request parameters.
#[derive(Debug, Clone)]
pub struct RequestParams {
    columns: Vec<TestColumn>,
    echo: Option<String>,
    start: Option<u64>,
    length: Option<i64>,
    search: Option<String>,
    sorts: Vec<(usize, String)>,
    extra: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct TestColumn {
    path: String,
    searchable: bool,
    sortable: bool,
    search: String,
}

/// Start a request over the given column paths.
pub fn request(paths: &[&str]) -> RequestParams {
    RequestParams {
        columns: paths
            .iter()
            .map(|p| TestColumn {
                path: p.to_string(),
                searchable: true,
                sortable: true,
                search: String::new(),
            })
            .collect(),
        echo: None,
        start: None,
        length: None,
        search: None,
        sorts: Vec::new(),
        extra: Vec::new(),
    }
}

impl RequestParams {
    pub fn echo(mut self, echo: i64) -> Self {
        self.echo = Some(echo.to_string());
        self
    }

    /// Set `iDisplayStart` and `iDisplayLength`.
    pub fn page(mut self, start: u64, length: i64) -> Self {
        self.start = Some(start);
        self.length = Some(length);
        self
    }

    /// Set the global search string.
    pub fn search(mut self, value: &str) -> Self {
        self.search = Some(value.to_string());
        self
    }

    /// Set the search string of one column.
    pub fn column_search(mut self, index: usize, value: &str) -> Self {
        if let Some(column) = self.columns.get_mut(index) {
            column.search = value.to_string();
        }
        self
    }

    pub fn not_searchable(mut self, index: usize) -> Self {
        if let Some(column) = self.columns.get_mut(index) {
            column.searchable = false;
        }
        self
    }

    pub fn not_sortable(mut self, index: usize) -> Self {
        if let Some(column) = self.columns.get_mut(index) {
            column.sortable = false;
        }
        self
    }

    /// Append a sort directive.
    pub fn sort(mut self, column: usize, direction: &str) -> Self {
        self.sorts.push((column, direction.to_string()));
        self
    }

    /// Set a raw parameter, overriding anything the builder generates.
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.extra.push((key.to_string(), value.to_string()));
        self
    }

    /// Parameters for client-declared mode.
    pub fn build(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert("iColumns".to_string(), self.columns.len().to_string());
        for (i, column) in self.columns.iter().enumerate() {
            params.insert(format!("mDataProp_{i}"), column.path.clone());
            params.insert(format!("bSearchable_{i}"), column.searchable.to_string());
            params.insert(format!("bSortable_{i}"), column.sortable.to_string());
            params.insert(format!("sSearch_{i}"), column.search.clone());
        }
        if let Some(echo) = &self.echo {
            params.insert("sEcho".to_string(), echo.clone());
        }
        if let Some(start) = self.start {
            params.insert("iDisplayStart".to_string(), start.to_string());
        }
        if let Some(length) = self.length {
            params.insert("iDisplayLength".to_string(), length.to_string());
        }
        if let Some(search) = &self.search {
            params.insert("sSearch".to_string(), search.clone());
        }
        if !self.sorts.is_empty() {
            params.insert("iSortingCols".to_string(), self.sorts.len().to_string());
        }
        for (i, (column, direction)) in self.sorts.iter().enumerate() {
            params.insert(format!("iSortCol_{i}"), column.to_string());
            params.insert(format!("sSortDir_{i}"), direction.clone());
        }
        for (key, value) in &self.extra {
            params.insert(key.clone(), value.clone());
        }
        params
    }

    /// Parameters for server-declared mode: every mandatory key is present.
    pub fn build_server(&self) -> HashMap<String, String> {
        let mut params = self.build();
        params.entry("sEcho".to_string()).or_insert_with(|| "1".to_string());
        params
            .entry("iDisplayStart".to_string())
            .or_insert_with(|| "0".to_string());
        params
            .entry("iDisplayLength".to_string())
            .or_insert_with(|| "-1".to_string());
        params
            .entry("iSortingCols".to_string())
            .or_insert_with(|| "0".to_string());
        params
    }
}

/// A query engine that serves canned results and records what it was asked.
#[derive(Default)]
pub struct MemoryEngine {
    rows: Vec<Row>,
    total: u64,
    filtered: u64,
    failure: Option<String>,
    plans: Mutex<Vec<QueryPlan>>,
    counts: Mutex<Vec<CountQuery>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows returned by every row query. Each value must be a JSON object.
    pub fn with_rows(mut self, rows: Vec<Value>) -> Self {
        self.rows = rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self
    }

    /// Results of the total and filtered count queries, in that order.
    pub fn with_counts(mut self, total: u64, filtered: u64) -> Self {
        self.total = total;
        self.filtered = filtered;
        self
    }

    /// Fail every call with `message`.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Row plans received so far.
    pub fn plans(&self) -> Vec<QueryPlan> {
        self.plans.lock().clone()
    }

    /// Count queries received so far.
    pub fn counts(&self) -> Vec<CountQuery> {
        self.counts.lock().clone()
    }

    fn check(&self) -> Result<()> {
        match &self.failure {
            Some(message) => anyhow::bail!("{message}"),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl QueryEngine for MemoryEngine {
    async fn fetch_rows(&self, plan: &QueryPlan) -> Result<Vec<Row>> {
        self.plans.lock().push(plan.clone());
        self.check()?;
        Ok(self.rows.clone())
    }

    async fn count(&self, query: &CountQuery) -> Result<u64> {
        let mut counts = self.counts.lock();
        counts.push(query.clone());
        self.check()?;
        // The orchestrator asks for the total first, then the filtered count.
        Ok(if counts.len() % 2 == 1 {
            self.total
        } else {
            self.filtered
        })
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use datagrid_kernel::SchemaMetadata;
    use serde_json::json;

    use super::*;

    #[test]
    fn shop_schema_is_consistent() {
        let schema = shop_schema();
        assert!(schema.validate().is_empty(), "{:?}", schema.validate());
        assert!(schema.is_collection_association("Order", "lines"));
        assert!(schema.is_collection_association("Product", "tags"));
        assert!(schema.resolve_entity("Shop:Invoice").is_some());
    }

    #[test]
    fn request_params_builder() {
        let params = request(&["id", "customer.name"])
            .echo(3)
            .page(10, 5)
            .search("acme")
            .column_search(1, "bob")
            .not_sortable(0)
            .sort(1, "desc")
            .build();

        assert_eq!(params["iColumns"], "2");
        assert_eq!(params["mDataProp_1"], "customer.name");
        assert_eq!(params["bSortable_0"], "false");
        assert_eq!(params["sSearch_1"], "bob");
        assert_eq!(params["iSortCol_0"], "1");
        assert_eq!(params["sSortDir_0"], "desc");
        assert_eq!(params["iDisplayLength"], "5");
        assert_eq!(params["sEcho"], "3");
    }

    #[test]
    fn server_mode_fills_mandatory_keys() {
        let params = request(&["id"]).build_server();
        assert_eq!(params["sEcho"], "1");
        assert_eq!(params["iSortingCols"], "0");
        assert_eq!(params["iDisplayLength"], "-1");
    }

    #[tokio::test]
    async fn memory_engine_alternates_counts() {
        let engine = MemoryEngine::new()
            .with_rows(vec![json!({"id": 1}), json!("not a row")])
            .with_counts(10, 4);
        let count = CountQuery {
            root: datagrid_kernel::plan::types::RootRef {
                entity: "Order".to_string(),
                table: "orders".to_string(),
                alias: "orders".to_string(),
                identifier: datagrid_kernel::plan::types::FieldRef::new("orders", "id", "id"),
            },
            joins: Vec::new(),
            filter: None,
            params: Default::default(),
        };
        assert_eq!(engine.count(&count).await.unwrap(), 10);
        assert_eq!(engine.count(&count).await.unwrap(), 4);
        assert_eq!(engine.counts().len(), 2);
        assert!(MemoryEngine::new().failing("down").count(&count).await.is_err());
    }
}
