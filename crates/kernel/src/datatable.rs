//! Request orchestration.
//!
//! A [`Datatable`] is built per request from the shared schema and engine.
//! It parses the client parameters, resolves columns, builds the plan, runs
//! the row query and both counts, shapes the rows and returns the envelope.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::GridConfig;
use crate::engine::QueryEngine;
use crate::error::{GridError, GridResult, SchemaFailure};
use crate::plan::builder::{PlanBuilder, PlannedQuery};
use crate::plan::extension::{ExtensionRegistry, PredicateExtension, ValueFilter};
use crate::plan::joins::{JoinKind, JoinRegistry};
use crate::plan::types::QueryPlan;
use crate::request::{DeclaredColumn, GridRequest};
use crate::response::{ColumnMeta, GridOutput, ResponseEnvelope, ResultFormat};
use crate::schema::metadata::{SchemaCatalog, SchemaMetadata};
use crate::schema::resolver::{ColumnBinding, SchemaResolver};
use crate::shape::{ShapeOptions, shape_all};

/// A request that has been parsed and planned but not executed.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub request: GridRequest,
    pub planned: PlannedQuery,
}

impl PreparedQuery {
    pub fn plan(&self) -> &QueryPlan {
        &self.planned.plan
    }

    pub fn bindings(&self) -> &[ColumnBinding] {
        &self.planned.bindings
    }

    pub fn column_paths(&self) -> Vec<&str> {
        self.request.column_paths()
    }

    pub fn echo(&self) -> i64 {
        self.request.echo
    }

    pub fn offset(&self) -> u64 {
        self.request.display_start
    }

    /// Requested page size; `-1` for every row.
    pub fn amount(&self) -> i64 {
        self.request.display_length
    }

    /// Global search as `%search%`, if any.
    pub fn search_pattern(&self) -> Option<String> {
        self.request.search_pattern()
    }
}

/// Server-side processing for one grid request.
pub struct Datatable {
    schema: Arc<dyn SchemaMetadata>,
    engine: Option<Arc<dyn QueryEngine>>,
    entity: String,
    params: HashMap<String, String>,
    config: GridConfig,
    join_overrides: HashMap<String, JoinKind>,
    extensions: ExtensionRegistry,
    declared: Option<Vec<DeclaredColumn>>,
    custom_vars: Option<Map<String, Value>>,
}

impl Datatable {
    /// A grid over `entity`. Planning works without an engine; executing
    /// needs one (see [`Datatable::with_engine`]).
    pub fn new(
        schema: Arc<dyn SchemaMetadata>,
        entity: &str,
        params: HashMap<String, String>,
    ) -> Self {
        Self {
            schema,
            engine: None,
            entity: entity.to_string(),
            params,
            config: GridConfig::default(),
            join_overrides: HashMap::new(),
            extensions: ExtensionRegistry::new(),
            declared: None,
            custom_vars: None,
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn QueryEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Start from process-wide defaults.
    pub fn with_config(mut self, config: GridConfig) -> Self {
        self.config = config;
        self
    }

    /// Join kind for the joins of one column path, or of a path prefix.
    pub fn set_join_type(mut self, path: &str, kind: JoinKind) -> Self {
        self.join_overrides.insert(path.to_string(), kind);
        self
    }

    pub fn set_default_join_type(mut self, kind: JoinKind) -> Self {
        self.config.default_join_kind = kind;
        self
    }

    pub fn add_predicate_extension(
        mut self,
        extension: impl PredicateExtension + 'static,
    ) -> GridResult<Self> {
        self.extensions.add_predicate(Box::new(extension))?;
        Ok(self)
    }

    /// Filter the values of the column requested as `path`.
    pub fn add_value_filter(
        mut self,
        path: &str,
        filter: impl ValueFilter + 'static,
    ) -> GridResult<Self> {
        self.extensions.add_value_filter(path, Box::new(filter))?;
        Ok(self)
    }

    pub fn case_insensitive_search(mut self, enabled: bool) -> Self {
        self.config.case_insensitive_search = enabled;
        self
    }

    pub fn use_row_id(mut self, enabled: bool) -> Self {
        self.config.use_row_id = enabled;
        self
    }

    pub fn row_id_prefix(mut self, prefix: &str) -> Self {
        self.config.row_id_prefix = prefix.to_string();
        self
    }

    pub fn use_row_class(mut self, enabled: bool) -> Self {
        self.config.use_row_class = enabled;
        self
    }

    pub fn set_row_class(mut self, class: &str) -> Self {
        self.config.row_class = Some(class.to_string());
        self
    }

    /// Whether predicate extensions also restrict the total count.
    pub fn apply_extensions_to_total(mut self, enabled: bool) -> Self {
        self.config.apply_extensions_to_total = enabled;
        self
    }

    /// Alias of [`Datatable::apply_extensions_to_total`].
    pub fn hide_filtered_count(self, enabled: bool) -> Self {
        self.apply_extensions_to_total(enabled)
    }

    pub fn use_distinct_root_paging(mut self, enabled: bool) -> Self {
        self.config.use_distinct_root_paging = enabled;
        self
    }

    /// Declare the columns server-side.
    pub fn with_columns(mut self, columns: Vec<DeclaredColumn>) -> Self {
        self.declared = Some(columns);
        self
    }

    /// Extra values returned as `aoCustomVars` in server-declared mode.
    pub fn custom_vars(mut self, vars: Map<String, Value>) -> Self {
        self.custom_vars = Some(vars);
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Parse the request parameters for the current mode.
    pub fn request(&self) -> GridResult<GridRequest> {
        match &self.declared {
            Some(columns) => GridRequest::from_params_with_columns(&self.params, columns),
            None => GridRequest::from_params(&self.params),
        }
    }

    /// Parse, resolve and plan without executing anything.
    pub fn prepare(&self) -> GridResult<PreparedQuery> {
        let request = self.request()?;
        let resolver = SchemaResolver::new(self.schema.as_ref(), &self.entity)?;
        let mut joins = JoinRegistry::new(resolver.root_alias(), self.config.default_join_kind)
            .with_overrides(self.join_overrides.clone());
        let bindings = resolver.resolve_all(request.column_paths(), &mut joins)?;

        let options = self.config.plan_options();
        let planned = PlanBuilder::new(&resolver, &self.extensions, &options)
            .build(&request, bindings, joins)?;
        Ok(PreparedQuery { request, planned })
    }

    /// Execute the request and build the envelope.
    pub async fn search_results(&self) -> GridResult<ResponseEnvelope> {
        let Some(engine) = &self.engine else {
            return Err(GridError::Config("no query engine configured".to_string()));
        };
        let prepared = self.prepare()?;
        let planned = &prepared.planned;

        let rows = engine
            .fetch_rows(&planned.plan)
            .await
            .map_err(|e| self.execution_error(e))?;
        let total_records = engine
            .count(&planned.total)
            .await
            .map_err(|e| self.execution_error(e))?;
        let total_display_records = engine
            .count(&planned.filtered)
            .await
            .map_err(|e| self.execution_error(e))?;

        let row_class = self
            .config
            .row_class
            .as_deref()
            .filter(|_| self.config.use_row_class);
        let row_id_prefix = self
            .config
            .use_row_id
            .then_some(self.config.row_id_prefix.as_str());
        let options = ShapeOptions {
            row_class,
            row_id_prefix,
            root_identifier: &planned.plan.root.identifier.field,
            extensions: &self.extensions,
        };
        let rows = shape_all(rows, &planned.bindings, &options)?;

        tracing::debug!(
            entity = %self.entity,
            rows = rows.len(),
            total_records,
            total_display_records,
            "grid request served"
        );

        let (columns, custom_vars) = match &self.declared {
            Some(declared) => (
                Some(declared.iter().map(ColumnMeta::from).collect()),
                Some(self.custom_vars.clone().unwrap_or_default()),
            ),
            None => (None, None),
        };

        Ok(ResponseEnvelope {
            echo: prepared.request.echo,
            total_records,
            total_display_records,
            rows,
            columns,
            custom_vars,
        })
    }

    /// Execute the request and return the result in `format`.
    pub async fn search_results_as(&self, format: ResultFormat) -> GridResult<GridOutput> {
        let envelope = self.search_results().await?;
        envelope
            .into_format(format)
            .map_err(|e| {
                GridError::Execution(
                    anyhow::Error::new(e).context("failed to encode grid response"),
                )
            })
    }

    /// Engine errors that carry a planning error keep their kind.
    fn execution_error(&self, error: anyhow::Error) -> GridError {
        tracing::error!(entity = %self.entity, error = %format!("{error:#}"), "grid query failed");
        match error.downcast::<GridError>() {
            Ok(grid) => grid,
            Err(other) => GridError::Execution(other),
        }
    }
}

/// Shared entry point holding the schema catalog, engine and defaults.
#[derive(Clone)]
pub struct DatatableManager {
    schema: Arc<SchemaCatalog>,
    engine: Arc<dyn QueryEngine>,
    config: GridConfig,
}

impl DatatableManager {
    pub fn new(
        schema: Arc<SchemaCatalog>,
        engine: Arc<dyn QueryEngine>,
        config: GridConfig,
    ) -> Self {
        Self {
            schema,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// A grid over `entity` (a name or `Namespace:Entity` alias) for one
    /// request.
    pub fn datatable(
        &self,
        entity: &str,
        params: HashMap<String, String>,
    ) -> GridResult<Datatable> {
        let Some(metadata) = self.schema.resolve_entity(entity) else {
            return Err(GridError::schema(entity, entity, SchemaFailure::EntityNotFound));
        };
        let schema: Arc<dyn SchemaMetadata> = self.schema.clone();
        Ok(
            Datatable::new(schema, &metadata.name, params)
                .with_engine(self.engine.clone())
                .with_config(self.config.clone()),
        )
    }
}
