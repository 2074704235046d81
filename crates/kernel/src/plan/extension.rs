//! Extension points for integrator-supplied predicates and value filters.
//!
//! Extensions are registered on a request before planning and applied in
//! registration order. Predicate extensions append to the WHERE clause of the
//! row query and the filtered count (and, unless disabled, the total count);
//! value filters transform individual cell values while rows are shaped.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail};
use serde_json::Value;

use super::joins::JoinRegistry;
use super::types::{FieldRef, Predicate};
use crate::error::{GridError, GridResult};
use crate::schema::resolver::SchemaResolver;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Appends predicates to a query.
///
/// Used for things like tenant scoping, where every count and every page must
/// be restricted the same way regardless of what the client asked for.
pub trait PredicateExtension: Send + Sync {
    /// Name used in logs and contract errors.
    fn name(&self) -> &str;

    /// Add predicates (and their parameters) to `scope`.
    fn apply(&self, scope: &mut FilterScope<'_>) -> Result<()>;
}

/// Transforms one cell value while a row is shaped.
pub trait ValueFilter: Send + Sync {
    fn name(&self) -> &str;

    /// Receives the current value and returns the replacement. Filters on
    /// columns that do not cross a collection hop must return a scalar.
    fn apply(&self, value: Value) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Filter scope
// ---------------------------------------------------------------------------

/// What a predicate extension sees while it runs.
///
/// Fields are addressed by column path, exactly like requested columns, so an
/// extension can reach related entities; any joins it needs are registered on
/// the request's join registry.
pub struct FilterScope<'a> {
    extension: &'a str,
    resolver: &'a SchemaResolver<'a>,
    joins: &'a mut JoinRegistry,
    params: &'a mut BTreeMap<String, Value>,
    predicates: Vec<Predicate>,
}

impl<'a> FilterScope<'a> {
    pub(crate) fn new(
        extension: &'a str,
        resolver: &'a SchemaResolver<'a>,
        joins: &'a mut JoinRegistry,
        params: &'a mut BTreeMap<String, Value>,
    ) -> Self {
        Self {
            extension,
            resolver,
            joins,
            params,
            predicates: Vec::new(),
        }
    }

    pub fn root_alias(&self) -> &str {
        self.resolver.root_alias()
    }

    /// Resolve a column path to a field reference.
    pub fn field(&mut self, path: &str) -> Result<FieldRef> {
        let binding = self.resolver.resolve(path, self.joins)?;
        Ok(binding.field_ref())
    }

    /// Bind a named parameter. Names must be unique within the request.
    pub fn bind(&mut self, name: &str, value: impl Into<Value>) -> Result<String> {
        if self.params.contains_key(name) {
            bail!("parameter '{name}' is already bound");
        }
        self.params.insert(name.to_string(), value.into());
        Ok(name.to_string())
    }

    /// Whether a parameter name is already taken.
    pub fn is_bound(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn push(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }

    /// `field = value`, binding `param`.
    pub fn equals(&mut self, path: &str, param: &str, value: impl Into<Value>) -> Result<()> {
        let field = self.field(path)?;
        let param = self.bind(param, value)?;
        self.push(Predicate::Equals { field, param });
        Ok(())
    }

    /// `field IN (values)`, binding `param`.
    pub fn one_of(&mut self, path: &str, param: &str, values: Vec<Value>) -> Result<()> {
        let field = self.field(path)?;
        let param = self.bind(param, Value::Array(values))?;
        self.push(Predicate::In { field, param });
        Ok(())
    }

    /// Check everything the extension pushed and hand it back.
    ///
    /// Every alias must be the root or a registered join and every parameter
    /// a predicate references must have been bound.
    pub(crate) fn finish(self) -> GridResult<Vec<Predicate>> {
        let root = self.resolver.root_alias();
        for predicate in &self.predicates {
            for alias in predicate.aliases() {
                if alias != root && !self.joins.contains(alias) {
                    return Err(GridError::contract(
                        self.extension,
                        format!("predicate references unknown alias '{alias}'"),
                    ));
                }
            }
            for param in predicate.params() {
                if !self.params.contains_key(param) {
                    return Err(GridError::contract(
                        self.extension,
                        format!("predicate references unbound parameter '{param}'"),
                    ));
                }
            }
        }
        Ok(self.predicates)
    }
}

// ---------------------------------------------------------------------------
// Ready-made extensions
// ---------------------------------------------------------------------------

/// A precomputed list of predicates, applied as-is.
///
/// The predicates are checked against the request's aliases like any other
/// extension output, so a collection built for a different root entity is a
/// contract error rather than broken SQL.
#[derive(Debug, Clone)]
pub struct PredicateCollection {
    name: String,
    predicates: Vec<Predicate>,
    params: BTreeMap<String, Value>,
}

impl PredicateCollection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            predicates: Vec::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }
}

impl PredicateExtension for PredicateCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, scope: &mut FilterScope<'_>) -> Result<()> {
        for (name, value) in &self.params {
            scope.bind(name, value.clone())?;
        }
        for predicate in &self.predicates {
            scope.push(predicate.clone());
        }
        Ok(())
    }
}

/// Predicate extension backed by a closure.
pub struct PredicateFn<F> {
    name: String,
    f: F,
}

impl<F> PredicateFn<F>
where
    F: Fn(&mut FilterScope<'_>) -> Result<()> + Send + Sync,
{
    pub fn new(name: &str, f: F) -> Self {
        Self {
            name: name.to_string(),
            f,
        }
    }
}

impl<F> PredicateExtension for PredicateFn<F>
where
    F: Fn(&mut FilterScope<'_>) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, scope: &mut FilterScope<'_>) -> Result<()> {
        (self.f)(scope)
    }
}

/// Value filter backed by a closure.
pub struct ValueFn<F> {
    name: String,
    f: F,
}

impl<F> ValueFn<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    pub fn new(name: &str, f: F) -> Self {
        Self {
            name: name.to_string(),
            f,
        }
    }
}

impl<F> ValueFilter for ValueFn<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, value: Value) -> Result<Value> {
        (self.f)(value)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Validate an extension name: must be non-empty, alphanumeric/underscore/hyphen,
/// start with a letter or underscore, max 64 chars.
pub fn is_valid_extension_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
}

/// Ordered extensions registered on one grid.
#[derive(Default)]
pub struct ExtensionRegistry {
    predicates: Vec<Box<dyn PredicateExtension>>,
    /// Column path → filters, in registration order per path.
    value_filters: Vec<(String, Box<dyn ValueFilter>)>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate extension. Names must be valid and unique.
    pub fn add_predicate(&mut self, extension: Box<dyn PredicateExtension>) -> GridResult<()> {
        let name = extension.name();
        if !is_valid_extension_name(name) {
            return Err(GridError::Config(format!(
                "predicate extension name '{name}' is invalid (must be alphanumeric/underscore/hyphen, start with letter or underscore)"
            )));
        }
        if self.predicates.iter().any(|p| p.name() == name) {
            return Err(GridError::Config(format!(
                "predicate extension '{name}' is already registered"
            )));
        }
        self.predicates.push(extension);
        Ok(())
    }

    /// Register a value filter for the column requested as `path`.
    pub fn add_value_filter(&mut self, path: &str, filter: Box<dyn ValueFilter>) -> GridResult<()> {
        let name = filter.name();
        if !is_valid_extension_name(name) {
            return Err(GridError::Config(format!(
                "value filter name '{name}' is invalid (must be alphanumeric/underscore/hyphen, start with letter or underscore)"
            )));
        }
        self.value_filters.push((path.to_string(), filter));
        Ok(())
    }

    pub fn predicates(&self) -> impl Iterator<Item = &dyn PredicateExtension> {
        self.predicates.iter().map(|p| p.as_ref())
    }

    /// Filters registered for a column path, in registration order.
    pub fn value_filters_for<'a>(
        &'a self,
        path: &'a str,
    ) -> impl Iterator<Item = &'a dyn ValueFilter> + 'a {
        self.value_filters
            .iter()
            .filter(move |(p, _)| p == path)
            .map(|(_, f)| f.as_ref())
    }

    pub fn has_predicates(&self) -> bool {
        !self.predicates.is_empty()
    }

    /// Names of registered predicate extensions, in order.
    pub fn predicate_names(&self) -> Vec<&str> {
        self.predicates.iter().map(|p| p.name()).collect()
    }

    /// Column paths that have at least one value filter.
    pub fn filtered_paths(&self) -> BTreeSet<&str> {
        self.value_filters.iter().map(|(p, _)| p.as_str()).collect()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("predicates", &self.predicate_names())
            .field("value_filters", &self.filtered_paths())
            .finish()
    }
}
