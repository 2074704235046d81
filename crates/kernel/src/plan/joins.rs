//! Join planning.
//!
//! Every hop of every column path ends up here. The registry hands out one
//! alias per distinct (owner alias, association) pair, so two columns sharing
//! a path prefix share its joins, and remembers the identifier fields each
//! joined entity must contribute to the select list.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GridError;
use crate::schema::metadata::{Association, EntityMetadata};
use crate::schema::naming::lower_camel;

/// How a join is materialized.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

impl FromStr for JoinKind {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inner" => Ok(JoinKind::Inner),
            "left" => Ok(JoinKind::Left),
            other => Err(GridError::Config(format!(
                "unknown join kind '{other}' (expected 'inner' or 'left')"
            ))),
        }
    }
}

impl fmt::Display for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinKind::Inner => "inner",
            JoinKind::Left => "left",
        })
    }
}

/// A join required by at least one requested column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinSpec {
    /// Alias of the joined table; unique within a request.
    pub alias: String,
    /// Alias the association is navigated from.
    pub owner_alias: String,
    /// Association name on the owner entity.
    pub association: String,
    /// Target entity type.
    pub entity: String,
    /// Target table.
    pub table: String,
    pub kind: JoinKind,
    /// Whether the association is one-to-many or many-to-many.
    pub collection: bool,
    /// Join columns, copied from the schema.
    pub mapping: Association,
    /// Identifier fields of the target entity.
    pub identifiers: Vec<String>,
    /// Column path prefix that first reached this join (`customer.location`).
    pub origin_path: String,
    /// Raw request path of the column that first reached this join.
    pub origin_column: String,
    #[serde(skip)]
    explicit_kind: bool,
}

impl JoinSpec {
    /// `<ownerAlias>.<association>`
    pub fn source_expression(&self) -> String {
        format!("{}.{}", self.owner_alias, self.association)
    }
}

/// One hop to register.
#[derive(Debug, Clone, Copy)]
pub struct JoinRequest<'a> {
    pub owner_alias: &'a str,
    pub association: &'a Association,
    pub target: &'a EntityMetadata,
    /// Entity type name of the request root.
    pub root_entity: &'a str,
    /// Path prefix up to and including this hop.
    pub origin_path: &'a str,
    /// Raw path of the column being resolved.
    pub column_path: &'a str,
}

/// Request-scoped registry of joins, in registration order.
///
/// Owners are always registered before the joins that hang off them, so
/// iteration order is a valid join order.
#[derive(Debug, Clone)]
pub struct JoinRegistry {
    root_alias: String,
    default_kind: JoinKind,
    overrides: HashMap<String, JoinKind>,
    joins: Vec<JoinSpec>,
}

impl JoinRegistry {
    pub fn new(root_alias: &str, default_kind: JoinKind) -> Self {
        Self {
            root_alias: root_alias.to_string(),
            default_kind,
            overrides: HashMap::new(),
            joins: Vec::new(),
        }
    }

    /// Use per-path join kinds, keyed by column path or path prefix.
    pub fn with_overrides(mut self, overrides: HashMap<String, JoinKind>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn root_alias(&self) -> &str {
        &self.root_alias
    }

    /// Register a hop, returning the alias of its join.
    ///
    /// Registering the same hop twice returns the alias handed out the first
    /// time and leaves the registry unchanged, except that a column-level join
    /// kind override is honoured if no earlier column set one.
    pub fn register(&mut self, req: JoinRequest<'_>) -> String {
        if let Some(existing) = self
            .joins
            .iter_mut()
            .find(|j| j.owner_alias == req.owner_alias && j.association == req.association.name)
        {
            if !existing.explicit_kind
                && let Some(kind) = self.overrides.get(req.column_path)
            {
                existing.kind = *kind;
                existing.explicit_kind = true;
            }
            return existing.alias.clone();
        }

        let alias = self.alias_for(&req);
        let (kind, explicit_kind) = match self
            .overrides
            .get(req.origin_path)
            .or_else(|| self.overrides.get(req.column_path))
        {
            Some(kind) => (*kind, true),
            None => (self.default_kind, false),
        };

        tracing::debug!(
            alias = %alias,
            join_on = %format!("{}.{}", req.owner_alias, req.association.name),
            kind = %kind,
            "registered join"
        );

        self.joins.push(JoinSpec {
            alias: alias.clone(),
            owner_alias: req.owner_alias.to_string(),
            association: req.association.name.clone(),
            entity: req.target.name.clone(),
            table: req.target.table.clone(),
            kind,
            collection: req.association.kind.is_collection(),
            mapping: req.association.clone(),
            identifiers: req.target.identifiers.clone(),
            origin_path: req.origin_path.to_string(),
            origin_column: req.column_path.to_string(),
            explicit_kind,
        });
        alias
    }

    /// Camel-cased target table; self references get the association name
    /// appended. A name already taken by another hop falls back to
    /// `<owner>_<association>`, then to a numbered suffix.
    fn alias_for(&self, req: &JoinRequest<'_>) -> String {
        let mut alias = lower_camel(&req.target.table);
        if req.target.name == req.root_entity {
            alias = format!("{alias}_{}", req.association.name);
        }
        if !self.is_taken(&alias) {
            return alias;
        }

        let base = format!("{}_{}", req.owner_alias, req.association.name);
        if !self.is_taken(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}_{n}");
            if !self.is_taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn is_taken(&self, alias: &str) -> bool {
        alias == self.root_alias || self.contains(alias)
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.joins.iter().any(|j| j.alias == alias)
    }

    pub fn get(&self, alias: &str) -> Option<&JoinSpec> {
        self.joins.iter().find(|j| j.alias == alias)
    }

    /// Identifier fields an alias must contribute to the select list.
    pub fn identifiers(&self, alias: &str) -> Option<&[String]> {
        self.get(alias).map(|j| j.identifiers.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = &JoinSpec> {
        self.joins.iter()
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// All joins, in join order.
    pub fn specs(&self) -> Vec<JoinSpec> {
        self.joins.clone()
    }

    /// Joins needed to reach `aliases`, including every ancestor join, in
    /// join order.
    pub fn closure<'a>(&self, aliases: impl IntoIterator<Item = &'a str>) -> Vec<JoinSpec> {
        let mut needed: BTreeSet<&str> = BTreeSet::new();
        for alias in aliases {
            let mut current = self.get(alias);
            while let Some(join) = current {
                if !needed.insert(join.alias.as_str()) {
                    break;
                }
                current = self.get(&join.owner_alias);
            }
        }
        self.joins
            .iter()
            .filter(|j| needed.contains(j.alias.as_str()))
            .cloned()
            .collect()
    }

    /// Whether any registered join navigates a collection association.
    pub fn has_collection(&self) -> bool {
        self.joins.iter().any(|j| j.collection)
    }
}
