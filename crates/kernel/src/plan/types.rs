//! Query plan types.
//!
//! A [`QueryPlan`] is engine-agnostic: aliases, fields and named parameters
//! only. `plan::render` lowers it to SQL; other engines can walk it directly.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::joins::JoinSpec;
use crate::error::GridError;

/// A field reached through an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldRef {
    pub alias: String,
    /// Entity field name (camel case).
    pub field: String,
    /// Backing table column.
    pub column: String,
}

impl FieldRef {
    pub fn new(alias: &str, field: &str, column: &str) -> Self {
        Self {
            alias: alias.to_string(),
            field: field.to_string(),
            column: column.to_string(),
        }
    }

    /// `alias.field`
    pub fn fully_qualified(&self) -> String {
        format!("{}.{}", self.alias, self.field)
    }
}

/// The root entity of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootRef {
    pub entity: String,
    pub table: String,
    pub alias: String,
    /// Primary identifier of the root entity.
    pub identifier: FieldRef,
}

/// A selected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectField {
    pub field: String,
    pub column: String,
}

/// Fields selected from one alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectGroup {
    pub alias: String,
    pub fields: Vec<SelectField>,
}

impl SelectGroup {
    pub fn new(alias: &str) -> Self {
        Self {
            alias: alias.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f.field == field)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.field.as_str()).collect()
    }

    /// Append a field unless already present.
    pub fn push(&mut self, field: &str, column: &str) {
        if !self.contains(field) {
            self.fields.push(SelectField {
                field: field.to_string(),
                column: column.to_string(),
            });
        }
    }
}

/// Filter predicate tree. Values live in the plan's parameter map and are
/// referenced by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// `field LIKE :param`, the parameter already carrying the `%` wildcards.
    /// With `case_insensitive` both sides are lower-cased.
    Contains {
        field: FieldRef,
        param: String,
        case_insensitive: bool,
    },
    /// `field = :param`
    Equals { field: FieldRef, param: String },
    /// `field IN (:param...)`; the parameter is bound to a list.
    In { field: FieldRef, param: String },
    IsNull { field: FieldRef },
    IsNotNull { field: FieldRef },
    /// OR-group.
    Any(Vec<Predicate>),
    /// AND-group.
    All(Vec<Predicate>),
}

impl Predicate {
    /// Aliases referenced anywhere in the predicate.
    pub fn aliases(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_aliases(&mut out);
        out
    }

    fn collect_aliases<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Predicate::Contains { field, .. }
            | Predicate::Equals { field, .. }
            | Predicate::In { field, .. }
            | Predicate::IsNull { field }
            | Predicate::IsNotNull { field } => {
                out.insert(field.alias.as_str());
            }
            Predicate::Any(items) | Predicate::All(items) => {
                for item in items {
                    item.collect_aliases(out);
                }
            }
        }
    }

    /// Parameter names referenced anywhere in the predicate.
    pub fn params(&self) -> Vec<&str> {
        match self {
            Predicate::Contains { param, .. }
            | Predicate::Equals { param, .. }
            | Predicate::In { param, .. } => vec![param.as_str()],
            Predicate::IsNull { .. } | Predicate::IsNotNull { .. } => Vec::new(),
            Predicate::Any(items) | Predicate::All(items) => {
                items.iter().flat_map(Predicate::params).collect()
            }
        }
    }
}

/// WHERE clause of a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterTree {
    /// OR-group from the global search string.
    pub global: Option<Predicate>,
    /// AND-group from the per-column search strings.
    pub columns: Option<Predicate>,
    /// Predicates appended by extensions, in registration order.
    pub extra: Vec<Predicate>,
}

impl FilterTree {
    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.columns.is_none() && self.extra.is_empty()
    }

    /// Everything AND-ed together, or `None` when there is nothing to filter.
    pub fn combined(&self) -> Option<Predicate> {
        let mut parts: Vec<Predicate> = Vec::new();
        parts.extend(self.global.clone());
        parts.extend(self.columns.clone());
        parts.extend(self.extra.iter().cloned());
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Predicate::All(parts)),
        }
    }

    /// Only the extension predicates.
    pub fn extra_only(&self) -> Option<Predicate> {
        match self.extra.len() {
            0 => None,
            1 => self.extra.first().cloned(),
            _ => Some(Predicate::All(self.extra.clone())),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortDirection {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(GridError::RequestShape(format!(
                "unknown sort direction '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        })
    }
}

/// One ORDER BY entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBy {
    pub field: FieldRef,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn fully_qualified(&self) -> String {
        self.field.fully_qualified()
    }
}

/// Row window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

/// Everything needed to fetch one page of rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub root: RootRef,
    /// Root group first, then one group per join in join order.
    pub select: Vec<SelectGroup>,
    pub joins: Vec<JoinSpec>,
    pub filter: FilterTree,
    /// Named parameter values.
    pub params: BTreeMap<String, serde_json::Value>,
    pub order: Vec<OrderBy>,
    /// `None` returns every row.
    pub page: Option<Page>,
    /// Page over distinct root identifiers rather than joined rows.
    pub distinct_root_paging: bool,
}

impl QueryPlan {
    pub fn group(&self, alias: &str) -> Option<&SelectGroup> {
        self.select.iter().find(|g| g.alias == alias)
    }

    pub fn has_collection_joins(&self) -> bool {
        self.joins.iter().any(|j| j.collection)
    }
}

/// A `COUNT(DISTINCT root.id)` query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountQuery {
    pub root: RootRef,
    pub joins: Vec<JoinSpec>,
    pub filter: Option<Predicate>,
    pub params: BTreeMap<String, serde_json::Value>,
}
