//! Column path resolution.
//!
//! Walks a dotted column path (`customer.location.address`) through the
//! schema graph one association per segment, registering the joins it needs
//! along the way, and checks that the last segment is a scalar field of the
//! entity reached.

use serde::Serialize;

use super::metadata::{EntityMetadata, SchemaMetadata};
use super::naming::lower_camel;
use crate::error::{GridError, GridResult, SchemaFailure};
use crate::plan::joins::{JoinRegistry, JoinRequest};
use crate::plan::types::FieldRef;

/// Resolved form of one requested column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnBinding {
    /// Path as the client sent it.
    pub raw_path: String,
    /// Normalized association names followed by the leaf field name; these
    /// are the keys the column occupies in a result row.
    pub segments: Vec<String>,
    /// Last association navigated, or the root alias for single-segment paths.
    pub entity_alias: String,
    /// Entity type owning the field.
    pub entity: String,
    /// Leaf field (camel case).
    pub field_name: String,
    /// Table column backing the field.
    pub column_name: String,
    /// Alias of the last join reached (root alias when there are no hops).
    pub join_alias: String,
    /// `join_alias.field_name`
    pub fully_qualified_name: String,
    /// Whether any hop navigated a one-to-many or many-to-many association.
    pub contains_collection_hop: bool,
}

impl ColumnBinding {
    pub fn field_ref(&self) -> FieldRef {
        FieldRef::new(&self.join_alias, &self.field_name, &self.column_name)
    }

    /// Whether the path navigates at least one association.
    pub fn is_related(&self) -> bool {
        self.segments.len() > 1
    }
}

/// Resolves column paths against a root entity.
pub struct SchemaResolver<'a> {
    schema: &'a dyn SchemaMetadata,
    root: &'a EntityMetadata,
    root_alias: String,
}

impl<'a> SchemaResolver<'a> {
    pub fn new(schema: &'a dyn SchemaMetadata, root_entity: &str) -> GridResult<Self> {
        let root = schema.entity(root_entity).ok_or_else(|| {
            GridError::schema(root_entity, root_entity, SchemaFailure::EntityNotFound)
        })?;
        Ok(Self {
            schema,
            root,
            root_alias: lower_camel(&root.table),
        })
    }

    pub fn root(&self) -> &'a EntityMetadata {
        self.root
    }

    pub fn schema(&self) -> &'a dyn SchemaMetadata {
        self.schema
    }

    /// Camel-cased root table name.
    pub fn root_alias(&self) -> &str {
        &self.root_alias
    }

    /// Resolve one column path, registering its joins in `joins`.
    pub fn resolve(&self, path: &str, joins: &mut JoinRegistry) -> GridResult<ColumnBinding> {
        let mut hops: Vec<&str> = path.split('.').collect();
        let leaf = hops.pop().unwrap_or_default();
        let field_name = lower_camel(leaf);

        if hops.is_empty() {
            if !self.root.has_field(&field_name) {
                return Err(GridError::schema(path, leaf, SchemaFailure::FieldNotFound));
            }
            return Ok(ColumnBinding {
                raw_path: path.to_string(),
                segments: vec![field_name.clone()],
                entity_alias: self.root_alias.clone(),
                entity: self.root.name.clone(),
                column_name: self.root.column_name(&field_name),
                join_alias: self.root_alias.clone(),
                fully_qualified_name: format!("{}.{field_name}", self.root_alias),
                field_name,
                contains_collection_hop: false,
            });
        }

        let mut current = self.root;
        let mut join_alias = self.root_alias.clone();
        let mut entity_alias = self.root_alias.clone();
        let mut prefix = String::new();
        let mut segments = Vec::with_capacity(hops.len() + 1);
        let mut contains_collection_hop = false;

        for hop in hops {
            let association_name = lower_camel(hop);
            let Some(association) = current.association(&association_name) else {
                return Err(GridError::schema(
                    path,
                    hop,
                    SchemaFailure::AssociationNotFound,
                ));
            };
            if association.kind.is_collection() {
                contains_collection_hop = true;
            }
            let Some(target) = self.schema.entity(&association.target) else {
                return Err(GridError::schema(
                    path,
                    hop,
                    SchemaFailure::EntityNotFound,
                ));
            };

            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(hop);

            join_alias = joins.register(JoinRequest {
                owner_alias: &join_alias,
                association,
                target,
                root_entity: &self.root.name,
                origin_path: &prefix,
                column_path: path,
            });
            entity_alias = association_name.clone();
            segments.push(association_name);
            current = target;
        }

        if !current.has_field(&field_name) {
            return Err(GridError::schema(path, leaf, SchemaFailure::FieldNotFound));
        }
        segments.push(field_name.clone());

        Ok(ColumnBinding {
            raw_path: path.to_string(),
            segments,
            entity_alias,
            entity: current.name.clone(),
            column_name: current.column_name(&field_name),
            fully_qualified_name: format!("{join_alias}.{field_name}"),
            join_alias,
            field_name,
            contains_collection_hop,
        })
    }

    /// Resolve every path in order.
    pub fn resolve_all<'p>(
        &self,
        paths: impl IntoIterator<Item = &'p str>,
        joins: &mut JoinRegistry,
    ) -> GridResult<Vec<ColumnBinding>> {
        paths
            .into_iter()
            .map(|path| self.resolve(path, joins))
            .collect()
    }
}
