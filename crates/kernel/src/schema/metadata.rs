//! Relational schema metadata.
//!
//! The resolver only needs a read-only view of entity types, their scalar
//! fields and their associations. [`SchemaMetadata`] is that view;
//! [`SchemaCatalog`] is the in-process implementation, loaded once (from
//! code or a TOML file) and shared behind an `Arc` by every request.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::naming::snake_case;
use crate::error::{GridError, GridResult};

/// Cardinality of an association.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl AssociationKind {
    /// One-to-many and many-to-many associations multiply rows when joined.
    pub fn is_collection(self) -> bool {
        matches!(self, AssociationKind::OneToMany | AssociationKind::ManyToMany)
    }
}

/// Link table used by many-to-many associations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinTable {
    /// Link table name.
    pub table: String,
    /// Column holding the owning side's key.
    pub source_column: String,
    /// Column holding the target side's key.
    pub target_column: String,
}

/// An association from one entity type to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Association {
    /// Association (property) name, e.g. `customer`.
    pub name: String,
    /// Target entity type name.
    pub target: String,
    pub kind: AssociationKind,
    /// Column on the owning table taking part in the join condition.
    pub local_column: String,
    /// Column on the target table taking part in the join condition.
    #[serde(default = "default_key_column")]
    pub foreign_column: String,
    /// Link table, many-to-many only.
    #[serde(default)]
    pub through: Option<JoinTable>,
}

fn default_key_column() -> String {
    "id".to_string()
}

impl Association {
    /// `owner.<foreign_key> = target.id`
    pub fn many_to_one(name: &str, target: &str, foreign_key: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            kind: AssociationKind::ManyToOne,
            local_column: foreign_key.to_string(),
            foreign_column: default_key_column(),
            through: None,
        }
    }

    /// `owner.id = target.<mapped_by>`
    pub fn one_to_many(name: &str, target: &str, mapped_by: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            kind: AssociationKind::OneToMany,
            local_column: default_key_column(),
            foreign_column: mapped_by.to_string(),
            through: None,
        }
    }

    /// `owner.id = link.<source> AND link.<target> = target.id`
    pub fn many_to_many(name: &str, target: &str, link: JoinTable) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            kind: AssociationKind::ManyToMany,
            local_column: default_key_column(),
            foreign_column: default_key_column(),
            through: Some(link),
        }
    }
}

/// Mapping information for one entity type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityMetadata {
    /// Entity type name, optionally namespaced (`Shop\Order`).
    pub name: String,

    /// Backing table.
    pub table: String,

    /// Primary key field names, in key order.
    #[serde(default = "default_identifiers")]
    pub identifiers: Vec<String>,

    /// Scalar field names (camel case).
    #[serde(default)]
    pub fields: Vec<String>,

    /// Column overrides; fields not listed map to their snake_case name.
    #[serde(default)]
    pub columns: HashMap<String, String>,

    #[serde(default)]
    pub associations: Vec<Association>,
}

fn default_identifiers() -> Vec<String> {
    vec!["id".to_string()]
}

impl EntityMetadata {
    /// Create an entity keyed by `id` with no fields yet.
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            identifiers: default_identifiers(),
            fields: vec!["id".to_string()],
            columns: HashMap::new(),
            associations: Vec::new(),
        }
    }

    pub fn with_identifiers(mut self, identifiers: &[&str]) -> Self {
        self.identifiers = identifiers.iter().map(|s| s.to_string()).collect();
        for id in identifiers {
            if !self.has_field(id) {
                self.fields.push(id.to_string());
            }
        }
        self
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        for field in fields {
            if !self.has_field(field) {
                self.fields.push(field.to_string());
            }
        }
        self
    }

    pub fn with_column(mut self, field: &str, column: &str) -> Self {
        self.columns.insert(field.to_string(), column.to_string());
        self
    }

    pub fn with_association(mut self, association: Association) -> Self {
        self.associations.push(association);
        self
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f == name)
    }

    pub fn association(&self, name: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.name == name)
    }

    /// Table column backing a field.
    pub fn column_name(&self, field: &str) -> String {
        self.columns
            .get(field)
            .cloned()
            .unwrap_or_else(|| snake_case(field))
    }

    /// First identifier field, used for row ids and distinct counts.
    pub fn primary_identifier(&self) -> Option<&str> {
        self.identifiers.first().map(String::as_str)
    }
}

/// Read-only view of the relational schema graph.
///
/// Implementations must be safe to share between concurrent requests and
/// must never change after they are handed to a request.
pub trait SchemaMetadata: Send + Sync {
    /// Look up an entity type by name.
    fn entity(&self, name: &str) -> Option<&EntityMetadata>;

    fn association(&self, entity: &str, name: &str) -> Option<&Association> {
        self.entity(entity)?.association(name)
    }

    fn has_association(&self, entity: &str, name: &str) -> bool {
        self.association(entity, name).is_some()
    }

    fn is_collection_association(&self, entity: &str, name: &str) -> bool {
        self.association(entity, name)
            .is_some_and(|a| a.kind.is_collection())
    }

    fn association_target_type(&self, entity: &str, name: &str) -> Option<&str> {
        self.association(entity, name).map(|a| a.target.as_str())
    }

    fn has_field(&self, entity: &str, name: &str) -> bool {
        self.entity(entity).is_some_and(|e| e.has_field(name))
    }

    fn identifier_field_names(&self, entity: &str) -> &[String] {
        self.entity(entity)
            .map(|e| e.identifiers.as_slice())
            .unwrap_or_default()
    }

    fn table_name(&self, entity: &str) -> Option<&str> {
        self.entity(entity).map(|e| e.table.as_str())
    }
}

/// On-disk catalog layout.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    namespaces: HashMap<String, String>,
    #[serde(default)]
    entities: Vec<EntityMetadata>,
}

/// In-memory schema metadata.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    entities: HashMap<String, EntityMetadata>,
    /// Namespace aliases: `Shop` → `App\Shop`.
    namespaces: HashMap<String, String>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity type, replacing any previous one of the same name.
    pub fn with_entity(mut self, entity: EntityMetadata) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    pub fn with_namespace(mut self, alias: &str, namespace: &str) -> Self {
        self.namespaces
            .insert(alias.to_string(), namespace.to_string());
        self
    }

    /// Load and validate a catalog from TOML.
    pub fn from_toml_str(source: &str) -> GridResult<Self> {
        let file: CatalogFile =
            toml::from_str(source).map_err(|e| GridError::Config(e.to_string()))?;

        let mut catalog = Self {
            entities: HashMap::new(),
            namespaces: file.namespaces,
        };
        for entity in file.entities {
            catalog = catalog.with_entity(entity);
        }

        let errors = catalog.validate();
        if !errors.is_empty() {
            return Err(GridError::Config(errors.join("; ")));
        }
        Ok(catalog)
    }

    /// Resolve an entity class name or `Alias:Entity` shorthand.
    pub fn resolve_entity(&self, class: &str) -> Option<&EntityMetadata> {
        if let Some((alias, simple)) = class.split_once(':') {
            if let Some(namespace) = self.namespaces.get(alias)
                && let Some(entity) = self.entities.get(&format!("{namespace}\\{simple}"))
            {
                return Some(entity);
            }
            return self.entities.get(simple);
        }
        self.entities.get(class)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Check the catalog for dangling references.
    ///
    /// Returns a list of problems. Empty list means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut names: Vec<&String> = self.entities.keys().collect();
        names.sort();

        for name in names {
            let Some(entity) = self.entities.get(name) else {
                continue;
            };
            if entity.table.is_empty() {
                errors.push(format!("entity '{name}' has no table"));
            }
            if entity.identifiers.is_empty() {
                errors.push(format!("entity '{name}' has no identifier"));
            }
            for id in &entity.identifiers {
                if !entity.has_field(id) {
                    errors.push(format!(
                        "entity '{name}': identifier '{id}' is not a declared field"
                    ));
                }
            }
            for assoc in &entity.associations {
                if !self.entities.contains_key(&assoc.target) {
                    errors.push(format!(
                        "entity '{name}': association '{}' targets unknown entity '{}'",
                        assoc.name, assoc.target
                    ));
                }
                if assoc.kind == AssociationKind::ManyToMany && assoc.through.is_none() {
                    errors.push(format!(
                        "entity '{name}': many-to-many association '{}' needs a link table",
                        assoc.name
                    ));
                }
            }
        }

        errors
    }
}

impl SchemaMetadata for SchemaCatalog {
    fn entity(&self, name: &str) -> Option<&EntityMetadata> {
        self.entities.get(name)
    }
}
