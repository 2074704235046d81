//! Relational schema metadata and column path resolution.

pub mod metadata;
pub mod naming;
pub mod resolver;

pub use metadata::{
    Association, AssociationKind, EntityMetadata, JoinTable, SchemaCatalog, SchemaMetadata,
};
pub use resolver::{ColumnBinding, SchemaResolver};
