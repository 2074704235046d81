//! Datagrid Kernel Library
//!
//! Server-side processing for paged, sortable, searchable grid requests.
//! A request names columns as dotted paths relative to a root entity; the
//! kernel resolves them against schema metadata, plans the joins, filters,
//! ordering and paging, runs the plan through a [`engine::QueryEngine`] and
//! shapes the nested rows into the grid response envelope.
//!
//! The `datagrid` binary exposes the planner on the command line.

pub mod config;
pub mod datatable;
pub mod engine;
pub mod error;
pub mod plan;
pub mod request;
pub mod response;
pub mod schema;
pub mod shape;

pub use config::GridConfig;
pub use datatable::{Datatable, DatatableManager, PreparedQuery};
pub use engine::{PgQueryEngine, QueryEngine, Row};
pub use error::{GridError, GridResult, SchemaFailure};
pub use request::{DeclaredColumn, GridRequest};
pub use response::{GridOutput, ResponseEnvelope, ResultFormat};
pub use schema::{SchemaCatalog, SchemaMetadata};
