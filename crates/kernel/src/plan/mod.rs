//! Query planning: joins, filters, ordering and paging for one grid request.

pub mod builder;
pub mod extension;
pub mod joins;
pub mod render;
pub mod types;

pub use builder::{PlanBuilder, PlanOptions, PlannedQuery};
pub use extension::{
    ExtensionRegistry, FilterScope, PredicateCollection, PredicateExtension, PredicateFn,
    ValueFilter, ValueFn,
};
pub use joins::{JoinKind, JoinRegistry, JoinSpec};
pub use types::{
    CountQuery, FieldRef, FilterTree, OrderBy, Page, Predicate, QueryPlan, RootRef, SelectGroup,
    SortDirection,
};
