//! Query plan builder.
//!
//! Turns resolved column bindings plus the client's search, sort and paging
//! state into a [`QueryPlan`] and the two count queries that go with it.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use super::extension::{ExtensionRegistry, FilterScope};
use super::joins::JoinRegistry;
use super::render::escape_like_wildcards;
use super::types::{
    CountQuery, FieldRef, FilterTree, OrderBy, Page, Predicate, QueryPlan, RootRef, SelectGroup,
};
use crate::error::{GridError, GridResult};
use crate::request::GridRequest;
use crate::schema::resolver::{ColumnBinding, SchemaResolver};

/// Options that shape a plan without being part of the client request.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Compare `LOWER(column)` with a lower-cased pattern.
    pub case_insensitive: bool,
    /// Apply extension predicates to the total count too.
    pub apply_extensions_to_total: bool,
    /// Upper bound on the page size.
    pub max_display_length: Option<u64>,
    /// Page over distinct root ids when collection joins are present.
    pub distinct_root_paging: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            case_insensitive: false,
            apply_extensions_to_total: true,
            max_display_length: None,
            distinct_root_paging: true,
        }
    }
}

/// A plan together with its count queries.
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    pub bindings: Vec<ColumnBinding>,
    pub plan: QueryPlan,
    /// Distinct root ids, unfiltered (extension predicates optional).
    pub total: CountQuery,
    /// Distinct root ids with every join and the full filter.
    pub filtered: CountQuery,
}

pub struct PlanBuilder<'a> {
    resolver: &'a SchemaResolver<'a>,
    extensions: &'a ExtensionRegistry,
    options: &'a PlanOptions,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        resolver: &'a SchemaResolver<'a>,
        extensions: &'a ExtensionRegistry,
        options: &'a PlanOptions,
    ) -> Self {
        Self {
            resolver,
            extensions,
            options,
        }
    }

    /// Build the plan for `request`.
    ///
    /// `bindings` must line up with `request.columns` and must have been
    /// resolved into `joins`.
    pub fn build(
        &self,
        request: &GridRequest,
        bindings: Vec<ColumnBinding>,
        mut joins: JoinRegistry,
    ) -> GridResult<PlannedQuery> {
        let root = self.root_ref()?;
        let mut params = BTreeMap::new();

        let mut filter = FilterTree {
            global: self.global_search(request, &bindings, &mut params),
            columns: self.column_search(request, &bindings, &mut params),
            extra: Vec::new(),
        };

        for extension in self.extensions.predicates() {
            let name = extension.name();
            let mut scope = FilterScope::new(name, self.resolver, &mut joins, &mut params);
            extension
                .apply(&mut scope)
                .map_err(|e| GridError::contract(name, format!("{e:#}")))?;
            let predicates = scope.finish()?;
            tracing::debug!(
                extension = name,
                predicates = predicates.len(),
                "applied predicate extension"
            );
            filter.extra.extend(predicates);
        }

        let select = self.select_groups(&root, &bindings, &joins);
        let order = self.order(request, &bindings);
        let page = self.page(request);

        let filtered = CountQuery {
            root: root.clone(),
            joins: joins.specs(),
            params: referenced_params(filter.combined().as_ref(), &params),
            filter: filter.combined(),
        };
        let total = self.total_count(&root, &filter, &joins, &params);

        let distinct_root_paging =
            self.options.distinct_root_paging && page.is_some() && joins.has_collection();

        tracing::debug!(
            root = %root.entity,
            columns = bindings.len(),
            joins = joins.len(),
            filtered = !filter.is_empty(),
            distinct_root_paging,
            "built query plan"
        );

        let plan = QueryPlan {
            root,
            select,
            joins: joins.specs(),
            filter,
            params,
            order,
            page,
            distinct_root_paging,
        };

        Ok(PlannedQuery {
            bindings,
            plan,
            total,
            filtered,
        })
    }

    fn root_ref(&self) -> GridResult<RootRef> {
        let entity = self.resolver.root();
        let Some(id) = entity.primary_identifier() else {
            return Err(GridError::Config(format!(
                "entity '{}' has no identifier",
                entity.name
            )));
        };
        let alias = self.resolver.root_alias();
        Ok(RootRef {
            entity: entity.name.clone(),
            table: entity.table.clone(),
            alias: alias.to_string(),
            identifier: FieldRef::new(alias, id, &entity.column_name(id)),
        })
    }

    /// One OR-group across every searchable column, or nothing when the
    /// global search string is empty.
    fn global_search(
        &self,
        request: &GridRequest,
        bindings: &[ColumnBinding],
        params: &mut BTreeMap<String, Value>,
    ) -> Option<Predicate> {
        if request.search.is_empty() {
            return None;
        }
        let pattern = self.like_pattern(&request.search);
        let predicates: Vec<Predicate> = request
            .columns
            .iter()
            .zip(bindings)
            .filter(|(column, _)| column.searchable)
            .map(|(column, binding)| {
                let param = param_name("global", binding, column.index);
                params.insert(param.clone(), Value::String(pattern.clone()));
                self.contains(binding, param)
            })
            .collect();
        (!predicates.is_empty()).then_some(Predicate::Any(predicates))
    }

    /// One AND-group of the per-column search strings.
    fn column_search(
        &self,
        request: &GridRequest,
        bindings: &[ColumnBinding],
        params: &mut BTreeMap<String, Value>,
    ) -> Option<Predicate> {
        let predicates: Vec<Predicate> = request
            .columns
            .iter()
            .zip(bindings)
            .filter(|(column, _)| column.searchable && !column.search_value.is_empty())
            .map(|(column, binding)| {
                let param = param_name("single", binding, column.index);
                let pattern = self.like_pattern(&column.search_value);
                params.insert(param.clone(), Value::String(pattern));
                self.contains(binding, param)
            })
            .collect();
        (!predicates.is_empty()).then_some(Predicate::All(predicates))
    }

    fn contains(&self, binding: &ColumnBinding, param: String) -> Predicate {
        Predicate::Contains {
            field: binding.field_ref(),
            param,
            case_insensitive: self.options.case_insensitive,
        }
    }

    fn like_pattern(&self, value: &str) -> String {
        let pattern = format!("%{}%", escape_like_wildcards(value));
        if self.options.case_insensitive {
            pattern.to_lowercase()
        } else {
            pattern
        }
    }

    /// Root group first, then one group per join in join order. Each group
    /// starts with its entity's identifier fields.
    fn select_groups(
        &self,
        root: &RootRef,
        bindings: &[ColumnBinding],
        joins: &JoinRegistry,
    ) -> Vec<SelectGroup> {
        let root_entity = self.resolver.root();
        let mut root_group = SelectGroup::new(&root.alias);
        for id in &root_entity.identifiers {
            root_group.push(id, &root_entity.column_name(id));
        }
        let mut groups = vec![root_group];

        for join in joins.iter() {
            let mut group = SelectGroup::new(&join.alias);
            let entity = self.resolver.schema().entity(&join.entity);
            for id in &join.identifiers {
                let column = entity.map_or_else(
                    || crate::schema::naming::snake_case(id),
                    |e| e.column_name(id),
                );
                group.push(id, &column);
            }
            groups.push(group);
        }

        for binding in bindings {
            if let Some(group) = groups.iter_mut().find(|g| g.alias == binding.join_alias) {
                group.push(&binding.field_name, &binding.column_name);
            }
        }
        groups
    }

    fn order(&self, request: &GridRequest, bindings: &[ColumnBinding]) -> Vec<OrderBy> {
        let mut order = Vec::with_capacity(request.sorts.len());
        for sort in &request.sorts {
            let sortable = request.columns.get(sort.column).is_some_and(|c| c.sortable);
            match bindings.get(sort.column) {
                Some(binding) if sortable => order.push(OrderBy {
                    field: binding.field_ref(),
                    direction: sort.direction,
                }),
                _ => {
                    tracing::debug!(
                        column = sort.column,
                        "ignoring sort on unknown or unsortable column"
                    );
                }
            }
        }
        order
    }

    fn page(&self, request: &GridRequest) -> Option<Page> {
        let offset = request.display_start;
        let cap = self.options.max_display_length;
        match (request.page_size(), cap) {
            (None, None) => None,
            (None, Some(cap)) => {
                tracing::warn!(cap, "unbounded page requested; clamping to maximum page size");
                Some(Page { offset, limit: cap })
            }
            (Some(limit), Some(cap)) if limit > cap => {
                tracing::warn!(requested = limit, cap, "page size clamped to maximum");
                Some(Page { offset, limit: cap })
            }
            (Some(limit), _) => Some(Page { offset, limit }),
        }
    }

    fn total_count(
        &self,
        root: &RootRef,
        filter: &FilterTree,
        joins: &JoinRegistry,
        params: &BTreeMap<String, Value>,
    ) -> CountQuery {
        let extra = if self.options.apply_extensions_to_total {
            filter.extra_only()
        } else {
            None
        };
        let joins = match &extra {
            Some(predicate) => joins.closure(predicate.aliases()),
            None => Vec::new(),
        };
        CountQuery {
            root: root.clone(),
            joins,
            params: referenced_params(extra.as_ref(), params),
            filter: extra,
        }
    }
}

/// `sSearch_<scope>_<alias>_<field>_<index>`; the index keeps names unique
/// when the same field is requested twice.
fn param_name(scope: &str, binding: &ColumnBinding, index: usize) -> String {
    format!(
        "sSearch_{scope}_{}_{}_{index}",
        binding.entity_alias, binding.field_name
    )
}

fn referenced_params(
    filter: Option<&Predicate>,
    params: &BTreeMap<String, Value>,
) -> BTreeMap<String, Value> {
    let Some(filter) = filter else {
        return BTreeMap::new();
    };
    let names: BTreeSet<&str> = filter.params().into_iter().collect();
    params
        .iter()
        .filter(|(name, _)| names.contains(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::plan::extension::PredicateFn;
    use crate::plan::joins::JoinKind;
    use crate::plan::types::SortDirection;
    use crate::request::{ColumnRequest, SortRequest};
    use crate::schema::metadata::{Association, EntityMetadata, SchemaCatalog};

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::new()
            .with_entity(
                EntityMetadata::new("Order", "orders")
                    .with_fields(&["reference", "tenantId"])
                    .with_association(Association::many_to_one(
                        "customer",
                        "Customer",
                        "customer_id",
                    ))
                    .with_association(Association::one_to_many("lines", "OrderLine", "order_id")),
            )
            .with_entity(EntityMetadata::new("Customer", "customer").with_fields(&["name"]))
            .with_entity(EntityMetadata::new("OrderLine", "order_line").with_fields(&["sku"]))
    }

    fn column(index: usize, path: &str) -> ColumnRequest {
        ColumnRequest {
            raw_path: path.to_string(),
            index,
            searchable: true,
            sortable: true,
            search_value: String::new(),
        }
    }

    fn request(paths: &[&str]) -> GridRequest {
        GridRequest {
            echo: 1,
            columns: paths.iter().enumerate().map(|(i, p)| column(i, p)).collect(),
            search: String::new(),
            display_start: 0,
            display_length: 10,
            sorts: Vec::new(),
        }
    }

    fn plan(
        schema: &SchemaCatalog,
        req: &GridRequest,
        extensions: &ExtensionRegistry,
        options: &PlanOptions,
    ) -> PlannedQuery {
        let resolver = SchemaResolver::new(schema, "Order").unwrap();
        let mut joins = JoinRegistry::new(resolver.root_alias(), JoinKind::Inner);
        let bindings = resolver
            .resolve_all(req.columns.iter().map(|c| c.raw_path.as_str()), &mut joins)
            .unwrap();
        PlanBuilder::new(&resolver, extensions, options)
            .build(req, bindings, joins)
            .unwrap()
    }

    #[test]
    fn identifiers_are_selected_first() {
        let schema = catalog();
        let planned = plan(
            &schema,
            &request(&["reference", "customer.name"]),
            &ExtensionRegistry::new(),
            &PlanOptions::default(),
        );
        assert_eq!(planned.plan.group("orders").unwrap().field_names(), ["id", "reference"]);
        assert_eq!(planned.plan.group("customer").unwrap().field_names(), ["id", "name"]);
    }

    #[test]
    fn global_search_binds_distinct_params() {
        let schema = catalog();
        let mut req = request(&["reference", "customer.name", "reference"]);
        req.search = "50%".to_string();
        req.columns[1].searchable = false;

        let planned = plan(&schema, &req, &ExtensionRegistry::new(), &PlanOptions::default());
        let Some(Predicate::Any(parts)) = &planned.plan.filter.global else {
            panic!("expected an OR-group");
        };
        assert_eq!(parts.len(), 2);
        let params: BTreeSet<&str> = parts.iter().flat_map(Predicate::params).collect();
        assert_eq!(params.len(), 2);
        assert_eq!(
            planned.plan.params.get("sSearch_global_orders_reference_0"),
            Some(&Value::from("%50\\%%"))
        );
        assert!(planned.plan.filter.columns.is_none());
    }

    #[test]
    fn case_insensitive_lowers_pattern() {
        let schema = catalog();
        let mut req = request(&["customer.name"]);
        req.columns[0].search_value = "ACME".to_string();
        let options = PlanOptions {
            case_insensitive: true,
            ..PlanOptions::default()
        };

        let planned = plan(&schema, &req, &ExtensionRegistry::new(), &options);
        assert_eq!(
            planned.plan.params.get("sSearch_single_customer_name_0"),
            Some(&Value::from("%acme%"))
        );
        assert!(matches!(
            planned.plan.filter.columns,
            Some(Predicate::All(ref v)) if matches!(v[0], Predicate::Contains { case_insensitive: true, .. })
        ));
    }

    #[test]
    fn sorting_skips_unsortable_and_unknown_columns() {
        let schema = catalog();
        let mut req = request(&["reference", "customer.name"]);
        req.columns[0].sortable = false;
        req.sorts = vec![
            SortRequest { column: 0, direction: SortDirection::Asc },
            SortRequest { column: 1, direction: SortDirection::Desc },
            SortRequest { column: 7, direction: SortDirection::Asc },
        ];

        let planned = plan(&schema, &req, &ExtensionRegistry::new(), &PlanOptions::default());
        assert_eq!(planned.plan.order.len(), 1);
        assert_eq!(planned.plan.order[0].fully_qualified(), "customer.name");
        assert_eq!(planned.plan.order[0].direction, SortDirection::Desc);
    }

    #[test]
    fn paging_and_cap() {
        let schema = catalog();
        let mut req = request(&["reference"]);
        req.display_start = 20;
        let planned = plan(&schema, &req, &ExtensionRegistry::new(), &PlanOptions::default());
        assert_eq!(planned.plan.page, Some(Page { offset: 20, limit: 10 }));

        req.display_length = -1;
        let planned = plan(&schema, &req, &ExtensionRegistry::new(), &PlanOptions::default());
        assert_eq!(planned.plan.page, None);

        let capped = PlanOptions {
            max_display_length: Some(5),
            ..PlanOptions::default()
        };
        let planned = plan(&schema, &req, &ExtensionRegistry::new(), &capped);
        assert_eq!(planned.plan.page, Some(Page { offset: 20, limit: 5 }));
    }

    #[test]
    fn extensions_reach_total_count_with_their_joins() {
        let schema = catalog();
        let mut extensions = ExtensionRegistry::new();
        extensions
            .add_predicate(Box::new(PredicateFn::new("customer_scope", |scope| {
                scope.equals("customer.name", "scope_name", "acme")
            })))
            .unwrap();
        let mut req = request(&["reference", "lines.sku"]);
        req.search = "x".to_string();

        let planned = plan(&schema, &req, &extensions, &PlanOptions::default());
        assert_eq!(planned.plan.filter.extra.len(), 1);
        let total_joins: Vec<&str> = planned.total.joins.iter().map(|j| j.alias.as_str()).collect();
        assert_eq!(total_joins, ["customer"]);
        assert_eq!(planned.total.params.len(), 1);
        assert_eq!(planned.filtered.joins.len(), 2);
        assert!(planned.plan.group("customer").is_some());

        let hidden = PlanOptions {
            apply_extensions_to_total: false,
            ..PlanOptions::default()
        };
        let planned = plan(&schema, &req, &extensions, &hidden);
        assert!(planned.total.filter.is_none());
        assert!(planned.total.joins.is_empty());
    }

    #[test]
    fn failing_extension_is_a_contract_error() {
        let schema = catalog();
        let mut extensions = ExtensionRegistry::new();
        extensions
            .add_predicate(Box::new(PredicateFn::new("broken", |scope| {
                scope.equals("supplier.name", "p", "x")
            })))
            .unwrap();
        let req = request(&["reference"]);

        let resolver = SchemaResolver::new(&schema, "Order").unwrap();
        let mut joins = JoinRegistry::new(resolver.root_alias(), JoinKind::Inner);
        let bindings = resolver.resolve_all(["reference"], &mut joins).unwrap();
        let options = PlanOptions::default();
        let err = PlanBuilder::new(&resolver, &extensions, &options)
            .build(&req, bindings, joins)
            .unwrap_err();
        assert!(matches!(
            err,
            GridError::CallbackContract { ref extension, .. } if extension == "broken"
        ));
    }

    #[test]
    fn collection_joins_enable_distinct_root_paging() {
        let schema = catalog();
        let planned = plan(
            &schema,
            &request(&["reference", "lines.sku"]),
            &ExtensionRegistry::new(),
            &PlanOptions::default(),
        );
        assert!(planned.plan.distinct_root_paging);

        let planned = plan(
            &schema,
            &request(&["reference", "customer.name"]),
            &ExtensionRegistry::new(),
            &PlanOptions::default(),
        );
        assert!(!planned.plan.distinct_root_paging);
    }
}
