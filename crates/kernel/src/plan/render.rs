//! Lowering of plans to PostgreSQL using SeaQuery.
//!
//! Every projected field is selected as `"<alias>.<field>"` so that a flat
//! result row can be hydrated back into nested entities. Parameter values are
//! inlined by SeaQuery, which escapes them.

use std::collections::BTreeMap;

use sea_query::{
    Alias, Cond, Expr, ExprTrait, Func, JoinType, Order, PostgresQueryBuilder, Query,
    SelectStatement, SimpleExpr,
};
use serde_json::Value as JsonValue;

use super::joins::{JoinKind, JoinSpec};
use super::types::{CountQuery, FieldRef, Page, Predicate, QueryPlan, SortDirection};
use crate::error::{GridError, GridResult};

/// Result column label for a projected field.
pub fn column_label(alias: &str, field: &str) -> String {
    format!("{alias}.{field}")
}

/// Render the row query of a plan.
pub fn row_query(plan: &QueryPlan) -> GridResult<String> {
    let mut query = Query::select();

    for group in &plan.select {
        for field in &group.fields {
            query.expr_as(
                col(&group.alias, &field.column),
                Alias::new(column_label(&group.alias, &field.field)),
            );
        }
    }

    query.from_as(Alias::new(&plan.root.table), Alias::new(&plan.root.alias));
    add_joins(&mut query, &plan.joins);

    let filter = plan.filter.combined();
    if let Some(ref predicate) = filter {
        query.and_where(predicate_expr(predicate, &plan.params)?);
    }

    for order in &plan.order {
        query.order_by(
            (Alias::new(&order.field.alias), Alias::new(&order.field.column)),
            sort_order(order.direction),
        );
    }

    match plan.page {
        Some(page) if plan.distinct_root_paging => {
            let window = root_window(plan, filter.as_ref(), page)?;
            query.and_where(
                col(&plan.root.alias, &plan.root.identifier.column).in_subquery(window),
            );
            // Ties keep the window's root order.
            query.order_by(
                (
                    Alias::new(&plan.root.alias),
                    Alias::new(&plan.root.identifier.column),
                ),
                Order::Asc,
            );
        }
        Some(page) => {
            query.limit(page.limit);
            query.offset(page.offset);
        }
        None => {}
    }

    Ok(query.to_string(PostgresQueryBuilder))
}

/// Render a `COUNT(DISTINCT root.id)` query.
pub fn count_query(count: &CountQuery) -> GridResult<String> {
    let mut query = Query::select();

    query.expr(Func::count_distinct(col(
        &count.root.alias,
        &count.root.identifier.column,
    )));
    query.from_as(Alias::new(&count.root.table), Alias::new(&count.root.alias));
    add_joins(&mut query, &count.joins);

    if let Some(ref predicate) = count.filter {
        query.and_where(predicate_expr(predicate, &count.params)?);
    }

    Ok(query.to_string(PostgresQueryBuilder))
}

/// Root ids of the requested page, ordered like the outer query.
///
/// Each root is ranked by the smallest (ascending) or largest (descending)
/// value of every sort column across its joined rows, with the root id as
/// the final tie-breaker.
fn root_window(
    plan: &QueryPlan,
    filter: Option<&Predicate>,
    page: Page,
) -> GridResult<SelectStatement> {
    let root = &plan.root;
    let mut window = Query::select();
    window
        .column((Alias::new(&root.alias), Alias::new(&root.identifier.column)))
        .from_as(Alias::new(&root.table), Alias::new(&root.alias));
    add_joins(&mut window, &plan.joins);

    if let Some(predicate) = filter {
        window.and_where(predicate_expr(predicate, &plan.params)?);
    }

    window.group_by_col((Alias::new(&root.alias), Alias::new(&root.identifier.column)));
    for order in &plan.order {
        let column = col(&order.field.alias, &order.field.column);
        let ranked = match order.direction {
            SortDirection::Asc => column.min(),
            SortDirection::Desc => column.max(),
        };
        window.order_by_expr(ranked, sort_order(order.direction));
    }
    window.order_by(
        (Alias::new(&root.alias), Alias::new(&root.identifier.column)),
        Order::Asc,
    );
    window.limit(page.limit);
    window.offset(page.offset);

    Ok(window)
}

/// Add JOIN clauses. Many-to-many joins go through their link table, which is
/// aliased `<alias>_link`.
fn add_joins(query: &mut SelectStatement, joins: &[JoinSpec]) {
    for join in joins {
        let join_type = match join.kind {
            JoinKind::Inner => JoinType::InnerJoin,
            JoinKind::Left => JoinType::LeftJoin,
        };
        let mapping = &join.mapping;

        match &mapping.through {
            Some(link) => {
                let link_alias = format!("{}_link", join.alias);
                query.join_as(
                    join_type,
                    Alias::new(&link.table),
                    Alias::new(&link_alias),
                    col(&join.owner_alias, &mapping.local_column)
                        .equals((Alias::new(&link_alias), Alias::new(&link.source_column))),
                );
                query.join_as(
                    join_type,
                    Alias::new(&join.table),
                    Alias::new(&join.alias),
                    col(&link_alias, &link.target_column)
                        .equals((Alias::new(&join.alias), Alias::new(&mapping.foreign_column))),
                );
            }
            None => {
                query.join_as(
                    join_type,
                    Alias::new(&join.table),
                    Alias::new(&join.alias),
                    col(&join.owner_alias, &mapping.local_column)
                        .equals((Alias::new(&join.alias), Alias::new(&mapping.foreign_column))),
                );
            }
        }
    }
}

fn predicate_expr(
    predicate: &Predicate,
    params: &BTreeMap<String, JsonValue>,
) -> GridResult<SimpleExpr> {
    let expr = match predicate {
        Predicate::Contains {
            field,
            param,
            case_insensitive,
        } => {
            let pattern = match param_value(params, param)? {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            let target: SimpleExpr = if *case_insensitive {
                Func::lower(field_expr(field)).into()
            } else {
                field_expr(field)
            };
            target.like(pattern)
        }
        Predicate::Equals { field, param } => {
            field_expr(field).eq(sea_value(param_value(params, param)?))
        }
        Predicate::In { field, param } => {
            let values: Vec<sea_query::Value> = match param_value(params, param)? {
                JsonValue::Array(items) => items.iter().map(sea_value).collect(),
                single => vec![sea_value(single)],
            };
            field_expr(field).is_in(values)
        }
        Predicate::IsNull { field } => field_expr(field).is_null(),
        Predicate::IsNotNull { field } => field_expr(field).is_not_null(),
        Predicate::Any(items) => {
            let mut cond = Cond::any();
            for item in items {
                cond = cond.add(predicate_expr(item, params)?);
            }
            cond.into()
        }
        Predicate::All(items) => {
            let mut cond = Cond::all();
            for item in items {
                cond = cond.add(predicate_expr(item, params)?);
            }
            cond.into()
        }
    };
    Ok(expr)
}

fn param_value<'p>(
    params: &'p BTreeMap<String, JsonValue>,
    name: &str,
) -> GridResult<&'p JsonValue> {
    params
        .get(name)
        .ok_or_else(|| GridError::Execution(anyhow::anyhow!("parameter '{name}' is not bound")))
}

fn sea_value(value: &JsonValue) -> sea_query::Value {
    match value {
        JsonValue::Null => sea_query::Value::String(None),
        JsonValue::Bool(b) => (*b).into(),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into()
            } else if let Some(f) = n.as_f64() {
                f.into()
            } else {
                n.to_string().into()
            }
        }
        JsonValue::String(s) => s.clone().into(),
        other => other.to_string().into(),
    }
}

fn col(alias: &str, column: &str) -> Expr {
    Expr::col((Alias::new(alias), Alias::new(column)))
}

fn field_expr(field: &FieldRef) -> SimpleExpr {
    col(&field.alias, &field.column).into()
}

fn sort_order(direction: SortDirection) -> Order {
    match direction {
        SortDirection::Asc => Order::Asc,
        SortDirection::Desc => Order::Desc,
    }
}

/// Escape SQL LIKE wildcard characters (`%`, `_`, `\`) in a value.
pub(crate) fn escape_like_wildcards(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::plan::joins::{JoinRegistry, JoinRequest};
    use crate::plan::types::{FilterTree, OrderBy, RootRef, SelectGroup};
    use crate::schema::metadata::{Association, EntityMetadata, JoinTable};

    fn root() -> RootRef {
        RootRef {
            entity: "Product".to_string(),
            table: "product".to_string(),
            alias: "product".to_string(),
            identifier: FieldRef::new("product", "id", "id"),
        }
    }

    fn joins() -> Vec<JoinSpec> {
        let product = EntityMetadata::new("Product", "product").with_association(
            Association::many_to_many(
                "tags",
                "Tag",
                JoinTable {
                    table: "product_tag".to_string(),
                    source_column: "product_id".to_string(),
                    target_column: "tag_id".to_string(),
                },
            ),
        );
        let tag = EntityMetadata::new("Tag", "tag").with_fields(&["label"]);
        let mut registry = JoinRegistry::new("product", JoinKind::Left);
        registry.register(JoinRequest {
            owner_alias: "product",
            association: product.association("tags").unwrap(),
            target: &tag,
            root_entity: "Product",
            origin_path: "tags",
            column_path: "tags.label",
        });
        registry.specs()
    }

    fn plan() -> QueryPlan {
        let mut product = SelectGroup::new("product");
        product.push("id", "id");
        product.push("unitPrice", "unit_price");
        let mut tag = SelectGroup::new("tag");
        tag.push("id", "id");
        tag.push("label", "label");

        let mut params = BTreeMap::new();
        params.insert("label".to_string(), JsonValue::from("%100\\%%"));
        QueryPlan {
            root: root(),
            select: vec![product, tag],
            joins: joins(),
            filter: FilterTree {
                global: Some(Predicate::Any(vec![Predicate::Contains {
                    field: FieldRef::new("tag", "label", "label"),
                    param: "label".to_string(),
                    case_insensitive: true,
                }])),
                columns: None,
                extra: Vec::new(),
            },
            params,
            order: vec![OrderBy {
                field: FieldRef::new("tag", "label", "label"),
                direction: SortDirection::Desc,
            }],
            page: Some(Page {
                offset: 20,
                limit: 10,
            }),
            distinct_root_paging: false,
        }
    }

    #[test]
    fn row_query_labels_and_joins() {
        let sql = row_query(&plan()).unwrap();
        assert!(sql.contains(r#""product"."unit_price" AS "product.unitPrice""#), "{sql}");
        assert!(sql.contains(r#"FROM "product" AS "product""#), "{sql}");
        assert!(
            sql.contains(r#"LEFT JOIN "product_tag" AS "tag_link" ON "product"."id" = "tag_link"."product_id""#),
            "{sql}"
        );
        assert!(
            sql.contains(r#"LEFT JOIN "tag" AS "tag" ON "tag_link"."tag_id" = "tag"."id""#),
            "{sql}"
        );
        assert!(sql.contains(r#"LOWER("tag"."label") LIKE"#), "{sql}");
        assert!(sql.contains(r#"ORDER BY "tag"."label" DESC"#), "{sql}");
        assert!(sql.contains("LIMIT 10"), "{sql}");
        assert!(sql.contains("OFFSET 20"), "{sql}");
    }

    #[test]
    fn distinct_root_paging_moves_window_into_subquery() {
        let mut plan = plan();
        plan.distinct_root_paging = true;
        let sql = row_query(&plan).unwrap();

        assert!(sql.contains(r#""product"."id" IN (SELECT"#), "{sql}");
        assert!(sql.contains(r#"GROUP BY "product"."id""#), "{sql}");
        assert!(sql.contains(r#"MAX("tag"."label") DESC"#), "{sql}");
        assert!(
            sql.ends_with(r#"ORDER BY "tag"."label" DESC, "product"."id" ASC"#),
            "{sql}"
        );
        // the outer query is unbounded; only the window is limited
        assert_eq!(sql.matches("LIMIT").count(), 1, "{sql}");
    }

    #[test]
    fn count_query_counts_distinct_roots() {
        let count = CountQuery {
            root: root(),
            joins: joins(),
            filter: None,
            params: BTreeMap::new(),
        };
        let sql = count_query(&count).unwrap();
        assert!(sql.starts_with(r#"SELECT COUNT(DISTINCT "product"."id")"#), "{sql}");
        assert!(sql.contains("JOIN"), "{sql}");
        assert!(!sql.contains("WHERE"), "{sql}");
    }

    #[test]
    fn unbound_parameter_fails() {
        let mut plan = plan();
        plan.params.clear();
        assert!(matches!(row_query(&plan), Err(GridError::Execution(_))));
    }

    #[test]
    fn equality_and_membership_values() {
        let mut params = BTreeMap::new();
        params.insert("tenant".to_string(), JsonValue::from(7));
        params.insert("states".to_string(), serde_json::json!(["open", "held"]));
        let predicate = Predicate::All(vec![
            Predicate::Equals {
                field: FieldRef::new("product", "tenantId", "tenant_id"),
                param: "tenant".to_string(),
            },
            Predicate::In {
                field: FieldRef::new("product", "state", "state"),
                param: "states".to_string(),
            },
        ]);
        let count = CountQuery {
            root: root(),
            joins: Vec::new(),
            filter: Some(predicate),
            params,
        };
        let sql = count_query(&count).unwrap();
        assert!(sql.contains(r#""product"."tenant_id" = 7"#), "{sql}");
        assert!(sql.contains(r#""product"."state" IN ('open', 'held')"#), "{sql}");
    }

    #[test]
    fn escape_like_wildcards_function() {
        assert_eq!(escape_like_wildcards("hello"), "hello");
        assert_eq!(escape_like_wildcards("100%"), "100\\%");
        assert_eq!(escape_like_wildcards("a_b"), "a\\_b");
        assert_eq!(escape_like_wildcards("a\\b"), "a\\\\b");
    }
}
