//! Result shaping.
//!
//! Engines return one nested mapping per root record, with collection-valued
//! associations as lists of child mappings. Shaping makes every requested
//! column addressable by its path: synthetic row id / row class fields are
//! injected, value filters run, and lists crossed by a collection column are
//! merged into a single mapping whose colliding values are gathered into
//! lists, so `orders.tags` reads as one flat list per row.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::engine::Row;
use crate::error::{GridError, GridResult};
use crate::plan::extension::ExtensionRegistry;
use crate::schema::resolver::ColumnBinding;

/// Key of the injected row id.
pub const ROW_ID_KEY: &str = "DT_RowId";
/// Key of the injected row class.
pub const ROW_CLASS_KEY: &str = "DT_RowClass";

/// Per-request shaping settings.
#[derive(Debug, Clone, Copy)]
pub struct ShapeOptions<'a> {
    /// Static class injected into every row.
    pub row_class: Option<&'a str>,
    /// When set, `prefix + row[root_identifier]` is injected as the row id.
    pub row_id_prefix: Option<&'a str>,
    /// Root identifier field, as it appears in the row.
    pub root_identifier: &'a str,
    pub extensions: &'a ExtensionRegistry,
}

/// Shape one row. A column requested more than once is shaped once.
pub fn shape(
    mut row: Row,
    bindings: &[ColumnBinding],
    options: &ShapeOptions<'_>,
) -> GridResult<Row> {
    if let Some(class) = options.row_class {
        row.insert(ROW_CLASS_KEY.to_string(), Value::String(class.to_string()));
    }
    if let Some(prefix) = options.row_id_prefix {
        match row.get(options.root_identifier).and_then(scalar_text) {
            Some(id) => {
                row.insert(ROW_ID_KEY.to_string(), Value::String(format!("{prefix}{id}")));
            }
            None => {
                tracing::debug!(
                    identifier = options.root_identifier,
                    "row has no identifier; row id not injected"
                );
            }
        }
    }

    let mut shaped: HashSet<&[String]> = HashSet::with_capacity(bindings.len());
    for binding in bindings {
        if !shaped.insert(binding.segments.as_slice()) {
            continue;
        }
        let mut filter = |value: Value| apply_filters(value, binding, options.extensions);
        if binding.contains_collection_hop {
            let node = std::mem::take(&mut row);
            let shaped_node =
                shape_collection_path(Value::Object(node), &binding.segments, &mut filter)?;
            row = match shaped_node {
                Value::Object(map) => map,
                _ => Map::new(),
            };
        } else {
            shape_path(&mut row, &binding.segments, &mut filter)?;
        }
    }

    Ok(row)
}

/// Shape every row.
pub fn shape_all(
    rows: Vec<Row>,
    bindings: &[ColumnBinding],
    options: &ShapeOptions<'_>,
) -> GridResult<Vec<Row>> {
    rows.into_iter()
        .map(|row| shape(row, bindings, options))
        .collect()
}

/// Run the value filters registered for a column, in order.
fn apply_filters(
    mut value: Value,
    binding: &ColumnBinding,
    extensions: &ExtensionRegistry,
) -> GridResult<Value> {
    for filter in extensions.value_filters_for(&binding.raw_path) {
        value = filter
            .apply(value)
            .map_err(|e| GridError::contract(filter.name(), format!("{e:#}")))?;
        if !binding.contains_collection_hop && (value.is_object() || value.is_array()) {
            return Err(GridError::contract(
                filter.name(),
                format!("column '{}' expects a scalar value", binding.raw_path),
            ));
        }
    }
    Ok(value)
}

/// Ensure a to-one path exists and filter its leaf in place. Missing or null
/// intermediate entities become empty mappings.
fn shape_path<F>(row: &mut Row, segments: &[String], filter: &mut F) -> GridResult<()>
where
    F: FnMut(Value) -> GridResult<Value>,
{
    let Some((leaf, hops)) = segments.split_last() else {
        return Ok(());
    };

    let mut node = row;
    for hop in hops {
        let entry = node
            .entry(hop.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => node = map,
            _ => {
                tracing::warn!(
                    segment = %hop,
                    "expected a mapping while shaping; column left as is"
                );
                return Ok(());
            }
        }
    }

    let value = node.remove(leaf).unwrap_or(Value::Null);
    node.insert(leaf.clone(), filter(value)?);
    Ok(())
}

/// Walk a path that crosses a collection, merging lists of mappings as they
/// are met, and filter the leaf. Returns the rewritten node.
fn shape_collection_path<F>(node: Value, segments: &[String], filter: &mut F) -> GridResult<Value>
where
    F: FnMut(Value) -> GridResult<Value>,
{
    let Some((head, rest)) = segments.split_first() else {
        return Ok(node);
    };

    let mut map = match node {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        Value::Array(items) if items.iter().all(Value::is_object) => match merge_all(items) {
            Value::Object(map) => map,
            _ => Map::new(),
        },
        other => {
            tracing::warn!(segment = %head, "expected a mapping while shaping; column left as is");
            return Ok(other);
        }
    };

    let child = map.remove(head).unwrap_or(Value::Null);
    let child = if rest.is_empty() {
        filter(child)?
    } else {
        shape_collection_path(child, rest, filter)?
    };
    map.insert(head.clone(), child);
    Ok(Value::Object(map))
}

/// Merge two values structurally.
///
/// Lists are concatenated, mappings are merged key by key, and any other
/// pair is gathered into a list.
pub fn merge_values(left: Value, right: Value) -> Value {
    match (left, right) {
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Value::Array(a)
        }
        (Value::Object(mut a), Value::Object(b)) => {
            for (key, value) in b {
                let merged = match a.remove(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => value,
                };
                a.insert(key, merged);
            }
            Value::Object(a)
        }
        (Value::Array(mut a), other) => {
            a.push(other);
            Value::Array(a)
        }
        (other, Value::Array(b)) => {
            let mut a = Vec::with_capacity(b.len() + 1);
            a.push(other);
            a.extend(b);
            Value::Array(a)
        }
        (a, b) => Value::Array(vec![a, b]),
    }
}

/// Merge a list of values left to right. An empty list merges to an empty
/// mapping.
pub fn merge_all(items: Vec<Value>) -> Value {
    let mut items = items.into_iter();
    let Some(first) = items.next() else {
        return Value::Object(Map::new());
    };
    items.fold(first, merge_values)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::plan::extension::ValueFn;

    fn binding(path: &str, collection: bool) -> ColumnBinding {
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        let field = segments.last().cloned().unwrap();
        ColumnBinding {
            raw_path: path.to_string(),
            segments,
            entity_alias: "x".to_string(),
            entity: "X".to_string(),
            field_name: field.clone(),
            column_name: field.clone(),
            join_alias: "x".to_string(),
            fully_qualified_name: format!("x.{field}"),
            contains_collection_hop: collection,
        }
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("row must be an object"),
        }
    }

    fn options(extensions: &ExtensionRegistry) -> ShapeOptions<'_> {
        ShapeOptions {
            row_class: None,
            row_id_prefix: None,
            root_identifier: "id",
            extensions,
        }
    }

    #[test]
    fn merge_concatenates_lists_and_gathers_scalars() {
        let merged = merge_all(vec![
            json!({"amount": 5, "tags": ["a"]}),
            json!({"amount": 7, "tags": ["b"]}),
        ]);
        assert_eq!(merged, json!({"amount": [5, 7], "tags": ["a", "b"]}));
        assert_eq!(merge_all(Vec::new()), json!({}));
        assert_eq!(
            merge_values(json!({"a": {"b": 1}}), json!({"a": {"c": 2}})),
            json!({"a": {"b": 1, "c": 2}})
        );
    }

    #[test]
    fn collection_column_is_merged() {
        let extensions = ExtensionRegistry::new();
        let raw = row(json!({
            "id": 1,
            "orders": [{"amount": 5, "tags": ["a"]}, {"amount": 7, "tags": ["b"]}]
        }));
        let shaped = shape(raw, &[binding("orders.tags", true)], &options(&extensions)).unwrap();
        assert_eq!(shaped["orders"]["tags"], json!(["a", "b"]));
    }

    #[test]
    fn missing_fields_default_to_null() {
        let extensions = ExtensionRegistry::new();
        let raw = row(json!({"id": 1, "customer": null}));
        let shaped = shape(
            raw,
            &[binding("reference", false), binding("customer.name", false)],
            &options(&extensions),
        )
        .unwrap();
        assert_eq!(
            Value::Object(shaped),
            json!({"id": 1, "reference": null, "customer": {"name": null}})
        );
    }

    #[test]
    fn row_id_and_class_injection() {
        let extensions = ExtensionRegistry::new();
        let opts = ShapeOptions {
            row_class: Some("gradeA"),
            row_id_prefix: Some("row_"),
            ..options(&extensions)
        };
        let shaped = shape(row(json!({"id": 42})), &[binding("id", false)], &opts).unwrap();
        assert_eq!(shaped[ROW_ID_KEY], json!("row_42"));
        assert_eq!(shaped[ROW_CLASS_KEY], json!("gradeA"));
    }

    #[test]
    fn shaping_plain_rows_is_idempotent() {
        let extensions = ExtensionRegistry::new();
        let bindings = [binding("id", false), binding("customer.name", false)];
        let raw = row(json!({"id": 1, "customer": {"id": 9, "name": "Acme"}}));
        let once = shape(raw, &bindings, &options(&extensions)).unwrap();
        let twice = shape(once.clone(), &bindings, &options(&extensions)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn value_filters_run_in_order() {
        let mut extensions = ExtensionRegistry::new();
        extensions
            .add_value_filter(
                "customer.name",
                Box::new(ValueFn::new("upper", |v| {
                    Ok(Value::String(v.as_str().unwrap_or_default().to_uppercase()))
                })),
            )
            .unwrap();
        extensions
            .add_value_filter(
                "customer.name",
                Box::new(ValueFn::new("bracket", |v| {
                    Ok(Value::String(format!("[{}]", v.as_str().unwrap_or_default())))
                })),
            )
            .unwrap();
        let shaped = shape(
            row(json!({"id": 1, "customer": {"name": "acme"}})),
            &[binding("customer.name", false)],
            &options(&extensions),
        )
        .unwrap();
        assert_eq!(shaped["customer"]["name"], json!("[ACME]"));
    }

    #[test]
    fn non_scalar_filter_result_is_a_contract_error() {
        let mut extensions = ExtensionRegistry::new();
        extensions
            .add_value_filter("reference", Box::new(ValueFn::new("explode", |v| Ok(json!([v])))))
            .unwrap();
        let err = shape(
            row(json!({"id": 1, "reference": "A-1"})),
            &[binding("reference", false)],
            &options(&extensions),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            GridError::CallbackContract { ref extension, .. } if extension == "explode"
        ));
    }
}
