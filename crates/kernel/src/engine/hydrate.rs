//! Flat row hydration.
//!
//! A joined SQL result has one row per (root, child, grandchild...)
//! combination, with every projected field labelled `"<alias>.<field>"`.
//! Hydration folds those rows back into one nested row per root record,
//! keyed by association name, deduplicating entities by identifier.

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::Row;
use crate::plan::render::column_label;
use crate::plan::types::QueryPlan;

/// Fold flat labelled rows into nested rows, preserving first-seen order.
pub fn hydrate(plan: &QueryPlan, flat: Vec<Row>) -> Vec<Row> {
    let tree = AliasTree::build(plan, &plan.root.alias, "", false);

    let mut roots: Vec<Node> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in &flat {
        let position = match tree.key(row) {
            Some(key) => *index.entry(key).or_insert_with(|| {
                roots.push(Node::new(&tree, row));
                roots.len() - 1
            }),
            None => {
                roots.push(Node::new(&tree, row));
                roots.len() - 1
            }
        };
        if let Some(node) = roots.get_mut(position) {
            node.absorb(&tree, row);
        }
    }

    roots.into_iter().map(|node| node.into_row(&tree)).collect()
}

/// Select-list layout of one alias and the joins hanging off it.
struct AliasTree {
    /// Association name on the owner; empty for the root.
    association: String,
    collection: bool,
    /// (result label, field name)
    fields: Vec<(String, String)>,
    /// Result labels of the identifier fields.
    identifiers: Vec<String>,
    children: Vec<AliasTree>,
}

impl AliasTree {
    fn build(plan: &QueryPlan, alias: &str, association: &str, collection: bool) -> Self {
        let fields: Vec<(String, String)> = plan
            .group(alias)
            .map(|g| {
                g.fields
                    .iter()
                    .map(|f| (column_label(alias, &f.field), f.field.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let identifier_fields: Vec<String> = if alias == plan.root.alias {
            vec![plan.root.identifier.field.clone()]
        } else {
            plan.joins
                .iter()
                .find(|j| j.alias == alias)
                .map(|j| j.identifiers.clone())
                .unwrap_or_default()
        };
        let identifiers = identifier_fields
            .iter()
            .map(|f| column_label(alias, f))
            .collect();

        let children = plan
            .joins
            .iter()
            .filter(|j| j.owner_alias == alias)
            .map(|j| Self::build(plan, &j.alias, &j.association, j.collection))
            .collect();

        Self {
            association: association.to_string(),
            collection,
            fields,
            identifiers,
            children,
        }
    }

    /// Identity of the entity in `row`, or `None` when it is absent (every
    /// identifier null, as produced by a LEFT JOIN miss).
    fn key(&self, row: &Row) -> Option<String> {
        let values: Vec<&Value> = self
            .identifiers
            .iter()
            .map(|label| row.get(label).unwrap_or(&Value::Null))
            .collect();
        if values.iter().all(|v| v.is_null()) {
            return None;
        }
        serde_json::to_string(&values).ok()
    }

    fn fields(&self, row: &Row) -> Map<String, Value> {
        self.fields
            .iter()
            .map(|(label, field)| (field.clone(), row.get(label).cloned().unwrap_or(Value::Null)))
            .collect()
    }
}

enum Slot {
    One(Option<Box<Node>>),
    Many {
        nodes: Vec<Node>,
        index: HashMap<String, usize>,
    },
}

struct Node {
    fields: Map<String, Value>,
    /// Aligned with the tree's children.
    children: Vec<Slot>,
}

impl Node {
    fn new(tree: &AliasTree, row: &Row) -> Self {
        let children = tree
            .children
            .iter()
            .map(|child| {
                if child.collection {
                    Slot::Many {
                        nodes: Vec::new(),
                        index: HashMap::new(),
                    }
                } else {
                    Slot::One(None)
                }
            })
            .collect();
        Self {
            fields: tree.fields(row),
            children,
        }
    }

    fn absorb(&mut self, tree: &AliasTree, row: &Row) {
        for (slot, child) in self.children.iter_mut().zip(&tree.children) {
            let Some(key) = child.key(row) else {
                continue;
            };
            match slot {
                Slot::One(existing) => {
                    let node = existing.get_or_insert_with(|| Box::new(Node::new(child, row)));
                    node.absorb(child, row);
                }
                Slot::Many { nodes, index } => {
                    let position = *index.entry(key).or_insert_with(|| {
                        nodes.push(Node::new(child, row));
                        nodes.len() - 1
                    });
                    if let Some(node) = nodes.get_mut(position) {
                        node.absorb(child, row);
                    }
                }
            }
        }
    }

    fn into_row(self, tree: &AliasTree) -> Row {
        let mut row = self.fields;
        for (slot, child) in self.children.into_iter().zip(&tree.children) {
            let value = match slot {
                Slot::One(Some(node)) => Value::Object(node.into_row(child)),
                Slot::One(None) => Value::Null,
                Slot::Many { nodes, .. } => Value::Array(
                    nodes
                        .into_iter()
                        .map(|n| Value::Object(n.into_row(child)))
                        .collect(),
                ),
            };
            row.insert(child.association.clone(), value);
        }
        row
    }
}
