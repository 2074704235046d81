//! Response envelope.

use serde::{Deserialize, Serialize};

use crate::engine::Row;
use crate::request::DeclaredColumn;

/// Column metadata sent back in server-declared mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    #[serde(rename = "mData")]
    pub data: String,
    #[serde(rename = "sTitle", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "bSearchable")]
    pub searchable: bool,
    #[serde(rename = "bSortable")]
    pub sortable: bool,
}

impl From<&DeclaredColumn> for ColumnMeta {
    fn from(column: &DeclaredColumn) -> Self {
        Self {
            data: column.path.clone(),
            title: column.title.clone(),
            searchable: column.searchable,
            sortable: column.sortable,
        }
    }
}

/// One page of a grid, with both counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "sEcho")]
    pub echo: i64,
    #[serde(rename = "iTotalRecords")]
    pub total_records: u64,
    #[serde(rename = "iTotalDisplayRecords")]
    pub total_display_records: u64,
    #[serde(rename = "aaData")]
    pub rows: Vec<Row>,
    #[serde(rename = "aoColumns", default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnMeta>>,
    #[serde(rename = "aoCustomVars", default, skip_serializing_if = "Option::is_none")]
    pub custom_vars: Option<serde_json::Map<String, serde_json::Value>>,
}

/// How a grid hands back its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultFormat {
    /// The typed envelope.
    #[default]
    Envelope,
    /// A `serde_json::Value`.
    Value,
    /// Encoded JSON text.
    Json,
}

/// A grid result in the requested [`ResultFormat`].
#[derive(Debug, Clone, PartialEq)]
pub enum GridOutput {
    Envelope(ResponseEnvelope),
    Value(serde_json::Value),
    Json(String),
}

impl ResponseEnvelope {
    /// Convert into the requested format.
    pub fn into_format(self, format: ResultFormat) -> serde_json::Result<GridOutput> {
        Ok(match format {
            ResultFormat::Envelope => GridOutput::Envelope(self),
            ResultFormat::Value => GridOutput::Value(serde_json::to_value(&self)?),
            ResultFormat::Json => GridOutput::Json(serde_json::to_string(&self)?),
        })
    }
}
