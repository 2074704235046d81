//! Grid configuration loaded from environment variables or TOML.

use std::env;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::plan::builder::PlanOptions;
use crate::plan::joins::JoinKind;

/// Process-wide grid defaults. Individual grids may override any of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Join kind for association hops without an override (default: inner).
    pub default_join_kind: JoinKind,

    /// Compare lower-cased values when searching (default: false).
    pub case_insensitive_search: bool,

    /// Inject `DT_RowId` into every row (default: false).
    pub use_row_id: bool,

    /// Prefix for injected row ids (default: empty).
    pub row_id_prefix: String,

    /// Inject `DT_RowClass` when a row class is set (default: true).
    pub use_row_class: bool,

    /// Static row class.
    pub row_class: Option<String>,

    /// Apply predicate extensions to the total count (default: true).
    pub apply_extensions_to_total: bool,

    /// Cap on the requested page size.
    pub max_display_length: Option<u64>,

    /// Page collection plans over distinct root ids (default: true).
    pub use_distinct_root_paging: bool,

    /// Postgres statement timeout in seconds (default: 10).
    pub statement_timeout_secs: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            default_join_kind: JoinKind::Inner,
            case_insensitive_search: false,
            use_row_id: false,
            row_id_prefix: String::new(),
            use_row_class: true,
            row_class: None,
            apply_extensions_to_total: true,
            max_display_length: None,
            use_distinct_root_paging: true,
            statement_timeout_secs: 10,
        }
    }
}

impl GridConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from a TOML document; missing keys take defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).context("invalid grid configuration")
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let default_join_kind = match lookup("DATAGRID_DEFAULT_JOIN") {
            Some(v) => v
                .parse()
                .context("DATAGRID_DEFAULT_JOIN must be 'inner' or 'left'")?,
            None => defaults.default_join_kind,
        };

        let case_insensitive_search = bool_var(
            &lookup,
            "DATAGRID_CASE_INSENSITIVE",
            defaults.case_insensitive_search,
        )?;
        let use_row_id = bool_var(&lookup, "DATAGRID_ROW_ID", defaults.use_row_id)?;
        let row_id_prefix = lookup("DATAGRID_ROW_ID_PREFIX").unwrap_or_default();
        let use_row_class = bool_var(
            &lookup,
            "DATAGRID_ROW_CLASS_ENABLED",
            defaults.use_row_class,
        )?;
        let row_class = lookup("DATAGRID_ROW_CLASS").filter(|s| !s.is_empty());
        let apply_extensions_to_total = bool_var(
            &lookup,
            "DATAGRID_EXTENSIONS_IN_TOTAL",
            defaults.apply_extensions_to_total,
        )?;

        let max_display_length = lookup("DATAGRID_MAX_DISPLAY_LENGTH")
            .map(|v| v.parse())
            .transpose()
            .context("DATAGRID_MAX_DISPLAY_LENGTH must be a valid u64")?;

        let use_distinct_root_paging = bool_var(
            &lookup,
            "DATAGRID_DISTINCT_ROOT_PAGING",
            defaults.use_distinct_root_paging,
        )?;

        let statement_timeout_secs = lookup("DATAGRID_STATEMENT_TIMEOUT")
            .unwrap_or_else(|| defaults.statement_timeout_secs.to_string())
            .parse()
            .context("DATAGRID_STATEMENT_TIMEOUT must be a valid u64")?;

        Ok(Self {
            default_join_kind,
            case_insensitive_search,
            use_row_id,
            row_id_prefix,
            use_row_class,
            row_class,
            apply_extensions_to_total,
            max_display_length,
            use_distinct_root_paging,
            statement_timeout_secs,
        })
    }

    /// Planner options derived from this configuration.
    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            case_insensitive: self.case_insensitive_search,
            apply_extensions_to_total: self.apply_extensions_to_total,
            max_display_length: self.max_display_length,
            distinct_root_paging: self.use_distinct_root_paging,
        }
    }
}

fn bool_var(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match lookup(key) {
        None => Ok(default),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{key} must be a boolean, got '{v}'"),
        },
    }
}
