//! Grid request parsing.
//!
//! The client sends its paging, sorting and search state as flat
//! DataTables-style parameters (`iColumns`, `mDataProp_0`, `sSearch`,
//! `iSortCol_0`, ...). [`GridRequest`] is the typed form.
//!
//! Two modes are supported. In client-declared mode the column list comes
//! from the request itself. In server-declared mode the caller registers the
//! columns and the request only drives paging, sorting and search; missing
//! paging, sort or echo keys are rejected.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{GridError, GridResult};
use crate::plan::types::SortDirection;

/// One requested column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnRequest {
    /// Dotted column path (`customer.location.address`).
    pub raw_path: String,
    /// Position in the request.
    pub index: usize,
    pub searchable: bool,
    pub sortable: bool,
    /// Per-column search string; empty when absent.
    pub search_value: String,
}

/// One sort directive, in client order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SortRequest {
    /// Index into the request's columns.
    pub column: usize,
    pub direction: SortDirection,
}

/// A column registered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredColumn {
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_true")]
    pub searchable: bool,
    #[serde(default = "default_true")]
    pub sortable: bool,
}

fn default_true() -> bool {
    true
}

impl DeclaredColumn {
    /// Searchable and sortable column without a title.
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            title: None,
            searchable: true,
            sortable: true,
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn searchable(mut self, searchable: bool) -> Self {
        self.searchable = searchable;
        self
    }

    pub fn sortable(mut self, sortable: bool) -> Self {
        self.sortable = sortable;
        self
    }
}

/// Parsed grid request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GridRequest {
    /// Correlation token reflected back to the client.
    pub echo: i64,
    pub columns: Vec<ColumnRequest>,
    /// Global search string; empty when absent.
    pub search: String,
    pub display_start: u64,
    /// `-1` requests every row.
    pub display_length: i64,
    pub sorts: Vec<SortRequest>,
}

impl GridRequest {
    /// Parse a request whose column list is declared by the client.
    pub fn from_params(params: &HashMap<String, String>) -> GridResult<Self> {
        let count: usize = required(params, "iColumns")?;

        let mut columns = Vec::with_capacity(count.min(params.len()));
        for index in 0..count {
            let key = format!("mDataProp_{index}");
            let Some(path) = params.get(&key) else {
                return Err(GridError::RequestShape(format!("missing '{key}'")));
            };
            columns.push(ColumnRequest {
                raw_path: path.trim().to_string(),
                index,
                searchable: flag(params, &format!("bSearchable_{index}")),
                sortable: flag(params, &format!("bSortable_{index}")),
                search_value: text(params, &format!("sSearch_{index}")),
            });
        }

        Ok(Self {
            echo: echo(params),
            columns,
            search: text(params, "sSearch"),
            display_start: optional(params, "iDisplayStart")?.unwrap_or(0),
            display_length: display_length(optional(params, "iDisplayLength")?.unwrap_or(-1))?,
            sorts: sorts(params, false)?,
        })
    }

    /// Parse a request against server-declared columns.
    ///
    /// `sEcho`, `iDisplayStart`, `iDisplayLength`, `iSortingCols` and every
    /// announced sort directive are required.
    pub fn from_params_with_columns(
        params: &HashMap<String, String>,
        declared: &[DeclaredColumn],
    ) -> GridResult<Self> {
        for key in ["sEcho", "iDisplayStart", "iDisplayLength", "iSortingCols"] {
            if !params.contains_key(key) {
                return Err(GridError::RequestShape(format!("missing '{key}'")));
            }
        }

        let columns = declared
            .iter()
            .enumerate()
            .map(|(index, column)| ColumnRequest {
                raw_path: column.path.clone(),
                index,
                searchable: column.searchable,
                sortable: column.sortable,
                search_value: text(params, &format!("sSearch_{index}")),
            })
            .collect();

        Ok(Self {
            echo: echo(params),
            columns,
            search: text(params, "sSearch"),
            display_start: required(params, "iDisplayStart")?,
            display_length: display_length(required(params, "iDisplayLength")?)?,
            sorts: sorts(params, true)?,
        })
    }

    /// Parse a URL query string in client-declared mode.
    pub fn from_query_string(query: &str) -> GridResult<Self> {
        Self::from_params(&parse_query_string(query))
    }

    /// Page size, or `None` when every row was requested.
    pub fn page_size(&self) -> Option<u64> {
        u64::try_from(self.display_length).ok()
    }

    pub fn column_paths(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.raw_path.as_str()).collect()
    }

    /// Global search as a `LIKE` pattern (`%search%`), if any.
    pub fn search_pattern(&self) -> Option<String> {
        (!self.search.is_empty()).then(|| format!("%{}%", self.search))
    }
}

/// Decode a URL query string into a parameter map. Later keys win.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        .into_owned()
        .collect()
}

fn sorts(params: &HashMap<String, String>, strict: bool) -> GridResult<Vec<SortRequest>> {
    let count: usize = optional(params, "iSortingCols")?.unwrap_or(0);
    let mut sorts = Vec::with_capacity(count.min(params.len()));
    for i in 0..count {
        let column = required(params, &format!("iSortCol_{i}"))?;
        let dir_key = format!("sSortDir_{i}");
        let direction = match params.get(&dir_key) {
            Some(dir) => dir.parse::<SortDirection>()?,
            None if strict => {
                return Err(GridError::RequestShape(format!("missing '{dir_key}'")));
            }
            None => SortDirection::Asc,
        };
        sorts.push(SortRequest { column, direction });
    }
    Ok(sorts)
}

fn display_length(value: i64) -> GridResult<i64> {
    if value < -1 {
        return Err(GridError::RequestShape(format!(
            "'iDisplayLength' must be -1 or non-negative, got {value}"
        )));
    }
    Ok(value)
}

/// `sEcho` is reflected as an integer; anything unparseable echoes 0.
fn echo(params: &HashMap<String, String>) -> i64 {
    params
        .get("sEcho")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn flag(params: &HashMap<String, String>, key: &str) -> bool {
    params
        .get(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn text(params: &HashMap<String, String>, key: &str) -> String {
    params.get(key).cloned().unwrap_or_default()
}

fn optional<T: FromStr>(params: &HashMap<String, String>, key: &str) -> GridResult<Option<T>> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            GridError::RequestShape(format!("'{key}' is not numeric: '{raw}'"))
        }),
    }
}

fn required<T: FromStr>(params: &HashMap<String, String>, key: &str) -> GridResult<T> {
    optional(params, key)?.ok_or_else(|| GridError::RequestShape(format!("missing '{key}'")))
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn client_declared_columns() {
        let request = GridRequest::from_query_string(
            "sEcho=3&iColumns=2&mDataProp_0=id&mDataProp_1=customer.name\
             &bSearchable_1=true&bSortable_0=true&sSearch_1=ac%20me\
             &iDisplayStart=0&iDisplayLength=10&sSearch=",
        )
        .unwrap();

        assert_eq!(request.echo, 3);
        assert_eq!(request.column_paths(), ["id", "customer.name"]);
        assert!(!request.columns[0].searchable);
        assert!(request.columns[0].sortable);
        assert!(request.columns[1].searchable);
        assert_eq!(request.columns[1].search_value, "ac me");
        assert_eq!(request.page_size(), Some(10));
        assert!(request.search_pattern().is_none());
        assert!(request.sorts.is_empty());
    }

    #[test]
    fn client_mode_defaults() {
        let request =
            GridRequest::from_params(&params(&[("iColumns", "1"), ("mDataProp_0", "id")])).unwrap();
        assert_eq!(request.echo, 0);
        assert_eq!(request.display_start, 0);
        assert_eq!(request.display_length, -1);
        assert_eq!(request.page_size(), None);
    }

    #[test]
    fn columns_count_must_be_numeric() {
        for bad in [params(&[]), params(&[("iColumns", "two")])] {
            assert!(matches!(
                GridRequest::from_params(&bad),
                Err(GridError::RequestShape(_))
            ));
        }
        let missing_prop = params(&[("iColumns", "2"), ("mDataProp_0", "id")]);
        let err = GridRequest::from_params(&missing_prop).unwrap_err();
        assert!(err.to_string().contains("mDataProp_1"));
    }

    #[test]
    fn sort_directives_in_client_order() {
        let request = GridRequest::from_params(&params(&[
            ("iColumns", "2"),
            ("mDataProp_0", "id"),
            ("mDataProp_1", "reference"),
            ("iSortingCols", "2"),
            ("iSortCol_0", "1"),
            ("sSortDir_0", "desc"),
            ("iSortCol_1", "0"),
        ]))
        .unwrap();
        assert_eq!(
            request.sorts,
            [
                SortRequest { column: 1, direction: SortDirection::Desc },
                SortRequest { column: 0, direction: SortDirection::Asc },
            ]
        );

        let bad = params(&[
            ("iColumns", "1"),
            ("mDataProp_0", "id"),
            ("iSortingCols", "1"),
            ("iSortCol_0", "0"),
            ("sSortDir_0", "up"),
        ]);
        assert!(GridRequest::from_params(&bad).is_err());
    }

    #[test]
    fn negative_display_length_other_than_minus_one_is_rejected() {
        let bad = params(&[("iColumns", "1"), ("mDataProp_0", "id"), ("iDisplayLength", "-5")]);
        assert!(matches!(
            GridRequest::from_params(&bad),
            Err(GridError::RequestShape(_))
        ));
    }

    #[test]
    fn server_declared_columns_require_paging_keys() {
        let declared = [
            DeclaredColumn::new("id").searchable(false),
            DeclaredColumn::new("customer.name").with_title("Customer"),
        ];
        let full = params(&[
            ("sEcho", "7"),
            ("iDisplayStart", "0"),
            ("iDisplayLength", "25"),
            ("iSortingCols", "1"),
            ("iSortCol_0", "1"),
            ("sSortDir_0", "asc"),
            ("sSearch_1", "acme"),
        ]);
        let request = GridRequest::from_params_with_columns(&full, &declared).unwrap();
        assert_eq!(request.echo, 7);
        assert_eq!(request.column_paths(), ["id", "customer.name"]);
        assert!(!request.columns[0].searchable);
        assert_eq!(request.columns[1].search_value, "acme");

        for key in ["sEcho", "iDisplayStart", "iDisplayLength", "iSortingCols", "sSortDir_0"] {
            let mut partial = full.clone();
            partial.remove(key);
            let err = GridRequest::from_params_with_columns(&partial, &declared).unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }
    }

    #[test]
    fn non_numeric_echo_is_zero() {
        let request = GridRequest::from_params(&params(&[
            ("iColumns", "0"),
            ("sEcho", "abc"),
        ]))
        .unwrap();
        assert_eq!(request.echo, 0);
    }
}
