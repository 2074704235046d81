//! Grid error types.

use std::fmt;

use thiserror::Error;

/// Why a column path failed to resolve against the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFailure {
    /// An intermediate segment is not an association on the current entity.
    AssociationNotFound,
    /// The leaf segment is not a scalar field on the last resolved entity.
    FieldNotFound,
    /// The root entity itself is unknown to the schema.
    EntityNotFound,
}

impl fmt::Display for SchemaFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchemaFailure::AssociationNotFound => "association not found",
            SchemaFailure::FieldNotFound => "field not found",
            SchemaFailure::EntityNotFound => "entity not found",
        })
    }
}

/// Errors raised while planning, executing or shaping a grid request.
#[derive(Debug, Error)]
pub enum GridError {
    /// A column path names an association or field that does not exist.
    #[error("{reason}: '{hop}' in column '{path}'")]
    Schema {
        path: String,
        hop: String,
        reason: SchemaFailure,
    },

    /// The inbound request is missing keys or carries malformed values.
    #[error("malformed grid request: {0}")]
    RequestShape(String),

    /// An injected extension broke its contract.
    #[error("extension '{extension}' violated its contract: {message}")]
    CallbackContract { extension: String, message: String },

    /// The query engine failed.
    #[error("query execution failed")]
    Execution(#[from] anyhow::Error),

    /// A configuration value was not recognized.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GridError {
    pub(crate) fn schema(path: &str, hop: &str, reason: SchemaFailure) -> Self {
        GridError::Schema {
            path: path.to_string(),
            hop: hop.to_string(),
            reason,
        }
    }

    pub(crate) fn contract(extension: &str, message: impl Into<String>) -> Self {
        GridError::CallbackContract {
            extension: extension.to_string(),
            message: message.into(),
        }
    }

    /// Whether the error was caused by the client's request rather than the
    /// integrator or the backend.
    pub fn is_client_error(&self) -> bool {
        matches!(self, GridError::Schema { .. } | GridError::RequestShape(_))
    }
}

/// Result type alias using GridError.
pub type GridResult<T> = Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_message_names_hop_and_path() {
        let err = GridError::schema(
            "customer.locaton.city",
            "locaton",
            SchemaFailure::AssociationNotFound,
        );
        assert_eq!(
            err.to_string(),
            "association not found: 'locaton' in column 'customer.locaton.city'"
        );
        assert!(err.is_client_error());
    }

    #[test]
    fn execution_and_contract_errors_are_not_client_errors() {
        let exec = GridError::from(anyhow::anyhow!("connection reset"));
        assert!(!exec.is_client_error());

        let contract = GridError::contract("tenant_scope", "unknown alias 'x'");
        assert!(!contract.is_client_error());
        assert!(contract.to_string().contains("tenant_scope"));
    }
}
