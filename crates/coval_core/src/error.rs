//! Error types for coval_core operations.

use thiserror::Error;

/// Core error type for coval_core operations.
///
/// Mutation paths (create/update/delete and the gate) return these directly.
/// Read paths never surface them as errors; they report through the store's
/// current value instead (see [`crate::store::ReadState`]).
#[derive(Error, Debug)]
pub enum CovalError {
    /// Argument does not match the co-id shape (`co_z` + alphanumeric suffix).
    #[error("invalid co-id: {0}")]
    InvalidId(String),

    /// Referenced co-value is unknown to the peer.
    #[error("co-value not found: {0}")]
    NotFound(String),

    /// Availability or subscription readiness exceeded its budget.
    #[error("timed out after {timeout_ms}ms waiting for {what}")]
    Timeout {
        /// What was being waited on (co-id or description).
        what: String,
        /// Budget that was exceeded.
        timeout_ms: u64,
    },

    /// Schema key could not be resolved to a co-id.
    #[error("schema unresolved: {0}")]
    SchemaUnresolved(String),

    /// Schema validation failed before a mutation.
    #[error("validation failed: {}", messages.join("; "))]
    ValidationFailure {
        /// Aggregated validator messages.
        messages: Vec<String>,
    },

    /// Operation attempted on an incompatible co-value kind.
    #[error("unsupported operation: {op} on {kind}")]
    UnsupportedOperation {
        /// The operation name.
        op: String,
        /// The offending co-value kind.
        kind: String,
    },

    /// Message payload still contains unresolved expressions.
    #[error("unresolved expression in payload: {0}")]
    ExpressionUnresolved(String),

    /// Cache or store invariant violated. Should be impossible.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Serialization error during record operations.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error during record operations.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error (loading, parsing, invalid values).
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl CovalError {
    /// Returns a user-friendly recovery suggestion for the error, if available.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::InvalidId(_) => {
                Some("Co-ids start with 'co_z' followed by an alphanumeric suffix.")
            }
            Self::NotFound(_) => {
                Some("The co-value may not have synced yet. Retry once the peer reports it.")
            }
            Self::Timeout { .. } => {
                Some("Increase timeout_ms in the read options, or check peer connectivity.")
            }
            Self::SchemaUnresolved(_) => {
                Some("Register the schema in the OS schematas registry before using its key.")
            }
            Self::ValidationFailure { .. } => {
                Some("Check the record against its schema's declared properties.")
            }
            Self::ExpressionUnresolved(_) => {
                Some("Resolve all expressions to plain data before pushing a message.")
            }
            _ => None,
        }
    }
}

/// Convenience Result type for coval_core operations.
pub type Result<T> = std::result::Result<T, CovalError>;
