// src/error.rs
// Crate-wide error type and Result alias

use thiserror::Error;

/// All errors Vellum can surface to a caller.
///
/// In-memory mutations that span more than one index are transactional:
/// by the time one of these errors reaches the caller, partial index
/// effects have already been rolled back.
#[derive(Debug, Error)]
pub enum VellumError {
    /// A unique index already holds a different document at this key
    #[error("unique constraint violated for key {key} on field {field}")]
    UniqueViolation { field: String, key: String },

    /// An update tried to change a document's `_id`
    #[error("the _id field cannot be changed")]
    ImmutableId,

    /// Operator keys and plain fields mixed in one operator object
    #[error("cannot mix operators and normal fields in a query")]
    MixedQuery,

    /// Modifier keys and plain fields mixed in one update expression
    #[error("cannot mix modifiers and normal fields in an update")]
    MixedUpdate,

    /// Both picked and omitted fields in one projection (besides `_id`)
    #[error("cannot both keep and omit fields in a projection")]
    MixedProjection,

    /// A `$`-prefixed query operator that is not part of the language
    #[error("unknown query operator {0}")]
    UnknownOperator(String),

    /// A `$`-prefixed update modifier that is not part of the language
    #[error("unknown update modifier {0}")]
    UnknownModifier(String),

    /// A modifier applied to a value of the wrong type
    #[error("modifier type error: {0}")]
    ModifierTypeError(String),

    /// A structurally invalid query (bad operand shape)
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A structurally invalid update expression
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// The serialization hook pair does not round-trip, or only one
    /// hook of the pair was supplied
    #[error("serialization hooks must be an inverse pair")]
    BadHooks,

    /// Too many corrupt lines in the datafile at load
    #[error("datafile corruption: {corrupt} of {total} lines unreadable")]
    CorruptDatafile { corrupt: usize, total: usize },

    /// Filenames ending in `~` are reserved for crash-safe temporaries
    #[error("filename {0} is reserved for crash-safe temporary files")]
    ReservedFilename(String),

    /// A document key starting with `$` or containing `.`
    #[error("invalid key {0} in document")]
    InvalidKey(String),

    /// `ensure_index` called without a field name
    #[error("an index must have a fieldName")]
    MissingFieldName,

    /// A storage primitive failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Document encoding failed (decoding failures are counted as
    /// corrupt lines instead)
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant breach (executor stopped mid-operation)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, VellumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VellumError::UniqueViolation {
            field: "email".to_string(),
            key: "\"a@b.c\"".to_string(),
        };
        assert!(err.to_string().contains("email"));
        assert!(err.to_string().contains("a@b.c"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: VellumError = io.into();
        assert!(matches!(err, VellumError::Io(_)));
    }
}
