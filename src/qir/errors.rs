#![forbid(unsafe_code)]

use std::fmt;

use thiserror::Error;

/// Reason an identifier was rejected by the identifier policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierViolation {
    /// Identifier was empty.
    Empty,
    /// Identifier does not match `[a-z_][a-z0-9_]*`.
    Pattern,
    /// Identifier collides with a reserved SQL keyword.
    Reserved,
    /// Identifier is longer than the 63-byte PostgreSQL limit.
    TooLong {
        /// Observed length in bytes.
        len: usize,
    },
}

impl fmt::Display for IdentifierViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierViolation::Empty => write!(f, "must not be empty"),
            IdentifierViolation::Pattern => write!(f, "must match [a-z_][a-z0-9_]*"),
            IdentifierViolation::Reserved => write!(f, "is a reserved keyword"),
            IdentifierViolation::TooLong { len } => {
                write!(f, "exceeds 63 bytes (got {len})")
            }
        }
    }
}

/// Structured errors emitted while building, lowering, or emitting a query.
///
/// All three kinds are terminal for the compilation call: a caller receives
/// either complete SQL or one of these, never partial output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QirError {
    /// Malformed operation descriptor or plan shape.
    #[error("{field}: {message}")]
    Validation {
        /// Path of the offending descriptor field (`joins[0].on.left`).
        field: String,
        /// Human readable description.
        message: String,
    },
    /// Identifier rejected by the active identifier policy.
    #[error("identifier '{ident}' {violation}")]
    Identifier {
        /// The identifier as supplied.
        ident: String,
        /// Why it was rejected.
        violation: IdentifierViolation,
    },
    /// Parameter type outside the allowed set, or a required type omitted.
    #[error("parameter '{param}': {message}")]
    ParameterType {
        /// Parameter name (or descriptor path when the name is unknown).
        param: String,
        /// Human readable description.
        message: String,
    },
}

/// Convenience alias for compiler results.
pub type Result<T> = std::result::Result<T, QirError>;

impl QirError {
    /// Builds a [`QirError::Validation`] for a descriptor field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        QirError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Builds a [`QirError::Identifier`].
    pub fn identifier(ident: impl Into<String>, violation: IdentifierViolation) -> Self {
        QirError::Identifier {
            ident: ident.into(),
            violation,
        }
    }

    /// Builds a [`QirError::ParameterType`].
    pub fn parameter_type(param: impl Into<String>, message: impl Into<String>) -> Self {
        QirError::ParameterType {
            param: param.into(),
            message: message.into(),
        }
    }

    /// Returns a machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            QirError::Validation { .. } => "ValidationError",
            QirError::Identifier { .. } => "IdentifierError",
            QirError::ParameterType { .. } => "ParameterTypeError",
        }
    }
}

/// Formats a [`QirError`] prefixed with its code.
pub struct QirErrorWithCode<'a>(pub &'a QirError);

impl fmt::Display for QirErrorWithCode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.0.code(), self.0)
    }
}
