//! Error types for the SimpleSchema compiler

use thiserror::Error;

/// Errors produced while compiling a SimpleSchema definition
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// Base type is neither a builtin nor a declared named type
    #[error("unknown type '{name}' at {path}")]
    UnknownType { path: String, name: String },

    /// An atom attribute could not be parsed
    #[error("malformed attribute at {path}: {detail}")]
    MalformedAttribute { path: String, detail: String },

    /// A declared default does not match the field's type
    #[error("default value at {path} does not match type {expected}")]
    DefaultTypeMismatch { path: String, expected: String },

    /// Two declarations collapse to the same field name
    #[error("duplicate field '{name}' at {path}")]
    DuplicateField { path: String, name: String },

    /// A named type refers to itself (directly or through other named
    /// types); structural CRD schemas cannot express recursion
    #[error("recursive named type '{name}'")]
    RecursiveType { name: String },

    /// A validation expression does not parse or does not type-check
    #[error("malformed validation at {path}: {detail}")]
    MalformedValidation { path: String, detail: String },

    /// A status leaf must be a `${…}` expression
    #[error("status field {path} is not an expression")]
    StatusLeafNotExpression { path: String },

    /// A schema section has the wrong JSON shape
    #[error("invalid schema structure at {path}: {detail}")]
    InvalidStructure { path: String, detail: String },
}

/// Result type for schema compilation
pub type Result<T> = std::result::Result<T, SchemaError>;
