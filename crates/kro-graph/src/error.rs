//! Error types for graph analysis

use thiserror::Error;

/// Errors produced while analyzing an RGD's resource graph
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// Resource id does not match `[a-z][a-zA-Z0-9]*`
    #[error("invalid resource id '{id}'")]
    InvalidId { id: String },

    /// Two resources share one id
    #[error("duplicate resource id '{id}'")]
    DuplicateId { id: String },

    /// Resource id shadows a reserved binding
    #[error("resource id '{id}' is reserved")]
    ReservedId { id: String },

    /// A resource must carry exactly one of template / externalRef
    #[error("resource '{id}': {detail}")]
    InvalidResource { id: String, detail: String },

    /// An expression references a root that is neither `schema` nor a
    /// resource id
    #[error("resource '{id}' references unknown name '{root}'")]
    UnknownReference { id: String, root: String },

    /// An embedded expression failed to parse or type-check
    #[error("resource '{id}' at {site}: {source}")]
    Expression {
        id: String,
        site: String,
        source: kro_expr::ExprError,
    },

    /// The dependency graph is not acyclic
    #[error("dependency cycle: {cycle}")]
    Cycle { cycle: String },

    /// The status section failed to compile
    #[error(transparent)]
    Schema(#[from] kro_schema::SchemaError),

    /// A referent's type could not be resolved
    #[error("cannot resolve schema for {api_version}/{kind}: {detail}")]
    TypeResolution {
        api_version: String,
        kind: String,
        detail: String,
    },
}

/// Result type for graph analysis
pub type Result<T> = std::result::Result<T, GraphError>;
