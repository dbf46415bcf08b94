//! Error types for the kro operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// SimpleSchema compilation failed (terminal for the RGD)
    #[error("schema error: {0}")]
    Schema(#[from] kro_schema::SchemaError),

    /// Graph analysis failed (terminal for the RGD)
    #[error("graph error: {0}")]
    Graph(#[from] kro_graph::GraphError),

    /// Expression evaluation failed at reconcile time
    #[error("expression error: {0}")]
    Expression(#[from] kro_expr::ExprError),

    /// CRD registration failed
    #[error("registration error: {0}")]
    Registration(String),

    /// Two RGDs would synthesize the same GVK
    #[error("GVK {gvk} is already registered by ResourceGraphDefinition '{owner}'")]
    GvkConflict { gvk: String, owner: String },

    /// An instance violates a schema validation rule
    #[error("validation failed: {0}")]
    Validation(String),

    /// No service account is mapped for the instance's namespace
    #[error("no service account configured for namespace '{namespace}' and no \"*\" fallback")]
    ImpersonationDenied { namespace: String },

    /// A node's prerequisites are not satisfied yet; retried with backoff
    #[error("resource '{node}' not ready: {reason}")]
    NotReady { node: String, reason: String },

    /// Teardown is blocked (live instances with allowCRDDeletion=false)
    #[error("teardown blocked: {0}")]
    TeardownBlocked(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation timed out
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Internal invariant broken
    #[error("internal error: {0}")]
    Internal(String),

    /// Process-wide invariant break (e.g. a panicking reconciler); logged
    /// at top severity and triggers shutdown
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Whether a retry with backoff can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::Kube(_)
                | OperatorError::NotReady { .. }
                | OperatorError::Timeout(_)
                | OperatorError::TeardownBlocked(_)
        ) || matches!(self, OperatorError::Expression(e) if e.is_missing_data())
    }

    /// Whether this failure flips an RGD to Inactive rather than being
    /// retried.
    pub fn is_terminal_for_rgd(&self) -> bool {
        matches!(
            self,
            OperatorError::Schema(_)
                | OperatorError::Graph(_)
                | OperatorError::Registration(_)
                | OperatorError::GvkConflict { .. }
        ) || matches!(self, OperatorError::Expression(e) if !e.is_missing_data())
    }

    /// Condition reason string for the error taxonomy.
    pub fn reason(&self) -> &'static str {
        match self {
            OperatorError::Schema(_) => "SchemaError",
            OperatorError::Graph(_) => "GraphError",
            OperatorError::Expression(e) if e.is_missing_data() => "Pending",
            OperatorError::Expression(_) => "ExpressionError",
            OperatorError::Registration(_) | OperatorError::GvkConflict { .. } => {
                "RegistrationError"
            }
            OperatorError::Validation(_) => "ValidationError",
            OperatorError::ImpersonationDenied { .. } => "ImpersonationDenied",
            OperatorError::NotReady { .. } => "Pending",
            OperatorError::TeardownBlocked(_) => "TeardownBlocked",
            OperatorError::Kube(_) | OperatorError::Timeout(_) => "ReconcileError",
            OperatorError::Serialization(_) | OperatorError::Internal(_) => "InternalError",
            OperatorError::Fatal(_) => "Fatal",
        }
    }

    /// Convert a payload caught at a worker's panic boundary into `Fatal`.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unrecognized panic payload".to_string()
        };
        OperatorError::Fatal(message)
    }
}
