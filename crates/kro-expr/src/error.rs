//! Error types for the kro expression engine

use thiserror::Error;

/// Errors that can occur while parsing, checking, or evaluating expressions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    /// Source text could not be parsed
    #[error("parse error at offset {offset}: {message}")]
    Parse {
        /// Byte offset into the expression source
        offset: usize,
        /// What went wrong
        message: String,
    },

    /// Expression is well-formed but ill-typed for the given environment
    #[error("type error: {0}")]
    Type(String),

    /// Evaluation failed on actual values
    #[error("eval error: {0}")]
    Eval(String),

    /// Evaluation touched data that is not present yet (unbound resource,
    /// absent field). Reconcilers treat this as "try again later" rather
    /// than a terminal failure.
    #[error("value not yet available: {0}")]
    MissingData(String),
}

/// Result type for expression operations
pub type Result<T> = std::result::Result<T, ExprError>;

impl ExprError {
    pub(crate) fn parse(offset: usize, message: impl Into<String>) -> Self {
        ExprError::Parse {
            offset,
            message: message.into(),
        }
    }

    /// True when the failure only means the referenced data does not exist
    /// yet, as opposed to a malformed or ill-typed expression.
    pub fn is_missing_data(&self) -> bool {
        matches!(self, ExprError::MissingData(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_data_classification() {
        assert!(ExprError::MissingData("deployment.status".into()).is_missing_data());
        assert!(!ExprError::Type("bad".into()).is_missing_data());
        assert!(!ExprError::parse(0, "bad").is_missing_data());
    }
}
