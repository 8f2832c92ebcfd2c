//! Error types for query translation and materialization.

use std::fmt;

use thiserror::Error;

/// Broad classification of a translation or materialization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No translation rule exists for an operator, method, member or argument.
    Unsupported,
    /// The query shape is inconsistent with the type descriptors.
    Binding,
    /// A non-defaulted scalar result over zero rows.
    EmptyResult,
    /// A single-valued result over more than one row.
    Cardinality,
    /// Row source or value conversion failures.
    Execution,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Unsupported => write!(f, "Unsupported Construct"),
            ErrorCategory::Binding => write!(f, "Binding Error"),
            ErrorCategory::EmptyResult => write!(f, "Empty Result"),
            ErrorCategory::Cardinality => write!(f, "Cardinality Violation"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query operator \"{0}\" is not supported")]
    UnsupportedOperator(String),

    #[error("method \"{0}\" is not supported")]
    UnsupportedMethod(String),

    #[error("member \"{member}\" is not supported on {target}")]
    UnsupportedMember { target: String, member: String },

    #[error("unsupported argument for \"{method}\": {reason}")]
    UnsupportedArgument { method: String, reason: String },

    #[error("{dialect} does not support {feature}")]
    UnsupportedByDialect {
        dialect: &'static str,
        feature: String,
    },

    #[error("binding error: {0}")]
    Binding(String),

    #[error("failed to evaluate host expression: {0}")]
    Evaluation(String),

    #[error("Sequence contains no elements")]
    EmptySequence,

    #[error("Sequence contains more than one element")]
    MoreThanOneElement,

    #[error("cannot convert {found} value to {expected}")]
    Conversion {
        expected: &'static str,
        found: &'static str,
    },

    #[error("row source failed: {0}")]
    RowSource(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl QueryError {
    pub fn binding(message: impl Into<String>) -> Self {
        QueryError::Binding(message.into())
    }

    pub fn unsupported_argument(method: impl Into<String>, reason: impl Into<String>) -> Self {
        QueryError::UnsupportedArgument {
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Wraps a failure raised by an external row source.
    pub fn row_source<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        QueryError::RowSource(err.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            QueryError::UnsupportedOperator(_)
            | QueryError::UnsupportedMethod(_)
            | QueryError::UnsupportedMember { .. }
            | QueryError::UnsupportedArgument { .. }
            | QueryError::UnsupportedByDialect { .. } => ErrorCategory::Unsupported,
            QueryError::Binding(_) | QueryError::Evaluation(_) => ErrorCategory::Binding,
            QueryError::EmptySequence => ErrorCategory::EmptyResult,
            QueryError::MoreThanOneElement => ErrorCategory::Cardinality,
            QueryError::RowSource(_) | QueryError::Conversion { .. } => ErrorCategory::Execution,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_operator_names_itself() {
        let err = QueryError::UnsupportedOperator("Zip".into());
        assert_eq!(err.to_string(), "query operator \"Zip\" is not supported");
        assert_eq!(err.category(), ErrorCategory::Unsupported);
    }

    #[test]
    fn test_empty_and_cardinality_are_distinct() {
        assert_eq!(
            QueryError::EmptySequence.category(),
            ErrorCategory::EmptyResult
        );
        assert_eq!(
            QueryError::MoreThanOneElement.category(),
            ErrorCategory::Cardinality
        );
        assert_eq!(
            QueryError::EmptySequence.to_string(),
            "Sequence contains no elements"
        );
    }

    #[test]
    fn test_row_source_wraps_string() {
        let err = QueryError::row_source("cursor closed");
        assert_eq!(err.category(), ErrorCategory::Execution);
        assert!(err.to_string().contains("cursor closed"));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Binding.to_string(), "Binding Error");
    }
}
