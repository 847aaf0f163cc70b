//! Error types for policy parsing and evaluation.

use thiserror::Error;

/// Result type for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors raised while compiling or evaluating a policy document.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// The document is not valid YAML/JSON or does not have the policy shape.
    #[error("could not parse policy document: {0}")]
    Document(String),

    /// Only version "1" documents are understood.
    #[error("unsupported policy Version value '{0}'")]
    UnsupportedVersion(String),

    /// Effect was something other than "AND" or "OR".
    #[error("unsupported Effect value '{0}'")]
    UnsupportedEffect(String),

    /// The Left operand is not part of the event fact vocabulary.
    #[error("invalid Left value: '{0}'")]
    InvalidLeft(String),

    /// A condition has no Right operand.
    #[error("Right operand is required for Left '{0}'")]
    MissingRight(String),

    /// The Right operand has the wrong type for its Left operand.
    #[error("Left operand '{left}' expects a {expected} Right operand")]
    RightTypeMismatch {
        /// Left operand of the offending condition.
        left: String,
        /// Expected operand type ("string" or "numeric").
        expected: &'static str,
    },

    /// The Right operand could not be compiled as a glob pattern.
    #[error("problem compiling glob ({pattern:?}): {source}")]
    InvalidGlob {
        /// Pattern as written in the document.
        pattern: String,
        /// Underlying compile error.
        #[source]
        source: globset::Error,
    },

    /// The Operator is not defined for the operand type.
    #[error("cannot apply operator {operator:?} to {operand} values")]
    InvalidOperator {
        /// Operator as written in the document.
        operator: String,
        /// Operand type the operator was applied to.
        operand: &'static str,
    },

    /// Evaluation referenced a metadata key the event does not carry.
    #[error("metadata key {0} doesn't exist")]
    MissingMetadataKey(String),
}
