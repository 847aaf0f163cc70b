//! The top-level policy document.

use crate::error::{PolicyError, PolicyResult};
use crate::filter::{Node, PolicyFilter};
use crate::statement::Statement;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The only document version understood.
pub const POLICY_VERSION: &str = "1";

/// How child predicates combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// True unless some child is false. Short-circuits on the first false.
    And,
    /// True if some child is true. Short-circuits on the first true.
    Or,
}

impl Effect {
    /// Returns the document spelling of the effect.
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::And => "AND",
            Effect::Or => "OR",
        }
    }

    /// Parses an optional effect, falling back to `default` when absent or empty.
    pub(crate) fn parse(value: Option<&str>, default: Effect) -> PolicyResult<Self> {
        match value {
            None | Some("") => Ok(default),
            Some("AND") => Ok(Effect::And),
            Some("OR") => Ok(Effect::Or),
            Some(other) => Err(PolicyError::UnsupportedEffect(other.to_string())),
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy document.
///
/// ```yaml
/// Version: "1"
/// Effect: OR
/// Statements:
///   - Id: small-non-raw
///     Effect: AND
///     Conditions:
///       - { Left: "object:key", Right: "*.raw", Operator: "!=" }
///       - { Left: "object:size", Right: 4096, Operator: "<" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Policy {
    /// Document version; must be `"1"`.
    #[serde(default)]
    pub version: String,
    /// How statements combine. Defaults to `OR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    /// Statements, evaluated in order.
    #[serde(default)]
    pub statements: Vec<Statement>,
}

impl Policy {
    /// Creates an empty version 1 policy with the default effect.
    pub fn new() -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            ..Self::default()
        }
    }

    /// Sets the effect.
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect.as_str().to_string());
        self
    }

    /// Appends a statement.
    pub fn with_statement(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }

    /// Parses a YAML or JSON policy document without compiling it.
    pub fn from_document(document: &str) -> PolicyResult<Self> {
        serde_yaml::from_str(document).map_err(|e| PolicyError::Document(e.to_string()))
    }

    /// Validates the document and compiles it into a filter.
    pub fn compile(&self) -> PolicyResult<PolicyFilter> {
        if self.version != POLICY_VERSION {
            return Err(PolicyError::UnsupportedVersion(self.version.clone()));
        }

        let effect = Effect::parse(self.effect.as_deref(), Effect::Or)?;
        let children = self
            .statements
            .iter()
            .map(Statement::compile)
            .collect::<PolicyResult<Vec<_>>>()?;

        Ok(PolicyFilter::from_node(Node::Group { effect, children }))
    }
}
