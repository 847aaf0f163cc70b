//! Single conditions: one event fact, one operator, one operand.

use crate::error::{PolicyError, PolicyResult};
use crate::facts::EventFacts;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const METADATA_KEY_PREFIX: &str = "object:metadata:";

/// A condition as written in a policy document.
///
/// The type of `Right` depends on `Left`, so it stays an untyped value until
/// [`Condition::compile`] checks it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Condition {
    /// Event fact accessor (`event:operation`, `object:key`, ...).
    #[serde(default)]
    pub left: String,
    /// Operand compared against the fact.
    #[serde(default)]
    pub right: Option<serde_yaml::Value>,
    /// Comparison operator.
    #[serde(default)]
    pub operator: String,
}

/// The event fact a condition reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Left {
    /// `event:operation`: the operation class (`PUT`, `DELETE`, `UNSUPPORTED`).
    EventOperation,
    /// `object:key`: the object key.
    ObjectKey,
    /// `object:size`: the object size in bytes.
    ObjectSize,
    /// `object:metadata`: the whole metadata map (only `has` applies).
    ObjectMetadata,
    /// `object:metadata:<key>`: the value of one metadata key.
    MetadataValue(String),
}

/// Operand type of a [`Left`] accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Text,
    Number,
    Map,
}

impl Operand {
    fn name(self) -> &'static str {
        match self {
            Operand::Text => "string",
            Operand::Number => "num",
            Operand::Map => "map key check",
        }
    }
}

impl Left {
    fn operand(&self) -> Operand {
        match self {
            Left::EventOperation | Left::ObjectKey | Left::MetadataValue(_) => Operand::Text,
            Left::ObjectSize => Operand::Number,
            Left::ObjectMetadata => Operand::Map,
        }
    }
}

impl FromStr for Left {
    type Err = PolicyError;

    fn from_str(s: &str) -> PolicyResult<Self> {
        match s {
            "event:operation" => Ok(Left::EventOperation),
            "object:key" => Ok(Left::ObjectKey),
            "object:size" => Ok(Left::ObjectSize),
            "object:metadata" => Ok(Left::ObjectMetadata),
            other => match other.strip_prefix(METADATA_KEY_PREFIX) {
                Some(key) => Ok(Left::MetadataValue(key.to_string())),
                None => Err(PolicyError::InvalidLeft(other.to_string())),
            },
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `has`
    Has,
}

impl Operator {
    fn parse(s: &str, operand: Operand) -> PolicyResult<Self> {
        let op = match s {
            "==" => Operator::Eq,
            "!=" => Operator::Ne,
            "<" => Operator::Lt,
            "<=" => Operator::Le,
            ">" => Operator::Gt,
            ">=" => Operator::Ge,
            "has" => Operator::Has,
            _ => return Err(Self::invalid(s, operand)),
        };

        let allowed = match operand {
            Operand::Text => matches!(op, Operator::Eq | Operator::Ne),
            Operand::Number => op != Operator::Has,
            Operand::Map => op == Operator::Has,
        };

        if allowed {
            Ok(op)
        } else {
            Err(Self::invalid(s, operand))
        }
    }

    fn invalid(s: &str, operand: Operand) -> PolicyError {
        PolicyError::InvalidOperator {
            operator: s.to_string(),
            operand: operand.name(),
        }
    }
}

/// A validated condition, ready to evaluate.
#[derive(Debug, Clone)]
pub(crate) enum Predicate {
    /// Glob comparison against a string fact.
    Glob {
        left: Left,
        matcher: GlobMatcher,
        negate: bool,
    },
    /// Numeric comparison against the object size.
    Number { operator: Operator, right: f64 },
    /// Presence of a metadata key.
    HasKey(String),
}

impl Condition {
    /// Creates a condition.
    pub fn new(
        left: impl Into<String>,
        right: impl Into<serde_yaml::Value>,
        operator: impl Into<String>,
    ) -> Self {
        Self {
            left: left.into(),
            right: Some(right.into()),
            operator: operator.into(),
        }
    }

    /// Validates the condition and compiles it into a predicate.
    ///
    /// Checks happen in order: Left, then Right, then Operator.
    pub(crate) fn compile(&self) -> PolicyResult<Predicate> {
        let left: Left = self.left.parse()?;
        let operand = left.operand();

        let right = self
            .right
            .as_ref()
            .filter(|value| !value.is_null())
            .ok_or_else(|| PolicyError::MissingRight(self.left.clone()))?;

        match operand {
            Operand::Text | Operand::Map => {
                let text = right.as_str().ok_or_else(|| PolicyError::RightTypeMismatch {
                    left: self.left.clone(),
                    expected: "string",
                })?;
                let operator = Operator::parse(&self.operator, operand)?;

                if operand == Operand::Map {
                    return Ok(Predicate::HasKey(text.to_string()));
                }

                let matcher = Glob::new(text)
                    .map_err(|source| PolicyError::InvalidGlob {
                        pattern: text.to_string(),
                        source,
                    })?
                    .compile_matcher();

                Ok(Predicate::Glob {
                    left,
                    matcher,
                    negate: operator == Operator::Ne,
                })
            }
            Operand::Number => {
                let number = right.as_f64().ok_or_else(|| PolicyError::RightTypeMismatch {
                    left: self.left.clone(),
                    expected: "numeric",
                })?;
                let operator = Operator::parse(&self.operator, operand)?;

                Ok(Predicate::Number {
                    operator,
                    right: number,
                })
            }
        }
    }
}

impl Predicate {
    pub(crate) fn evaluate(&self, facts: &EventFacts) -> PolicyResult<bool> {
        match self {
            Predicate::Glob {
                left,
                matcher,
                negate,
            } => {
                let value = match left {
                    Left::EventOperation => facts.operation.as_str(),
                    Left::ObjectKey => facts.key.as_str(),
                    Left::MetadataValue(key) => facts
                        .metadata
                        .get(key)
                        .map(String::as_str)
                        .ok_or_else(|| PolicyError::MissingMetadataKey(key.clone()))?,
                    // compile() only builds globs for string facts
                    Left::ObjectSize | Left::ObjectMetadata => return Ok(false),
                };
                Ok(matcher.is_match(value) != *negate)
            }
            Predicate::Number { operator, right } => {
                let left = facts.size as f64;
                Ok(match operator {
                    Operator::Eq => left == *right,
                    Operator::Ne => left != *right,
                    Operator::Lt => left < *right,
                    Operator::Le => left <= *right,
                    Operator::Gt => left > *right,
                    Operator::Ge => left >= *right,
                    Operator::Has => false,
                })
            }
            Predicate::HasKey(key) => Ok(facts.metadata.contains_key(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::EventOperation;
    use std::collections::HashMap;

    fn facts() -> EventFacts {
        EventFacts::new(EventOperation::Put, "file.ext", 1024)
    }

    fn eval(cond: Condition, facts: &EventFacts) -> bool {
        cond.compile().unwrap().evaluate(facts).unwrap()
    }

    #[test]
    fn event_operation() {
        assert!(eval(Condition::new("event:operation", "PUT", "=="), &facts()));
        assert!(!eval(Condition::new("event:operation", "DELETE", "=="), &facts()));
    }

    #[test]
    fn object_key_glob() {
        assert!(eval(Condition::new("object:key", "*.ext", "=="), &facts()));
        assert!(!eval(Condition::new("object:key", "*.ext", "!="), &facts()));
    }

    #[test]
    fn glob_star_crosses_path_separators() {
        let facts = EventFacts::new(EventOperation::Put, "dataset/dir/file.raw", 1);
        assert!(eval(Condition::new("object:key", "*.raw", "=="), &facts));
    }

    #[test]
    fn object_size() {
        assert!(eval(Condition::new("object:size", 2048, "<"), &facts()));
        assert!(eval(Condition::new("object:size", 1024, "<="), &facts()));
        assert!(eval(Condition::new("object:size", 1024, "=="), &facts()));
        assert!(!eval(Condition::new("object:size", 1024, ">"), &facts()));
        assert!(eval(Condition::new("object:size", 1.5, ">="), &facts()));
    }

    #[test]
    fn metadata_key_exists() {
        let facts = facts().with_metadata(HashMap::from([("test".into(), "test".into())]));
        assert!(eval(Condition::new("object:metadata", "test", "has"), &facts));
        assert!(!eval(Condition::new("object:metadata", "other", "has"), &facts));
    }

    #[test]
    fn metadata_value_set() {
        let facts = facts().with_metadata(HashMap::from([("test".into(), "".into())]));
        assert!(eval(Condition::new("object:metadata:test", "", "=="), &facts));
    }

    #[test]
    fn metadata_value_glob() {
        let facts = facts().with_metadata(HashMap::from([("test".into(), "test".into())]));
        assert!(eval(Condition::new("object:metadata:test", "foo*", "!="), &facts));
    }

    #[test]
    fn missing_metadata_key_is_an_error() {
        let predicate = Condition::new("object:metadata:absent", "*", "==")
            .compile()
            .unwrap();
        assert!(matches!(
            predicate.evaluate(&facts()),
            Err(PolicyError::MissingMetadataKey(key)) if key == "absent"
        ));
    }

    #[test]
    fn rejects_unknown_left() {
        let err = Condition::new("object:owner", "x", "==").compile().unwrap_err();
        assert!(matches!(err, PolicyError::InvalidLeft(_)));

        let err = Condition::new("", "x", "==").compile().unwrap_err();
        assert!(matches!(err, PolicyError::InvalidLeft(_)));
    }

    #[test]
    fn rejects_mismatched_right() {
        let err = Condition::new("object:size", "big", "<").compile().unwrap_err();
        assert!(matches!(
            err,
            PolicyError::RightTypeMismatch {
                expected: "numeric",
                ..
            }
        ));

        let err = Condition::new("object:key", 12, "==").compile().unwrap_err();
        assert!(matches!(
            err,
            PolicyError::RightTypeMismatch {
                expected: "string",
                ..
            }
        ));
    }

    #[test]
    fn rejects_missing_right() {
        let cond = Condition {
            left: "object:key".into(),
            right: None,
            operator: "==".into(),
        };
        assert!(matches!(cond.compile(), Err(PolicyError::MissingRight(_))));
    }

    #[test]
    fn rejects_operator_for_operand() {
        let err = Condition::new("object:key", "a", "<").compile().unwrap_err();
        assert!(matches!(
            err,
            PolicyError::InvalidOperator {
                operand: "string",
                ..
            }
        ));

        let err = Condition::new("object:size", 1, "has").compile().unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOperator { .. }));

        let err = Condition::new("object:metadata", "k", "==").compile().unwrap_err();
        assert!(matches!(err, PolicyError::InvalidOperator { .. }));
    }

    #[test]
    fn rejects_invalid_glob() {
        let err = Condition::new("object:key", "[unclosed", "==").compile().unwrap_err();
        assert!(matches!(err, PolicyError::InvalidGlob { .. }));
    }
}
