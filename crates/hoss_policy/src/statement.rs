//! Statements: ordered condition lists combined under one effect.

use crate::condition::Condition;
use crate::error::PolicyResult;
use crate::filter::Node;
use crate::policy::Effect;
use serde::{Deserialize, Serialize};

/// A statement as written in a policy document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    /// Identifier used in diagnostics only.
    #[serde(default)]
    pub id: String,
    /// How the conditions combine. Defaults to `AND`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    /// Conditions, evaluated in order.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Statement {
    /// Creates an `AND` statement.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Sets the effect.
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect.as_str().to_string());
        self
    }

    /// Appends a condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub(crate) fn compile(&self) -> PolicyResult<Node> {
        let effect = Effect::parse(self.effect.as_deref(), Effect::And)?;
        let children = self
            .conditions
            .iter()
            .map(|condition| condition.compile().map(Node::Leaf))
            .collect::<PolicyResult<Vec<_>>>()?;

        Ok(Node::Group { effect, children })
    }
}
