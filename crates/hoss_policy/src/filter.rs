//! Compiled, shareable policy predicates.

use crate::condition::Predicate;
use crate::error::PolicyResult;
use crate::facts::EventFacts;
use crate::policy::Effect;
use std::sync::Arc;

/// A node of the compiled predicate tree.
#[derive(Debug)]
pub(crate) enum Node {
    Leaf(Predicate),
    Group { effect: Effect, children: Vec<Node> },
}

impl Node {
    fn evaluate(&self, facts: &EventFacts) -> PolicyResult<bool> {
        match self {
            Node::Leaf(predicate) => predicate.evaluate(facts),
            Node::Group { effect, children } => match effect {
                Effect::Or => {
                    if children.is_empty() {
                        return Ok(true);
                    }
                    for child in children {
                        if child.evaluate(facts)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Effect::And => {
                    for child in children {
                        if !child.evaluate(facts)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
            },
        }
    }
}

/// A compiled policy.
///
/// Evaluation is pure, and clones share the compiled tree, so one filter can
/// be evaluated from many tasks at once.
#[derive(Debug, Clone)]
pub struct PolicyFilter {
    root: Arc<Node>,
}

impl PolicyFilter {
    pub(crate) fn from_node(root: Node) -> Self {
        Self {
            root: Arc::new(root),
        }
    }

    /// A filter that admits every event.
    pub fn allow_all() -> Self {
        Self::from_node(Node::Group {
            effect: Effect::Or,
            children: Vec::new(),
        })
    }

    /// Evaluates the filter against one event.
    ///
    /// Fails only when a condition reads a metadata key the event lacks.
    pub fn evaluate(&self, facts: &EventFacts) -> PolicyResult<bool> {
        self.root.evaluate(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::EventOperation;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn filter_is_send_sync() {
        assert_send_sync::<PolicyFilter>();
    }

    #[test]
    fn allow_all_passes() {
        let facts = EventFacts::new(EventOperation::Delete, "anything", 0);
        assert!(PolicyFilter::allow_all().evaluate(&facts).unwrap());
    }
}
