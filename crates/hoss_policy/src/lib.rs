//! # Hoss Policy
//!
//! Declarative sync filters for the Hoss sync engine.
//!
//! A policy document is a tree of three levels:
//! - `Policy`: a version, an effect (`OR` by default) and statements
//! - `Statement`: an id, an effect (`AND` by default) and conditions
//! - `Condition`: `Left` event fact, `Operator`, typed `Right` operand
//!
//! [`parse`] validates a document and compiles it into a [`PolicyFilter`],
//! which is then evaluated against the [`EventFacts`] of each storage event.
//!
//! ## Evaluation rules
//!
//! - String facts are compared with glob patterns, where `*` also matches `/`
//! - `object:size` compares numerically with `== != < <= > >=`
//! - `object:metadata` supports only `has` (key presence)
//! - `OR` stops at the first true child, `AND` at the first false child
//! - A group with no children is true
//!
//! ```
//! use hoss_policy::{parse, EventFacts, EventOperation};
//!
//! let filter = parse(r#"
//! Version: "1"
//! Statements:
//!   - Id: no-raw
//!     Conditions:
//!       - { Left: "object:key", Right: "*.raw", Operator: "!=" }
//! "#).unwrap();
//!
//! let facts = EventFacts::new(EventOperation::Put, "dataset/file.key", 10);
//! assert!(filter.evaluate(&facts).unwrap());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod condition;
mod error;
mod facts;
mod filter;
mod policy;
mod statement;

pub use condition::{Condition, Left, Operator};
pub use error::{PolicyError, PolicyResult};
pub use facts::{EventFacts, EventOperation};
pub use filter::PolicyFilter;
pub use policy::{Effect, Policy, POLICY_VERSION};
pub use statement::Statement;

/// Policy document applied when a namespace sync is enabled without one.
pub const DEFAULT_OPEN_POLICY: &str = r#"{"Version": "1", "Statements": []}"#;

/// Parses a YAML or JSON policy document and compiles it.
pub fn parse(document: &str) -> PolicyResult<PolicyFilter> {
    Policy::from_document(document)?.compile()
}
