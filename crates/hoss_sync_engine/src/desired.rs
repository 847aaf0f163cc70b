//! Desired state: sync relationships as reported by core services.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Direction of a sync relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    /// One-way replication from source to target.
    Simplex,
    /// Mutual replication; the reverse link is reported by the other side.
    Duplex,
}

impl SyncKind {
    /// Returns the wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Simplex => "simplex",
            SyncKind::Duplex => "duplex",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A replication link from a source namespace to a target namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRelationship {
    /// Simplex or duplex.
    #[serde(rename = "sync_type")]
    pub kind: SyncKind,
    /// Endpoint of the core service owning the source namespace.
    pub source_core_service: String,
    /// Source namespace name.
    pub source_namespace: String,
    /// Policy documents active on the source namespace, keyed by key prefix.
    #[serde(default)]
    pub source_policies: BTreeMap<String, String>,
    /// Endpoint of the core service owning the target namespace.
    pub target_core_service: String,
    /// Target namespace name.
    pub target_namespace: String,
}

/// Content-derived identity of a [`SyncRelationship`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipId(String);

impl RelationshipId {
    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relationships indexed by identity.
pub type RelationshipSet = HashMap<RelationshipId, SyncRelationship>;

impl SyncRelationship {
    /// Creates a relationship without policies.
    pub fn new(
        kind: SyncKind,
        source: (impl Into<String>, impl Into<String>),
        target: (impl Into<String>, impl Into<String>),
    ) -> Self {
        Self {
            kind,
            source_core_service: source.0.into(),
            source_namespace: source.1.into(),
            source_policies: BTreeMap::new(),
            target_core_service: target.0.into(),
            target_namespace: target.1.into(),
        }
    }

    /// Adds a policy document for a key prefix.
    pub fn with_policy(mut self, prefix: impl Into<String>, document: impl Into<String>) -> Self {
        self.source_policies.insert(prefix.into(), document.into());
        self
    }

    /// Computes the identity used to diff desired and live state.
    ///
    /// Every field participates. Fields are length-prefixed so adjacent
    /// values cannot run into each other, and policies hash in key order.
    pub fn identity(&self) -> RelationshipId {
        let mut hasher = Sha256::new();
        let mut field = |value: &str| {
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        };

        field(self.kind.as_str());
        field(&self.source_core_service);
        field(&self.source_namespace);
        field(&self.source_policies.len().to_string());
        for (prefix, document) in &self.source_policies {
            field(prefix);
            field(document);
        }
        field(&self.target_core_service);
        field(&self.target_namespace);

        let digest = hasher.finalize();
        RelationshipId(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

impl fmt::Display for SyncRelationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.kind {
            SyncKind::Simplex => "->",
            SyncKind::Duplex => "<->",
        };
        write!(
            f,
            "<SyncRelationship: {}:{} {} {}:{}>",
            self.source_core_service,
            self.source_namespace,
            dir,
            self.target_core_service,
            self.target_namespace
        )
    }
}

/// Indexes relationships by identity. Duplicates collapse.
pub fn index<I>(relationships: I) -> RelationshipSet
where
    I: IntoIterator<Item = SyncRelationship>,
{
    relationships
        .into_iter()
        .map(|relationship| (relationship.identity(), relationship))
        .collect()
}
