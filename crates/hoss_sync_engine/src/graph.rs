//! The runtime configuration graph: the live routing table.
//!
//! One [`CoreServiceConfig`] node exists per monitored core service. Each node
//! owns its object stores and the namespaces that take part in some sync
//! relationship, guarded by a single reader/writer lock.
//!
//! ## Locking
//!
//! - The reconciler is the only writer. It takes write locks in endpoint order.
//! - The demuxer and workers take one read lock at a time, copy what they
//!   need, and release it before any I/O. The guards are not `Send`, so a
//!   guard held across an `.await` fails to compile inside a spawned task.
//!
//! Sync targets point at namespaces owned by other nodes through
//! [`Weak`] references to the immutable [`NamespaceLocation`], so cycles
//! between nodes never keep anything alive.

use crate::core_api::CoreServiceApi;
use crate::desired::{RelationshipSet, SyncKind, SyncRelationship};
use crate::message::Message;
use crate::object_store::RenewingClient;
use hoss_policy::PolicyFilter;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::error;

/// An object store of a core service. Immutable after startup.
pub struct ObjectStoreConfig {
    /// Object store name.
    pub name: String,
    /// Storage endpoint, as it appears in bucket notifications.
    pub endpoint: String,
    /// Renewing storage client.
    pub client: Arc<dyn RenewingClient>,
}

impl fmt::Debug for ObjectStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreConfig")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Where a namespace lives. Immutable once created.
#[derive(Debug)]
pub struct NamespaceLocation {
    /// Endpoint of the owning core service.
    pub core_service: String,
    /// Namespace name.
    pub name: String,
    /// Object store holding the bucket.
    pub object_store: Arc<ObjectStoreConfig>,
    /// Bucket name.
    pub bucket: String,
}

/// Key of a sync target: the target namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncKey {
    /// Endpoint of the target core service.
    pub core_service: String,
    /// Target namespace name.
    pub namespace: String,
}

impl SyncKey {
    /// Creates a key.
    pub fn new(core_service: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            core_service: core_service.into(),
            namespace: namespace.into(),
        }
    }
}

/// A replication target of a namespace.
#[derive(Debug, Clone)]
pub struct SyncTarget {
    /// Simplex or duplex.
    pub kind: SyncKind,
    target: Option<Weak<NamespaceLocation>>,
}

impl SyncTarget {
    fn unlinked(kind: SyncKind) -> Self {
        Self { kind, target: None }
    }

    /// Returns true once the target namespace has been resolved.
    pub fn is_linked(&self) -> bool {
        self.target.is_some()
    }

    /// Returns the target namespace, if resolved and still alive.
    pub fn location(&self) -> Option<Arc<NamespaceLocation>> {
        self.target.as_ref().and_then(Weak::upgrade)
    }
}

/// A namespace taking part in sync, as seen by its owning node.
#[derive(Debug)]
pub struct NamespaceConfig {
    location: Arc<NamespaceLocation>,
    policies: BTreeMap<String, String>,
    filters: HashMap<String, PolicyFilter>,
    targets: HashMap<SyncKey, SyncTarget>,
}

impl NamespaceConfig {
    /// Creates a namespace with no policies and no targets.
    pub fn new(location: Arc<NamespaceLocation>) -> Self {
        Self {
            location,
            policies: BTreeMap::new(),
            filters: HashMap::new(),
            targets: HashMap::new(),
        }
    }

    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.location.name
    }

    /// Shared location of the namespace.
    pub fn location(&self) -> &Arc<NamespaceLocation> {
        &self.location
    }

    /// Policy documents keyed by key prefix.
    pub fn policies(&self) -> &BTreeMap<String, String> {
        &self.policies
    }

    /// Compiled filters keyed by key prefix.
    pub fn filters(&self) -> &HashMap<String, PolicyFilter> {
        &self.filters
    }

    /// Sync targets keyed by target namespace.
    pub fn targets(&self) -> &HashMap<SyncKey, SyncTarget> {
        &self.targets
    }

    /// Replaces the policies and recompiles every filter.
    ///
    /// A document that fails to compile admits everything.
    pub fn set_policies(&mut self, policies: BTreeMap<String, String>) {
        if policies == self.policies {
            return;
        }

        self.filters = policies
            .iter()
            .map(|(prefix, document)| {
                let filter = hoss_policy::parse(document).unwrap_or_else(|e| {
                    error!(
                        core_service = %self.location.core_service,
                        namespace = %self.location.name,
                        prefix = %prefix,
                        error = %e,
                        "problem parsing sync policy, failing open"
                    );
                    PolicyFilter::allow_all()
                });
                (prefix.clone(), filter)
            })
            .collect();
        self.policies = policies;
    }

    /// Adds a target, or updates the kind of an existing one.
    pub fn upsert_target(&mut self, key: SyncKey, kind: SyncKind) {
        self.targets
            .entry(key)
            .and_modify(|target| target.kind = kind)
            .or_insert_with(|| SyncTarget::unlinked(kind));
    }

    /// Removes a target. Policies and filters are cleared with the last one.
    pub fn remove_target(&mut self, key: &SyncKey) -> Option<SyncTarget> {
        let removed = self.targets.remove(key);
        if self.targets.is_empty() {
            self.policies.clear();
            self.filters.clear();
        }
        removed
    }

    pub(crate) fn link_target(&mut self, key: &SyncKey, location: &Arc<NamespaceLocation>) {
        if let Some(target) = self.targets.get_mut(key) {
            target.target = Some(Arc::downgrade(location));
        }
    }

    pub(crate) fn unlinked_targets(&self) -> impl Iterator<Item = &SyncKey> {
        self.targets
            .iter()
            .filter(|(_, target)| !target.is_linked())
            .map(|(key, _)| key)
    }

    /// Returns the longest policy prefix the key starts with.
    pub fn lookup_prefix(&self, key: &str) -> Option<&str> {
        self.policies
            .keys()
            .filter(|prefix| key.starts_with(prefix.as_str()))
            .max_by_key(|prefix| prefix.len())
            .map(String::as_str)
    }

    /// Returns the filter for the longest matching prefix.
    pub fn filter_for(&self, key: &str) -> Option<PolicyFilter> {
        let prefix = self.lookup_prefix(key)?;
        Some(self.filters.get(prefix).cloned().unwrap_or_else(PolicyFilter::allow_all))
    }

    /// Returns the resolved targets, in no particular order.
    pub fn linked_targets(&self) -> Vec<(SyncKey, SyncKind, Arc<NamespaceLocation>)> {
        self.targets
            .iter()
            .filter_map(|(key, target)| {
                target
                    .location()
                    .map(|location| (key.clone(), target.kind, location))
            })
            .collect()
    }
}

/// The lock-guarded state of a core service node.
#[derive(Debug, Default)]
pub struct CoreServiceState {
    /// Object stores by name. Populated once at startup.
    pub object_stores: HashMap<String, Arc<ObjectStoreConfig>>,
    /// Namespaces by name. Created on first use, never removed.
    pub namespaces: HashMap<String, NamespaceConfig>,
}

impl CoreServiceState {
    /// Finds the object store serving a storage endpoint.
    pub fn object_store_by_endpoint(&self, endpoint: &str) -> Option<&Arc<ObjectStoreConfig>> {
        self.object_stores
            .values()
            .find(|store| store.endpoint == endpoint)
    }

    /// Finds the namespace owning an object: same bucket and storage endpoint,
    /// and a policy prefix the key starts with.
    pub fn namespace_for_object(
        &self,
        bucket: &str,
        endpoint: &str,
        key: &str,
    ) -> Option<&NamespaceConfig> {
        self.namespaces.values().find(|namespace| {
            let location = namespace.location();
            location.bucket == bucket
                && location.object_store.endpoint == endpoint
                && namespace.lookup_prefix(key).is_some()
        })
    }
}

/// A monitored core service.
pub struct CoreServiceConfig {
    endpoint: String,
    api: Arc<dyn CoreServiceApi>,
    state: RwLock<CoreServiceState>,
    work_tx: async_channel::Sender<Message>,
    work_rx: async_channel::Receiver<Message>,
    replay_tx: async_channel::Sender<Message>,
    replay_rx: async_channel::Receiver<Message>,
}

impl fmt::Debug for CoreServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreServiceConfig")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl CoreServiceConfig {
    /// Creates a node with bounded work and replay queues.
    pub fn new(
        endpoint: impl Into<String>,
        api: Arc<dyn CoreServiceApi>,
        object_stores: impl IntoIterator<Item = ObjectStoreConfig>,
        work_capacity: usize,
        replay_capacity: usize,
    ) -> Self {
        let (work_tx, work_rx) = async_channel::bounded(work_capacity.max(1));
        let (replay_tx, replay_rx) = async_channel::bounded(replay_capacity.max(1));
        let state = CoreServiceState {
            object_stores: object_stores
                .into_iter()
                .map(|store| (store.name.clone(), Arc::new(store)))
                .collect(),
            namespaces: HashMap::new(),
        };

        Self {
            endpoint: endpoint.into(),
            api,
            state: RwLock::new(state),
            work_tx,
            work_rx,
            replay_tx,
            replay_rx,
        }
    }

    /// Core service endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// REST client for core services.
    pub fn api(&self) -> &Arc<dyn CoreServiceApi> {
        &self.api
    }

    /// Acquires the shared lock.
    pub fn read(&self) -> RwLockReadGuard<'_, CoreServiceState> {
        self.state.read()
    }

    /// Acquires the exclusive lock. Reserved for the reconciler.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, CoreServiceState> {
        self.state.write()
    }

    /// Sender side of the work queue, fed by the demuxer.
    pub fn work_sender(&self) -> &async_channel::Sender<Message> {
        &self.work_tx
    }

    /// Receiver side of the work queue, drained by workers.
    pub fn work_receiver(&self) -> &async_channel::Receiver<Message> {
        &self.work_rx
    }

    /// Sender side of the replay queue, fed by backfills.
    pub fn replay_sender(&self) -> &async_channel::Sender<Message> {
        &self.replay_tx
    }

    /// Receiver side of the replay queue, drained into the demuxer.
    pub fn replay_receiver(&self) -> &async_channel::Receiver<Message> {
        &self.replay_rx
    }

    /// Closes both queues, waking every blocked sender and receiver.
    pub fn close(&self) {
        self.work_tx.close();
        self.replay_tx.close();
    }
}

/// All nodes, in configuration order.
#[derive(Debug, Default)]
pub struct ConfigGraph {
    nodes: Vec<Arc<CoreServiceConfig>>,
    index: HashMap<String, usize>,
}

impl ConfigGraph {
    /// Creates a graph from its nodes. Later duplicates of an endpoint are dropped.
    pub fn new(nodes: impl IntoIterator<Item = CoreServiceConfig>) -> Self {
        let mut graph = Self::default();
        for node in nodes {
            if graph.index.contains_key(node.endpoint()) {
                continue;
            }
            graph
                .index
                .insert(node.endpoint().to_string(), graph.nodes.len());
            graph.nodes.push(Arc::new(node));
        }
        graph
    }

    /// Returns the node for a core service endpoint.
    pub fn node(&self, endpoint: &str) -> Option<&Arc<CoreServiceConfig>> {
        self.index.get(endpoint).map(|&i| &self.nodes[i])
    }

    /// Returns every node, in configuration order.
    pub fn nodes(&self) -> &[Arc<CoreServiceConfig>] {
        &self.nodes
    }

    /// Rebuilds the relationships the graph currently implements.
    pub fn current_relationships(&self) -> RelationshipSet {
        let mut current = RelationshipSet::new();
        for node in &self.nodes {
            let state = node.read();
            for namespace in state.namespaces.values() {
                for (key, target) in namespace.targets() {
                    let relationship = SyncRelationship {
                        kind: target.kind,
                        source_core_service: node.endpoint().to_string(),
                        source_namespace: namespace.name().to_string(),
                        source_policies: namespace.policies().clone(),
                        target_core_service: key.core_service.clone(),
                        target_namespace: key.namespace.clone(),
                    };
                    current.insert(relationship.identity(), relationship);
                }
            }
        }
        current
    }
}
