//! The reconciler: rebuilds the routing graph from polled desired state.
//!
//! The reconciler is the only writer of the [`ConfigGraph`]. Each pass diffs
//! the union of every monitor's relationships against the relationships the
//! graph currently implements, by identity, and applies the difference:
//!
//! 1. Look up every namespace the pass has to create, without holding locks.
//! 2. Write-lock the touched nodes in endpoint order.
//! 3. Apply every deletion, then every creation.
//! 4. Link unresolved targets to their namespaces, creating them on demand.
//! 5. Release the locks and wake [`ReloadHandle::force_reload`] callers.

use crate::core_api::NamespaceInfo;
use crate::desired::{self, RelationshipSet, SyncRelationship};
use crate::graph::{
    ConfigGraph, CoreServiceState, NamespaceConfig, NamespaceLocation, SyncKey,
};
use crate::monitor::DesiredStateMonitor;
use futures::future::join_all;
use parking_lot::RwLockWriteGuard;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The changes a reconciliation pass applies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Desired relationships the graph does not implement yet.
    pub to_create: Vec<SyncRelationship>,
    /// Implemented relationships that are no longer desired.
    pub to_delete: Vec<SyncRelationship>,
}

impl ReconcilePlan {
    /// Diffs desired against current state by identity. Relationships
    /// present in both are left alone.
    pub fn diff(mut desired: RelationshipSet, mut current: RelationshipSet) -> Self {
        desired.retain(|id, _| current.remove(id).is_none());

        let mut to_create: Vec<_> = desired.into_iter().collect();
        let mut to_delete: Vec<_> = current.into_iter().collect();
        to_create.sort_by(|a, b| a.0.cmp(&b.0));
        to_delete.sort_by(|a, b| a.0.cmp(&b.0));

        Self {
            to_create: to_create.into_iter().map(|(_, r)| r).collect(),
            to_delete: to_delete.into_iter().map(|(_, r)| r).collect(),
        }
    }

    /// Returns true when nothing changes.
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }
}

type Guards<'a> = BTreeMap<&'a str, RwLockWriteGuard<'a, CoreServiceState>>;

/// Handle for requesting a reconciliation and waiting for it.
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    requests: mpsc::Sender<()>,
    finished: watch::Receiver<u64>,
    fallback: Duration,
}

impl ReloadHandle {
    /// Re-polls every core service, reconciles, and returns once the pass
    /// has finished. Never blocks longer than the fallback timeout.
    pub async fn force_reload(&self) {
        let mut finished = self.finished.clone();
        finished.borrow_and_update();

        if self.requests.send(()).await.is_err() {
            return;
        }
        if tokio::time::timeout(self.fallback, finished.changed()).await.is_err() {
            debug!("forced reload timed out waiting for reconciliation");
        }
    }

    /// Number of reconciliation passes finished so far.
    pub fn generation(&self) -> u64 {
        *self.finished.borrow()
    }
}

/// Single-threaded control loop owning all graph mutations.
pub struct Reconciler {
    graph: Arc<ConfigGraph>,
    monitors: Vec<Arc<DesiredStateMonitor>>,
    requests: mpsc::Receiver<()>,
    finished: watch::Sender<u64>,
}

impl Reconciler {
    /// Creates a reconciler and the handle used to force reloads.
    pub fn new(
        graph: Arc<ConfigGraph>,
        monitors: Vec<Arc<DesiredStateMonitor>>,
        fallback: Duration,
    ) -> (Self, ReloadHandle) {
        let (requests_tx, requests) = mpsc::channel(32);
        let (finished, finished_rx) = watch::channel(0);

        let reconciler = Self {
            graph,
            monitors,
            requests,
            finished,
        };
        let handle = ReloadHandle {
            requests: requests_tx,
            finished: finished_rx,
            fallback,
        };
        (reconciler, handle)
    }

    /// Union of every monitor's relationships.
    pub fn desired(&self) -> RelationshipSet {
        desired::index(self.monitors.iter().flat_map(|monitor| monitor.snapshot()))
    }

    /// Runs until cancelled, reconciling on every change notice and every
    /// forced reload request.
    pub async fn run(mut self, changed: Arc<Notify>, cancel: CancellationToken) {
        info!("starting core service configuration update muxer");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = self.requests.recv() => {
                    // concurrent requests share one pass
                    while self.requests.try_recv().is_ok() {}
                    join_all(self.monitors.iter().map(|monitor| monitor.refresh())).await;
                    self.reconcile().await;
                }
                _ = changed.notified() => {
                    info!("received notice of sync configuration change");
                    self.reconcile().await;
                }
            }
        }

        info!("update muxer is stopping");
    }

    /// Runs one reconciliation pass and returns what it changed.
    pub async fn reconcile(&self) -> ReconcilePlan {
        let plan = ReconcilePlan::diff(self.desired(), self.graph.current_relationships());
        let missing = self.missing_namespaces(&plan);
        let infos = self.fetch_namespaces(missing).await;

        self.apply(&plan, &infos);

        self.finished.send_modify(|generation| *generation += 1);
        info!(
            created = plan.to_create.len(),
            deleted = plan.to_delete.len(),
            "finished with sync configuration update"
        );
        plan
    }

    /// Namespaces the pass may have to create, by owning core service.
    fn missing_namespaces(&self, plan: &ReconcilePlan) -> BTreeSet<SyncKey> {
        let mut wanted = BTreeSet::new();
        for relationship in &plan.to_create {
            wanted.insert(SyncKey::new(
                &relationship.source_core_service,
                &relationship.source_namespace,
            ));
            wanted.insert(SyncKey::new(
                &relationship.target_core_service,
                &relationship.target_namespace,
            ));
        }
        for node in self.graph.nodes() {
            let state = node.read();
            for namespace in state.namespaces.values() {
                wanted.extend(namespace.unlinked_targets().cloned());
            }
        }

        wanted.retain(|key| match self.graph.node(&key.core_service) {
            Some(node) => !node.read().namespaces.contains_key(&key.namespace),
            None => false,
        });
        wanted
    }

    async fn fetch_namespaces(&self, keys: BTreeSet<SyncKey>) -> HashMap<SyncKey, NamespaceInfo> {
        let lookups = keys.into_iter().filter_map(|key| {
            let node = self.graph.node(&key.core_service)?.clone();
            Some(async move {
                let result = node.api().namespace(node.endpoint(), &key.namespace).await;
                (key, result)
            })
        });

        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(key, result)| match result {
                Ok(info) => Some((key, info)),
                Err(e) => {
                    warn!(
                        core_service = %key.core_service,
                        namespace = %key.namespace,
                        error = %e,
                        "could not get namespace information"
                    );
                    None
                }
            })
            .collect()
    }

    /// Nodes a pass writes to: plan sources, nodes with unresolved targets,
    /// and every node owning a namespace that may have to be created.
    fn touched_nodes(&self, plan: &ReconcilePlan) -> BTreeSet<String> {
        let mut touched = BTreeSet::new();
        for relationship in plan.to_delete.iter().chain(&plan.to_create) {
            touched.insert(relationship.source_core_service.clone());
            touched.insert(relationship.target_core_service.clone());
        }
        for node in self.graph.nodes() {
            let state = node.read();
            for namespace in state.namespaces.values() {
                for key in namespace.unlinked_targets() {
                    touched.insert(node.endpoint().to_string());
                    touched.insert(key.core_service.clone());
                }
            }
        }
        touched.retain(|endpoint| self.graph.node(endpoint).is_some());
        touched
    }

    fn apply(&self, plan: &ReconcilePlan, infos: &HashMap<SyncKey, NamespaceInfo>) {
        let touched = self.touched_nodes(plan);
        if touched.is_empty() {
            return;
        }

        // Locks are taken in endpoint order.
        let mut guards: Guards<'_> = touched
            .iter()
            .filter_map(|endpoint| self.graph.node(endpoint))
            .map(|node| (node.endpoint(), node.write()))
            .collect();

        for relationship in &plan.to_delete {
            debug!(relationship = %relationship, "deleting sync relationship");
            let Some(state) = guards.get_mut(relationship.source_core_service.as_str()) else {
                continue;
            };
            if let Some(namespace) = state.namespaces.get_mut(&relationship.source_namespace) {
                namespace.remove_target(&SyncKey::new(
                    &relationship.target_core_service,
                    &relationship.target_namespace,
                ));
            }
        }

        for relationship in &plan.to_create {
            debug!(relationship = %relationship, "adding sync relationship");
            let source = SyncKey::new(
                &relationship.source_core_service,
                &relationship.source_namespace,
            );
            let Some(namespace) = ensure_namespace(&mut guards, &source, infos) else {
                warn!(relationship = %relationship, "skipping sync relationship with unresolvable source");
                continue;
            };
            namespace.set_policies(relationship.source_policies.clone());
            namespace.upsert_target(
                SyncKey::new(
                    &relationship.target_core_service,
                    &relationship.target_namespace,
                ),
                relationship.kind,
            );
        }

        link_targets(&mut guards, infos);
    }
}

/// Returns the namespace, creating it from prefetched information if needed.
fn ensure_namespace<'g>(
    guards: &'g mut Guards<'_>,
    key: &SyncKey,
    infos: &HashMap<SyncKey, NamespaceInfo>,
) -> Option<&'g mut NamespaceConfig> {
    let state = guards.get_mut(key.core_service.as_str())?;

    if !state.namespaces.contains_key(&key.namespace) {
        let info = infos.get(key)?;
        let Some(object_store) = state.object_stores.get(&info.object_store.name).cloned() else {
            warn!(
                core_service = %key.core_service,
                namespace = %key.namespace,
                object_store = %info.object_store.name,
                "namespace lives in an unknown object store"
            );
            return None;
        };

        let location = Arc::new(NamespaceLocation {
            core_service: key.core_service.clone(),
            name: key.namespace.clone(),
            object_store,
            bucket: info.bucket_name.clone(),
        });
        state
            .namespaces
            .insert(key.namespace.clone(), NamespaceConfig::new(location));
    }

    state.namespaces.get_mut(&key.namespace)
}

/// Resolves every unlinked target, creating target namespaces this process
/// has never seen as a source.
fn link_targets(guards: &mut Guards<'_>, infos: &HashMap<SyncKey, NamespaceInfo>) {
    let mut pending = Vec::new();
    for (endpoint, state) in guards.iter() {
        for namespace in state.namespaces.values() {
            for key in namespace.unlinked_targets() {
                pending.push((
                    SyncKey::new(*endpoint, namespace.name()),
                    key.clone(),
                ));
            }
        }
    }

    for (source, target) in pending {
        let Some(location) = ensure_namespace(guards, &target, infos).map(|ns| ns.location().clone())
        else {
            warn!(
                core_service = %target.core_service,
                namespace = %target.namespace,
                "could not resolve sync target, will retry on next update"
            );
            continue;
        };

        if let Some(namespace) = guards
            .get_mut(source.core_service.as_str())
            .and_then(|state| state.namespaces.get_mut(&source.namespace))
        {
            namespace.link_target(&target, &location);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::SyncKind;

    #[test]
    fn diff_leaves_unchanged_relationships_alone() {
        let kept = SyncRelationship::new(SyncKind::Simplex, ("a", "ns"), ("b", "ns"));
        let added = SyncRelationship::new(SyncKind::Duplex, ("a", "ns"), ("c", "ns"));
        let removed = SyncRelationship::new(SyncKind::Simplex, ("a", "ns"), ("d", "ns"));

        let plan = ReconcilePlan::diff(
            desired::index([kept.clone(), added.clone()]),
            desired::index([kept, removed.clone()]),
        );
        assert_eq!(plan.to_create, vec![added]);
        assert_eq!(plan.to_delete, vec![removed]);

        let plan = ReconcilePlan::diff(RelationshipSet::new(), RelationshipSet::new());
        assert!(plan.is_empty());
    }

    #[test]
    fn kind_change_is_delete_plus_create() {
        let simplex = SyncRelationship::new(SyncKind::Simplex, ("a", "ns"), ("b", "ns"));
        let mut duplex = simplex.clone();
        duplex.kind = SyncKind::Duplex;

        let plan = ReconcilePlan::diff(desired::index([duplex]), desired::index([simplex]));
        assert_eq!(plan.to_create.len(), 1);
        assert_eq!(plan.to_delete.len(), 1);
    }
}
