//! Core service lifecycle notifications.

use super::bucket::escape_key;
use super::{BucketEvent, ExecuteContext, MatchOutcome, Message, BACKFILL_USER_AGENT};
use crate::core_api::{CreateDatasetRequest, DatasetSyncRequest, NamespaceSyncRequest};
use crate::desired::SyncKind;
use crate::error::{SyncError, SyncResult};
use crate::graph::{CoreServiceConfig, NamespaceLocation, SyncKey};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Event name of synthetic backfill events.
const BACKFILL_EVENT: &str = "s3:ObjectCreated:Put";

/// Timestamp format of synthetic backfill events.
const BACKFILL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Kind of lifecycle change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ApiEventType {
    /// A namespace was created on the source.
    CreateNamespace,
    /// A group was granted access to a dataset.
    PutDatasetPermission,
    /// A group's access to a dataset was revoked.
    DeleteDatasetPermission,
    /// Sync was enabled on a dataset.
    PutDatasetSync,
    /// Duplex sync was enabled on a dataset.
    PutDatasetDuplex,
    /// Duplex sync was enabled on a namespace.
    PutNamespaceDuplex,
    /// Anything this engine does not know.
    Unknown,
}

impl ApiEventType {
    /// Returns the wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiEventType::CreateNamespace => "create-namespace",
            ApiEventType::PutDatasetPermission => "put-ds-perm",
            ApiEventType::DeleteDatasetPermission => "delete-ds-perm",
            ApiEventType::PutDatasetSync => "put-ds-sync",
            ApiEventType::PutDatasetDuplex => "put-ds-duplex",
            ApiEventType::PutNamespaceDuplex => "put-ns-duplex",
            ApiEventType::Unknown => "unknown",
        }
    }
}

impl From<String> for ApiEventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "create-namespace" => ApiEventType::CreateNamespace,
            "put-ds-perm" => ApiEventType::PutDatasetPermission,
            "delete-ds-perm" => ApiEventType::DeleteDatasetPermission,
            "put-ds-sync" => ApiEventType::PutDatasetSync,
            "put-ds-duplex" => ApiEventType::PutDatasetDuplex,
            "put-ns-duplex" => ApiEventType::PutNamespaceDuplex,
            _ => ApiEventType::Unknown,
        }
    }
}

impl From<ApiEventType> for String {
    fn from(value: ApiEventType) -> Self {
        value.as_str().to_string()
    }
}

/// A lifecycle notification emitted by a core service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEvent {
    /// What changed.
    pub event_type: ApiEventType,
    /// Endpoint of the core service that emitted the event.
    pub source_endpoint: String,
    /// Source namespace.
    #[serde(default)]
    pub namespace: String,
    /// Dataset, for dataset events.
    #[serde(default)]
    pub dataset: String,
    /// Dataset description, for `put-ds-sync`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Group, for permission events.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// Access level, for `put-ds-perm`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permission: String,
    /// Object store, for `create-namespace`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub object_store: String,
    /// Target core service, for `put-ns-duplex`.
    #[serde(default)]
    pub target_core_service: String,
    /// Target namespace, for `put-ns-duplex`.
    #[serde(default)]
    pub target_namespace: String,
    /// Policy document, for `put-ds-duplex`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sync_policy: String,
    #[serde(skip)]
    has_reloaded: bool,
}

impl ApiEvent {
    /// Creates an event about a namespace of a core service.
    pub fn new(
        event_type: ApiEventType,
        source_endpoint: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            source_endpoint: source_endpoint.into(),
            namespace: namespace.into(),
            dataset: String::new(),
            description: String::new(),
            group: String::new(),
            permission: String::new(),
            object_store: String::new(),
            target_core_service: String::new(),
            target_namespace: String::new(),
            sync_policy: String::new(),
            has_reloaded: false,
        }
    }

    /// Sets the dataset.
    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    /// Sets the dataset description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the group and access level.
    pub fn with_permission(mut self, group: impl Into<String>, permission: impl Into<String>) -> Self {
        self.group = group.into();
        self.permission = permission.into();
        self
    }

    /// Sets the object store.
    pub fn with_object_store(mut self, object_store: impl Into<String>) -> Self {
        self.object_store = object_store.into();
        self
    }

    /// Sets the target namespace.
    pub fn with_target(
        mut self,
        core_service: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        self.target_core_service = core_service.into();
        self.target_namespace = namespace.into();
        self
    }

    /// Sets the policy document.
    pub fn with_sync_policy(mut self, policy: impl Into<String>) -> Self {
        self.sync_policy = policy.into();
        self
    }

    pub(super) fn require_reload(&mut self) -> bool {
        if self.has_reloaded {
            return false;
        }
        self.has_reloaded = true;
        // Both need the targets created by the change they announce.
        matches!(
            self.event_type,
            ApiEventType::PutDatasetSync | ApiEventType::PutNamespaceDuplex
        )
    }

    pub(super) fn matches(&self, node: &CoreServiceConfig) -> MatchOutcome {
        if node.endpoint() != self.source_endpoint {
            return MatchOutcome::NONE;
        }
        if self.event_type == ApiEventType::CreateNamespace {
            // The namespace is unknown until sync is enabled on it.
            return MatchOutcome::MATCHED;
        }
        MatchOutcome::matched_if(node.read().namespaces.contains_key(&self.namespace))
    }

    pub(super) async fn execute(self, node: &Arc<CoreServiceConfig>, ctx: &ExecuteContext) -> SyncResult<()> {
        match self.event_type {
            ApiEventType::CreateNamespace => {
                self.refresh_object_store(node).await;
                return Ok(());
            }
            ApiEventType::Unknown => {
                return Err(SyncError::Decode(format!("unhandled API sync event {self}")));
            }
            _ => {}
        }

        let (source, targets) = {
            let state = node.read();
            let namespace = state.namespaces.get(&self.namespace).ok_or_else(|| {
                SyncError::UnknownNamespace {
                    core_service: node.endpoint().to_string(),
                    namespace: self.namespace.clone(),
                }
            })?;
            (namespace.location().clone(), namespace.linked_targets())
        };

        let duplex_target = SyncKey::new(&self.target_core_service, &self.target_namespace);
        let targets: Vec<_> = targets
            .into_iter()
            .filter(|(key, _, _)| {
                self.event_type != ApiEventType::PutNamespaceDuplex || *key == duplex_target
            })
            .map(|(_, _, location)| location)
            .collect();

        if targets.is_empty() {
            debug!(event = %self, "no sync targets");
            return Ok(());
        }

        if self.event_type == ApiEventType::PutDatasetSync {
            self.spawn_backfill(node, source, ctx);
        }

        let results = join_all(targets.iter().map(|target| self.apply(node, target))).await;
        for (target, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                error!(
                    event = %self,
                    target_core_service = %target.core_service,
                    target_namespace = %target.name,
                    error = %e,
                    "failed to apply API sync event"
                );
            }
        }
        Ok(())
    }

    async fn refresh_object_store(&self, node: &CoreServiceConfig) {
        let store = node.read().object_stores.get(&self.object_store).cloned();
        match store {
            Some(store) => {
                info!(object_store = %store.name, "namespace created, forcing refresh of object store client");
                store.client.force_refresh().await;
            }
            None => warn!(
                core_service = %node.endpoint(),
                object_store = %self.object_store,
                "namespace created in unknown object store"
            ),
        }
    }

    /// Mirrors the change onto one target namespace.
    async fn apply(&self, node: &CoreServiceConfig, target: &NamespaceLocation) -> SyncResult<()> {
        let api = node.api();
        let endpoint = target.core_service.as_str();

        match self.event_type {
            ApiEventType::PutDatasetPermission => {
                api.put_dataset_permission(
                    endpoint,
                    &target.name,
                    &self.dataset,
                    &self.group,
                    &self.permission,
                )
                .await
            }
            ApiEventType::DeleteDatasetPermission => {
                api.delete_dataset_permission(endpoint, &target.name, &self.dataset, &self.group)
                    .await
            }
            ApiEventType::PutDatasetSync => {
                let request = CreateDatasetRequest {
                    name: self.dataset.clone(),
                    description: self.description.clone(),
                };
                api.create_dataset(endpoint, &target.name, &request).await
            }
            ApiEventType::PutDatasetDuplex => {
                let request = DatasetSyncRequest {
                    sync_type: SyncKind::Duplex,
                    sync_policy: self.sync_policy.clone(),
                };
                api.put_dataset_sync(endpoint, &target.name, &self.dataset, &request)
                    .await
            }
            ApiEventType::PutNamespaceDuplex => {
                let request = NamespaceSyncRequest {
                    target_core_service: self.source_endpoint.clone(),
                    target_namespace: self.namespace.clone(),
                    sync_type: SyncKind::Duplex,
                };
                api.put_namespace_sync(endpoint, &self.target_namespace, &request)
                    .await
            }
            ApiEventType::CreateNamespace | ApiEventType::Unknown => Ok(()),
        }
    }

    /// Replays every pre-existing object of the dataset once the targets
    /// have had time to create it.
    fn spawn_backfill(&self, node: &Arc<CoreServiceConfig>, source: Arc<NamespaceLocation>, ctx: &ExecuteContext) {
        let replay = node.replay_sender().clone();
        let dataset = self.dataset.clone();
        let host = self.source_endpoint.clone();
        let delay = ctx.backfill_delay;
        let cancel = ctx.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            info!(dataset = %dataset, "populating sync queue with existing objects");
            match backfill(&source, &dataset, &host, &replay, &cancel).await {
                Ok(count) => info!(dataset = %dataset, count, "finished populating sync queue"),
                Err(SyncError::Cancelled) => debug!(dataset = %dataset, "backfill cancelled"),
                Err(e) => error!(dataset = %dataset, error = %e, "failed to populate sync queue"),
            }
        });
    }
}

async fn backfill(
    source: &NamespaceLocation,
    dataset: &str,
    host: &str,
    replay: &async_channel::Sender<Message>,
    cancel: &CancellationToken,
) -> SyncResult<usize> {
    let client = source.object_store.client.client()?;
    let prefix = format!("{dataset}/");
    let mut continuation = None;
    let mut count = 0;

    loop {
        let page = client
            .list_objects(&source.bucket, &prefix, continuation.take())
            .await?;

        for object in page.objects {
            let event = BucketEvent::new(BACKFILL_EVENT, &source.bucket, escape_key(&object.key), object.size)
                .with_event_time(Utc::now().format(BACKFILL_TIME_FORMAT).to_string())
                .with_source(host, BACKFILL_USER_AGENT)
                .with_endpoint(&source.object_store.endpoint);

            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                sent = replay.send(Message::Bucket(event)) => {
                    sent.map_err(|_| SyncError::Cancelled)?;
                }
            }
            count += 1;
        }

        match page.next_continuation_token {
            Some(token) => continuation = Some(token),
            None => return Ok(count),
        }
    }
}

impl fmt::Display for ApiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<ApiSyncNotification {} {}/{}>",
            self.event_type.as_str(),
            self.namespace,
            self.dataset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_api_notification() {
        let body = r#"{
            "event_type": "put-ds-perm",
            "source_endpoint": "http://core-a/v1",
            "namespace": "ns",
            "dataset": "ds",
            "group": "g1",
            "permission": "read_write",
            "target_core_service": "",
            "target_namespace": ""
        }"#;
        let event: ApiEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.event_type, ApiEventType::PutDatasetPermission);
        assert_eq!(event.permission, "read_write");
        assert_eq!(event.to_string(), "<ApiSyncNotification put-ds-perm ns/ds>");
    }

    #[test]
    fn unknown_event_type_decodes() {
        let body = r#"{"event_type": "rename-ds", "source_endpoint": "http://core-a/v1"}"#;
        let event: ApiEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.event_type, ApiEventType::Unknown);
    }

    #[test]
    fn reload_is_requested_once() {
        let mut event = ApiEvent::new(ApiEventType::PutDatasetSync, "http://core-a/v1", "ns");
        assert!(event.require_reload());
        assert!(!event.require_reload());

        let mut event = ApiEvent::new(ApiEventType::PutNamespaceDuplex, "http://core-a/v1", "ns");
        assert!(event.require_reload());
        assert!(!event.require_reload());

        let mut event = ApiEvent::new(ApiEventType::PutDatasetPermission, "http://core-a/v1", "ns");
        assert!(!event.require_reload());
    }
}
