//! Storage provider object notifications.

use super::MatchOutcome;
use crate::core_api::{MetadataDocument, SYNC_USER_AGENT};
use crate::error::{SyncError, SyncResult};
use crate::graph::{CoreServiceConfig, NamespaceLocation, ObjectStoreConfig};
use futures::future::{join, join_all};
use hoss_policy::{EventFacts, EventOperation};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// User agent stamped on synthetic backfill events.
pub const BACKFILL_USER_AGENT: &str = "sync/1";

/// Event name a zero-size delete turns into when the object turns out to exist.
const RESTORED_EVENT: &str = "s3:ObjectCreated:Put";

/// Key suffix of dataset descriptor files, which are never replicated.
const DATASET_DESCRIPTOR_SUFFIX: &str = ".dataset.yaml";

/// Characters escaped in keys of synthetic events so that [`BucketEvent::key`]
/// yields the listed key unchanged.
const KEY_ESCAPE: &AsciiSet = &CONTROLS.add(b'%').add(b'+');

/// Escapes a plain object key the way providers escape keys in notifications.
pub(crate) fn escape_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ESCAPE).to_string()
}

/// Body of a `bucket_notification` queue message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketNotification {
    /// One record per object event.
    #[serde(rename = "Records", default)]
    pub records: Vec<BucketEvent>,
}

/// Bucket section of an event record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketEntity {
    /// Bucket name.
    pub name: String,
}

/// Object section of an event record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntity {
    /// Object key, URL-query-escaped.
    pub key: String,
    /// Object size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// Storage section of an event record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Entity {
    /// Bucket the event happened in.
    pub bucket: BucketEntity,
    /// Object the event is about.
    pub object: ObjectEntity,
}

/// Origin of the request that caused the event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    /// Requesting host.
    #[serde(default)]
    pub host: String,
    /// Requesting user agent.
    #[serde(default)]
    pub user_agent: String,
}

/// A single object event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketEvent {
    /// Provider event name, e.g. `s3:ObjectCreated:Put`.
    pub event_name: String,
    /// Event time as reported by the provider.
    #[serde(default)]
    pub event_time: String,
    /// Bucket and object.
    pub s3: S3Entity,
    /// Request origin. Absent in some providers' payloads.
    #[serde(default)]
    pub source: EventSource,
    /// Storage endpoint of the queue the event arrived on.
    #[serde(skip)]
    pub endpoint: String,
}

impl BucketEvent {
    /// Creates an event for an object.
    pub fn new(
        event_name: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            s3: S3Entity {
                bucket: BucketEntity { name: bucket.into() },
                object: ObjectEntity {
                    key: key.into(),
                    size,
                },
            },
            ..Self::default()
        }
    }

    /// Sets the storage endpoint the event came from.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the event time.
    pub fn with_event_time(mut self, time: impl Into<String>) -> Self {
        self.event_time = time.into();
        self
    }

    /// Sets the request origin.
    pub fn with_source(mut self, host: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.source = EventSource {
            host: host.into(),
            user_agent: user_agent.into(),
        };
        self
    }

    /// Bucket name.
    pub fn bucket(&self) -> &str {
        &self.s3.bucket.name
    }

    /// Unescaped object key, or the raw key if it does not decode.
    pub fn key(&self) -> String {
        let raw = &self.s3.object.key;
        let plus_decoded = raw.replace('+', " ");
        match percent_decode_str(&plus_decoded).decode_utf8() {
            Ok(key) => key.into_owned(),
            Err(_) => raw.clone(),
        }
    }

    /// First segment of the key, which names the dataset.
    pub fn dataset(&self) -> String {
        let key = self.key();
        key.split('/').next().unwrap_or_default().to_string()
    }

    /// `<object store>|<bucket>|<dataset>`.
    pub fn dataset_extended(&self, object_store: &str) -> String {
        format!("{}|{}|{}", object_store, self.bucket(), self.dataset())
    }

    /// Operation class of the event.
    pub fn operation(&self) -> EventOperation {
        EventOperation::classify(&self.event_name)
    }

    /// Returns true when the event was caused by the engine's own writes.
    pub fn is_self_generated(&self) -> bool {
        self.source.user_agent.contains(SYNC_USER_AGENT)
    }

    pub(super) fn matches(&self, node: &CoreServiceConfig) -> MatchOutcome {
        if EventOperation::is_access(&self.event_name) {
            return MatchOutcome::IGNORED;
        }

        let known = node.read().object_store_by_endpoint(&self.endpoint).is_some();
        if !known {
            return MatchOutcome::NONE;
        }

        if self.key().ends_with(DATASET_DESCRIPTOR_SUFFIX) {
            debug!(event = %self, "skipping notification for dataset descriptor");
            return MatchOutcome::IGNORED;
        }
        MatchOutcome::MATCHED
    }

    pub(super) async fn execute(mut self, node: &Arc<CoreServiceConfig>) -> SyncResult<()> {
        let store = node
            .read()
            .object_store_by_endpoint(&self.endpoint)
            .cloned()
            .ok_or_else(|| SyncError::UnknownObjectStore {
                core_service: node.endpoint().to_string(),
                name: self.endpoint.clone(),
            })?;
        let key = self.key();

        if self.operation() == EventOperation::Delete && self.s3.object.size == 0 {
            // A removed delete marker exposes the previous version, so an
            // object that still answers a head request has been restored.
            let client = store.client.client()?;
            if client.head_object(self.bucket(), &key).await.is_ok() {
                info!(bucket = %self.bucket(), key = %key, "object restore detected");
                self.event_name = RESTORED_EVENT.to_string();
            }
        }

        let operation = self.operation();
        let metadata = match operation {
            EventOperation::Put => {
                let client = store.client.client()?;
                client.head_object(self.bucket(), &key).await?
            }
            _ => HashMap::new(),
        };

        let targets = if self.is_self_generated() {
            debug!(event = %self, "skipping notification caused by the sync service");
            Vec::new()
        } else {
            self.sync_targets(node, &key, operation, &metadata)
        };

        let index = self.update_index(node, &store, &key, operation, &metadata);
        let copies = targets
            .iter()
            .map(|target| self.sync_to(&store, target, &key, operation, &metadata));
        let (indexed, synced) = join(index, join_all(copies)).await;

        if let Err(e) = indexed {
            error!(event = %self, error = %e, "could not update metadata index");
        }
        for (target, result) in targets.iter().zip(synced) {
            if let Err(e) = result {
                error!(
                    event = %self,
                    target_core_service = %target.core_service,
                    target_namespace = %target.name,
                    error = %e,
                    "failed to sync object"
                );
            }
        }
        Ok(())
    }

    /// Resolves the targets the event must be replicated to.
    fn sync_targets(
        &self,
        node: &CoreServiceConfig,
        key: &str,
        operation: EventOperation,
        metadata: &HashMap<String, String>,
    ) -> Vec<Arc<NamespaceLocation>> {
        if operation == EventOperation::Unsupported {
            debug!(event = %self, "unsupported operation, not syncing");
            return Vec::new();
        }

        let (filter, targets) = {
            let state = node.read();
            let Some(namespace) = state.namespace_for_object(self.bucket(), &self.endpoint, key)
            else {
                return Vec::new();
            };
            let Some(filter) = namespace.filter_for(key) else {
                return Vec::new();
            };
            (filter, namespace.linked_targets())
        };

        let facts = EventFacts::new(operation, key, self.s3.object.size).with_metadata(metadata.clone());
        match filter.evaluate(&facts) {
            Ok(true) => targets.into_iter().map(|(_, _, location)| location).collect(),
            Ok(false) => {
                debug!(event = %self, "sync policy rejected event");
                Vec::new()
            }
            Err(e) => {
                error!(event = %self, error = %e, "cannot apply policy filter to event");
                Vec::new()
            }
        }
    }

    async fn update_index(
        &self,
        node: &CoreServiceConfig,
        store: &ObjectStoreConfig,
        key: &str,
        operation: EventOperation,
        metadata: &HashMap<String, String>,
    ) -> SyncResult<()> {
        let mut document = MetadataDocument {
            core_service_endpoint: node.endpoint().to_string(),
            dataset_extended: self.dataset_extended(&store.name),
            object_key: key.to_string(),
            last_modified_date: String::new(),
            size_bytes: 0,
            metadata: Vec::new(),
        };

        match operation {
            EventOperation::Put => {
                info!(event = %self, "processing metadata event");
                document.last_modified_date = self.event_time.clone();
                document.size_bytes = self.s3.object.size;
                document.metadata = metadata.iter().map(|(k, v)| format!("{k}:{v}")).collect();
                document.metadata.sort();
                node.api().put_metadata_document(node.endpoint(), &document).await
            }
            EventOperation::Delete => {
                info!(event = %self, "processing metadata event");
                node.api()
                    .delete_metadata_document(node.endpoint(), &document)
                    .await
            }
            EventOperation::Unsupported => Ok(()),
        }
    }

    async fn sync_to(
        &self,
        store: &ObjectStoreConfig,
        target: &NamespaceLocation,
        key: &str,
        operation: EventOperation,
        metadata: &HashMap<String, String>,
    ) -> SyncResult<()> {
        let target_client = target.object_store.client.client()?;

        match operation {
            EventOperation::Put => {
                info!(event = %self, target_namespace = %target.name, "processing sync event");
                let source_client = store.client.client()?;
                let body = source_client.get_object(self.bucket(), key).await?;
                target_client
                    .put_object(&target.bucket, key, body, metadata)
                    .await
            }
            EventOperation::Delete => {
                info!(event = %self, target_namespace = %target.name, "processing sync event");
                target_client.delete_object(&target.bucket, key).await
            }
            EventOperation::Unsupported => Ok(()),
        }
    }
}

impl fmt::Display for BucketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<BucketNotification {} {}/{}>",
            self.event_name,
            self.bucket(),
            self.key()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_provider_record() {
        let body = r#"{"Records": [{
            "eventName": "s3:ObjectCreated:Put",
            "eventTime": "2021-03-09T17:04:05.000Z",
            "s3": {
                "bucket": {"name": "bucket"},
                "object": {"key": "ds/my+file%21.txt", "size": 12}
            },
            "source": {"host": "10.0.0.1", "port": "", "userAgent": "MinIO (linux; amd64)"}
        }]}"#;
        let notification: BucketNotification = serde_json::from_str(body).unwrap();
        let event = &notification.records[0];

        assert_eq!(event.operation(), EventOperation::Put);
        assert_eq!(event.key(), "ds/my file!.txt");
        assert_eq!(event.dataset(), "ds");
        assert_eq!(event.dataset_extended("default"), "default|bucket|ds");
        assert!(!event.is_self_generated());
        assert_eq!(event.to_string(), "<BucketNotification s3:ObjectCreated:Put bucket/ds/my file!.txt>");
    }

    #[test]
    fn record_without_source() {
        let body = r#"{"eventName": "ObjectRemoved:Delete",
            "s3": {"bucket": {"name": "b"}, "object": {"key": "k"}}}"#;
        let event: BucketEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.operation(), EventOperation::Delete);
        assert_eq!(event.s3.object.size, 0);
        assert!(event.source.user_agent.is_empty());
    }

    #[test]
    fn escaped_keys_round_trip() {
        for key in ["ds/a+b.txt", "ds/100%.csv", "ds/plain name.txt"] {
            let event = BucketEvent::new("s3:ObjectCreated:Put", "b", escape_key(key), 1);
            assert_eq!(event.key(), key);
        }
    }

    #[test]
    fn undecodable_key_falls_back_to_raw() {
        let event = BucketEvent::new("s3:ObjectCreated:Put", "b", "ds/%FF%FE", 1);
        assert_eq!(event.key(), "ds/%FF%FE");
    }

    #[test]
    fn engine_writes_are_self_generated() {
        let event = BucketEvent::new("s3:ObjectCreated:Put", "b", "ds/f", 1).with_source(
            "core",
            format!("aws-sdk-go-v2/1.0 {SYNC_USER_AGENT}"),
        );
        assert!(event.is_self_generated());
    }
}
