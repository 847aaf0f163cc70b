//! The upstream core service REST API, as consumed by the engine.

use crate::desired::{SyncKind, SyncRelationship};
use crate::error::SyncResult;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User agent marking requests made by the engine itself.
///
/// Storage events carrying this marker were caused by replication and are not
/// replicated again.
pub const SYNC_USER_AGENT: &str = "exec-env/hoss-sync-service";

/// An object store registered with a core service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreInfo {
    /// Object store name.
    pub name: String,
    /// Storage endpoint, as it appears in bucket notifications.
    pub endpoint: String,
}

/// A namespace as returned by `GET /namespace/{name}`. Only used fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    /// Namespace name.
    pub name: String,
    /// Object store holding the namespace bucket.
    pub object_store: ObjectStoreInfo,
    /// Bucket name.
    pub bucket_name: String,
}

/// Temporary object store credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StsCredentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
    /// Expiration timestamp.
    #[serde(default)]
    pub expiration: String,
    /// Storage endpoint.
    #[serde(default)]
    pub endpoint: String,
    /// Storage region.
    #[serde(default)]
    pub region: String,
}

/// A notification queue the engine must consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationQueueConfig {
    /// Transport kind (`amqp`, `sqs`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Transport-specific settings.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl NotificationQueueConfig {
    fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(serde_json::Value::as_str)
    }

    /// Body format of the queue (`bucket_notification` or `api_notification`).
    pub fn message_type(&self) -> Option<&str> {
        self.setting("message_type")
    }

    /// Storage endpoint stamped onto decoded bucket notifications.
    pub fn source_endpoint(&self) -> Option<&str> {
        self.setting("source_endpoint")
    }
}

/// Body of `POST /namespace/{ns}/dataset/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDatasetRequest {
    /// Dataset name.
    pub name: String,
    /// Dataset description.
    pub description: String,
}

/// Body of `PUT /namespace/{ns}/dataset/{ds}/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSyncRequest {
    /// Sync kind to enable.
    pub sync_type: SyncKind,
    /// Policy document for the dataset.
    pub sync_policy: String,
}

/// Body of `PUT /namespace/{ns}/sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSyncRequest {
    /// Core service on the other side of the relationship.
    pub target_core_service: String,
    /// Namespace on the other side of the relationship.
    pub target_namespace: String,
    /// Sync kind to enable.
    pub sync_type: SyncKind,
}

/// An entry of the core service's object metadata search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDocument {
    /// Core service root owning the object.
    pub core_service_endpoint: String,
    /// `<object store>|<bucket>|<dataset>`.
    pub dataset_extended: String,
    /// Object key in the bucket.
    pub object_key: String,
    /// Event time; empty for removals.
    pub last_modified_date: String,
    /// Object size in bytes.
    pub size_bytes: u64,
    /// `key:value` metadata pairs.
    pub metadata: Vec<String>,
}

impl MetadataDocument {
    /// Deterministic id of the indexed object.
    pub fn document_id(&self) -> String {
        STANDARD.encode(format!(
            "{}|{}|{}",
            self.core_service_endpoint, self.dataset_extended, self.object_key
        ))
    }
}

/// Core service operations used by the engine.
///
/// Every call names the core service endpoint it targets, so one client
/// serves all monitored core services.
#[async_trait]
pub trait CoreServiceApi: Send + Sync {
    /// Checks that the core service is accepting requests.
    async fn ping(&self, endpoint: &str) -> SyncResult<()>;

    /// Lists the notification queues to consume.
    async fn queue_configurations(&self, endpoint: &str)
        -> SyncResult<Vec<NotificationQueueConfig>>;

    /// Reads the sync relationships. Returns `None` when nothing changed
    /// since `if_modified_since`.
    async fn sync_relationships(
        &self,
        endpoint: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> SyncResult<Option<Vec<SyncRelationship>>>;

    /// Reads a namespace.
    async fn namespace(&self, endpoint: &str, name: &str) -> SyncResult<NamespaceInfo>;

    /// Lists the object stores.
    async fn object_stores(&self, endpoint: &str) -> SyncResult<Vec<ObjectStoreInfo>>;

    /// Issues temporary credentials for an object store.
    async fn sts_credentials(&self, endpoint: &str, object_store: &str)
        -> SyncResult<StsCredentials>;

    /// Creates a dataset. An already existing dataset is not an error.
    async fn create_dataset(
        &self,
        endpoint: &str,
        namespace: &str,
        request: &CreateDatasetRequest,
    ) -> SyncResult<()>;

    /// Grants a group access to a dataset.
    async fn put_dataset_permission(
        &self,
        endpoint: &str,
        namespace: &str,
        dataset: &str,
        group: &str,
        permission: &str,
    ) -> SyncResult<()>;

    /// Revokes a group's access to a dataset.
    async fn delete_dataset_permission(
        &self,
        endpoint: &str,
        namespace: &str,
        dataset: &str,
        group: &str,
    ) -> SyncResult<()>;

    /// Enables sync on a dataset.
    async fn put_dataset_sync(
        &self,
        endpoint: &str,
        namespace: &str,
        dataset: &str,
        request: &DatasetSyncRequest,
    ) -> SyncResult<()>;

    /// Enables sync on a namespace.
    async fn put_namespace_sync(
        &self,
        endpoint: &str,
        namespace: &str,
        request: &NamespaceSyncRequest,
    ) -> SyncResult<()>;

    /// Adds or replaces an object in the metadata index.
    async fn put_metadata_document(&self, endpoint: &str, document: &MetadataDocument)
        -> SyncResult<()>;

    /// Removes an object from the metadata index.
    async fn delete_metadata_document(
        &self,
        endpoint: &str,
        document: &MetadataDocument,
    ) -> SyncResult<()>;
}
