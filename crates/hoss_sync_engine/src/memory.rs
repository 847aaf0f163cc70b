//! In-memory collaborators for testing.
//!
//! These implement the engine's capability traits without any network:
//!
//! - [`MemoryCoreServices`]: any number of core services behind one
//!   [`CoreServiceApi`], recording every mutating call.
//! - [`MemoryObjectStore`]: buckets of objects with paginated listings and
//!   chunked bodies.
//! - [`StaticClient`] and [`StaticClientFactory`]: storage clients that never expire.
//! - [`MemoryQueueFactory`] and [`ChannelQueue`]: notification queues fed
//!   with raw bodies through a sender handle.

use crate::core_api::{
    CoreServiceApi, CreateDatasetRequest, DatasetSyncRequest, MetadataDocument, NamespaceInfo,
    NamespaceSyncRequest, NotificationQueueConfig, ObjectStoreInfo, StsCredentials,
};
use crate::desired::SyncRelationship;
use crate::error::{SyncError, SyncResult};
use crate::message::Message;
use crate::object_store::{
    ClientFactory, ObjectBody, ObjectListing, ObjectStoreClient, ObjectSummary, RenewingClient,
};
use crate::queue::{self, MessageFormat, Queue, QueueFactory};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::error;

/// A mutating call received by [`MemoryCoreServices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    /// `POST /namespace/{ns}/dataset/`.
    CreateDataset {
        /// Core service endpoint.
        endpoint: String,
        /// Namespace name.
        namespace: String,
        /// Request body.
        request: CreateDatasetRequest,
    },
    /// `PUT /namespace/{ns}/dataset/{ds}/group/{g}/access/{perm}`.
    PutDatasetPermission {
        /// Core service endpoint.
        endpoint: String,
        /// Namespace name.
        namespace: String,
        /// Dataset name.
        dataset: String,
        /// Group name.
        group: String,
        /// Access level.
        permission: String,
    },
    /// `DELETE /namespace/{ns}/dataset/{ds}/group/{g}`.
    DeleteDatasetPermission {
        /// Core service endpoint.
        endpoint: String,
        /// Namespace name.
        namespace: String,
        /// Dataset name.
        dataset: String,
        /// Group name.
        group: String,
    },
    /// `PUT /namespace/{ns}/dataset/{ds}/sync`.
    PutDatasetSync {
        /// Core service endpoint.
        endpoint: String,
        /// Namespace name.
        namespace: String,
        /// Dataset name.
        dataset: String,
        /// Request body.
        request: DatasetSyncRequest,
    },
    /// `PUT /namespace/{ns}/sync`.
    PutNamespaceSync {
        /// Core service endpoint.
        endpoint: String,
        /// Namespace name.
        namespace: String,
        /// Request body.
        request: NamespaceSyncRequest,
    },
    /// `PUT /search/document/metadata`.
    PutMetadata {
        /// Core service endpoint.
        endpoint: String,
        /// Indexed document.
        document: MetadataDocument,
    },
    /// `DELETE /search/document/metadata`.
    DeleteMetadata {
        /// Core service endpoint.
        endpoint: String,
        /// Removed document.
        document: MetadataDocument,
    },
}

#[derive(Debug)]
struct CoreServiceRecord {
    available: bool,
    object_stores: Vec<ObjectStoreInfo>,
    namespaces: HashMap<String, NamespaceInfo>,
    relationships: Vec<SyncRelationship>,
    modified: DateTime<Utc>,
    queues: Vec<NotificationQueueConfig>,
    documents: HashMap<String, MetadataDocument>,
}

impl CoreServiceRecord {
    fn new() -> Self {
        Self {
            available: true,
            object_stores: Vec::new(),
            namespaces: HashMap::new(),
            relationships: Vec::new(),
            modified: Utc::now(),
            queues: Vec::new(),
            documents: HashMap::new(),
        }
    }
}

/// Core services held in memory.
#[derive(Debug, Default)]
pub struct MemoryCoreServices {
    services: RwLock<HashMap<String, CoreServiceRecord>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl MemoryCoreServices {
    /// Creates an empty set of core services.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a core service.
    pub fn add_core_service(&self, endpoint: &str) {
        self.services
            .write()
            .entry(endpoint.to_string())
            .or_insert_with(CoreServiceRecord::new);
    }

    /// Makes a core service answer, or fail with a retryable error.
    pub fn set_available(&self, endpoint: &str, available: bool) {
        self.update(endpoint, |record| record.available = available);
    }

    /// Registers an object store on a core service.
    pub fn add_object_store(&self, endpoint: &str, name: &str, storage_endpoint: &str) {
        let info = ObjectStoreInfo {
            name: name.to_string(),
            endpoint: storage_endpoint.to_string(),
        };
        self.update(endpoint, |record| record.object_stores.push(info));
    }

    /// Registers a namespace in one of the core service's object stores.
    pub fn add_namespace(&self, endpoint: &str, name: &str, object_store: &str, bucket: &str) {
        self.update(endpoint, |record| {
            let object_store = record
                .object_stores
                .iter()
                .find(|store| store.name == object_store)
                .cloned()
                .unwrap_or_else(|| ObjectStoreInfo {
                    name: object_store.to_string(),
                    endpoint: String::new(),
                });
            record.namespaces.insert(
                name.to_string(),
                NamespaceInfo {
                    name: name.to_string(),
                    object_store,
                    bucket_name: bucket.to_string(),
                },
            );
        });
    }

    /// Replaces the sync relationships and bumps the modification time.
    pub fn set_relationships(&self, endpoint: &str, relationships: Vec<SyncRelationship>) {
        self.update(endpoint, |record| {
            record.relationships = relationships;
            record.modified = Utc::now();
        });
    }

    /// Registers a notification queue.
    pub fn add_queue(&self, endpoint: &str, config: NotificationQueueConfig) {
        self.update(endpoint, |record| record.queues.push(config));
    }

    /// Returns every mutating call received so far.
    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().clone()
    }

    /// Returns the metadata index of a core service, keyed by document id.
    pub fn metadata_documents(&self, endpoint: &str) -> HashMap<String, MetadataDocument> {
        self.services
            .read()
            .get(endpoint)
            .map(|record| record.documents.clone())
            .unwrap_or_default()
    }

    fn update(&self, endpoint: &str, f: impl FnOnce(&mut CoreServiceRecord)) {
        let mut services = self.services.write();
        let record = services
            .entry(endpoint.to_string())
            .or_insert_with(CoreServiceRecord::new);
        f(record);
    }

    fn with_service<T>(
        &self,
        endpoint: &str,
        f: impl FnOnce(&mut CoreServiceRecord) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let mut services = self.services.write();
        let record = services
            .get_mut(endpoint)
            .ok_or_else(|| SyncError::UnknownCoreService(endpoint.to_string()))?;
        if !record.available {
            return Err(SyncError::transport_retryable(format!(
                "{endpoint} is not accepting connections"
            )));
        }
        f(record)
    }

    fn record(&self, endpoint: &str, call: ApiCall) -> SyncResult<()> {
        self.with_service(endpoint, |_| Ok(()))?;
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl CoreServiceApi for MemoryCoreServices {
    async fn ping(&self, endpoint: &str) -> SyncResult<()> {
        self.with_service(endpoint, |_| Ok(()))
    }

    async fn queue_configurations(
        &self,
        endpoint: &str,
    ) -> SyncResult<Vec<NotificationQueueConfig>> {
        self.with_service(endpoint, |record| Ok(record.queues.clone()))
    }

    async fn sync_relationships(
        &self,
        endpoint: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> SyncResult<Option<Vec<SyncRelationship>>> {
        self.with_service(endpoint, |record| match if_modified_since {
            Some(since) if record.modified <= since => Ok(None),
            _ => Ok(Some(record.relationships.clone())),
        })
    }

    async fn namespace(&self, endpoint: &str, name: &str) -> SyncResult<NamespaceInfo> {
        self.with_service(endpoint, |record| {
            record
                .namespaces
                .get(name)
                .cloned()
                .ok_or_else(|| SyncError::UnknownNamespace {
                    core_service: endpoint.to_string(),
                    namespace: name.to_string(),
                })
        })
    }

    async fn object_stores(&self, endpoint: &str) -> SyncResult<Vec<ObjectStoreInfo>> {
        self.with_service(endpoint, |record| Ok(record.object_stores.clone()))
    }

    async fn sts_credentials(
        &self,
        endpoint: &str,
        object_store: &str,
    ) -> SyncResult<StsCredentials> {
        self.with_service(endpoint, |record| {
            let store = record
                .object_stores
                .iter()
                .find(|store| store.name == object_store)
                .ok_or_else(|| SyncError::UnknownObjectStore {
                    core_service: endpoint.to_string(),
                    name: object_store.to_string(),
                })?;
            Ok(StsCredentials {
                access_key_id: format!("{}-key", store.name),
                secret_access_key: "secret".to_string(),
                session_token: "session".to_string(),
                expiration: String::new(),
                endpoint: store.endpoint.clone(),
                region: "us-east-1".to_string(),
            })
        })
    }

    async fn create_dataset(
        &self,
        endpoint: &str,
        namespace: &str,
        request: &CreateDatasetRequest,
    ) -> SyncResult<()> {
        self.record(
            endpoint,
            ApiCall::CreateDataset {
                endpoint: endpoint.to_string(),
                namespace: namespace.to_string(),
                request: request.clone(),
            },
        )
    }

    async fn put_dataset_permission(
        &self,
        endpoint: &str,
        namespace: &str,
        dataset: &str,
        group: &str,
        permission: &str,
    ) -> SyncResult<()> {
        self.record(
            endpoint,
            ApiCall::PutDatasetPermission {
                endpoint: endpoint.to_string(),
                namespace: namespace.to_string(),
                dataset: dataset.to_string(),
                group: group.to_string(),
                permission: permission.to_string(),
            },
        )
    }

    async fn delete_dataset_permission(
        &self,
        endpoint: &str,
        namespace: &str,
        dataset: &str,
        group: &str,
    ) -> SyncResult<()> {
        self.record(
            endpoint,
            ApiCall::DeleteDatasetPermission {
                endpoint: endpoint.to_string(),
                namespace: namespace.to_string(),
                dataset: dataset.to_string(),
                group: group.to_string(),
            },
        )
    }

    async fn put_dataset_sync(
        &self,
        endpoint: &str,
        namespace: &str,
        dataset: &str,
        request: &DatasetSyncRequest,
    ) -> SyncResult<()> {
        self.record(
            endpoint,
            ApiCall::PutDatasetSync {
                endpoint: endpoint.to_string(),
                namespace: namespace.to_string(),
                dataset: dataset.to_string(),
                request: request.clone(),
            },
        )
    }

    async fn put_namespace_sync(
        &self,
        endpoint: &str,
        namespace: &str,
        request: &NamespaceSyncRequest,
    ) -> SyncResult<()> {
        self.record(
            endpoint,
            ApiCall::PutNamespaceSync {
                endpoint: endpoint.to_string(),
                namespace: namespace.to_string(),
                request: request.clone(),
            },
        )
    }

    async fn put_metadata_document(
        &self,
        endpoint: &str,
        document: &MetadataDocument,
    ) -> SyncResult<()> {
        self.with_service(endpoint, |record| {
            record
                .documents
                .insert(document.document_id(), document.clone());
            Ok(())
        })?;
        self.calls.lock().push(ApiCall::PutMetadata {
            endpoint: endpoint.to_string(),
            document: document.clone(),
        });
        Ok(())
    }

    async fn delete_metadata_document(
        &self,
        endpoint: &str,
        document: &MetadataDocument,
    ) -> SyncResult<()> {
        self.with_service(endpoint, |record| {
            record.documents.remove(&document.document_id());
            Ok(())
        })?;
        self.calls.lock().push(ApiCall::DeleteMetadata {
            endpoint: endpoint.to_string(),
            document: document.clone(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    metadata: HashMap<String, String>,
}

/// Object storage held in memory.
#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), StoredObject>>,
    page_size: usize,
    chunk_size: usize,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: 1000,
            chunk_size: 64 * 1024,
        }
    }
}

impl MemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of objects per listing page.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sets the size of the chunks bodies are read in.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Stores an object directly.
    pub fn insert(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        metadata: HashMap<String, String>,
    ) {
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.into(),
                metadata,
            },
        );
    }

    /// Returns an object's body and metadata.
    pub fn object(&self, bucket: &str, key: &str) -> Option<(Bytes, HashMap<String, String>)> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|object| (object.body.clone(), object.metadata.clone()))
    }

    /// Returns true if the object exists.
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .read()
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Returns the keys stored in a bucket, in order.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, key)| key.clone())
            .collect()
    }

    fn missing(bucket: &str, key: &str) -> SyncError {
        SyncError::ObjectStore(format!("no such key {bucket}/{key}"))
    }
}

#[async_trait]
impl ObjectStoreClient for MemoryObjectStore {
    async fn head_object(&self, bucket: &str, key: &str) -> SyncResult<HashMap<String, String>> {
        self.object(bucket, key)
            .map(|(_, metadata)| metadata)
            .ok_or_else(|| Self::missing(bucket, key))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> SyncResult<ObjectBody> {
        let (body, _) = self
            .object(bucket, key)
            .ok_or_else(|| Self::missing(bucket, key))?;
        let chunks: Vec<SyncResult<Bytes>> = (0..body.len())
            .step_by(self.chunk_size)
            .map(|start| Ok(body.slice(start..body.len().min(start + self.chunk_size))))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: ObjectBody,
        metadata: &HashMap<String, String>,
    ) -> SyncResult<()> {
        // nothing is stored unless the whole body arrives
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.try_next().await? {
            buffer.extend_from_slice(&chunk);
        }
        self.insert(bucket, key, buffer.freeze(), metadata.clone());
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> SyncResult<()> {
        self.objects
            .write()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> SyncResult<ObjectListing> {
        let objects = self.objects.read();
        let start = match continuation_token {
            Some(after) => Bound::Excluded((bucket.to_string(), after)),
            None => Bound::Included((bucket.to_string(), prefix.to_string())),
        };

        let mut matching = objects
            .range((start, Bound::Unbounded))
            .take_while(|((b, _), _)| b == bucket)
            .filter(|((_, key), _)| key.starts_with(prefix));

        let page: Vec<ObjectSummary> = matching
            .by_ref()
            .take(self.page_size)
            .map(|((_, key), object)| ObjectSummary {
                key: key.clone(),
                size: object.body.len() as u64,
            })
            .collect();

        let next_continuation_token = match (matching.next(), page.last()) {
            (Some(_), Some(last)) => Some(last.key.clone()),
            _ => None,
        };

        Ok(ObjectListing {
            objects: page,
            next_continuation_token,
        })
    }
}

/// A [`RenewingClient`] around a fixed client. Counts forced refreshes.
pub struct StaticClient {
    client: Arc<dyn ObjectStoreClient>,
    refreshes: AtomicUsize,
}

impl StaticClient {
    /// Wraps a client.
    #[must_use]
    pub fn new(client: Arc<dyn ObjectStoreClient>) -> Self {
        Self {
            client,
            refreshes: AtomicUsize::new(0),
        }
    }

    /// Number of forced refreshes so far.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenewingClient for StaticClient {
    fn client(&self) -> SyncResult<Arc<dyn ObjectStoreClient>> {
        Ok(self.client.clone())
    }

    async fn force_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A [`ClientFactory`] handing out pre-registered clients by object store name.
#[derive(Default)]
pub struct StaticClientFactory {
    clients: RwLock<HashMap<String, Arc<dyn ObjectStoreClient>>>,
}

impl StaticClientFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the client returned for an object store.
    pub fn insert(&self, object_store: &str, client: Arc<dyn ObjectStoreClient>) {
        self.clients.write().insert(object_store.to_string(), client);
    }
}

impl ClientFactory for StaticClientFactory {
    fn build(
        &self,
        object_store: &ObjectStoreInfo,
        _credentials: &StsCredentials,
    ) -> SyncResult<Arc<dyn ObjectStoreClient>> {
        self.clients
            .read()
            .get(&object_store.name)
            .cloned()
            .ok_or_else(|| {
                SyncError::ObjectStore(format!("no client for object store {}", object_store.name))
            })
    }
}

/// A [`Queue`] fed with raw bodies through a channel.
pub struct ChannelQueue {
    format: MessageFormat,
    source_endpoint: String,
    bodies: mpsc::Receiver<Bytes>,
    pending: VecDeque<Message>,
}

impl ChannelQueue {
    /// Creates a queue and the sender feeding it.
    pub fn new(
        format: MessageFormat,
        source_endpoint: impl Into<String>,
        capacity: usize,
    ) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, bodies) = mpsc::channel(capacity.max(1));
        let queue = Self {
            format,
            source_endpoint: source_endpoint.into(),
            bodies,
            pending: VecDeque::new(),
        };
        (tx, queue)
    }
}

#[async_trait]
impl Queue for ChannelQueue {
    async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }

            let body = self.bodies.recv().await?;
            match queue::decode(self.format, &body, &self.source_endpoint) {
                Ok(messages) => self.pending.extend(messages),
                Err(e) => error!(format = %self.format, error = %e, "problem decoding message"),
            }
        }
    }
}

/// A [`QueueFactory`] of [`ChannelQueue`]s, keyed by the `queue_name` setting.
#[derive(Default)]
pub struct MemoryQueueFactory {
    senders: Mutex<HashMap<String, mpsc::Sender<Bytes>>>,
    receivers: Mutex<HashMap<String, mpsc::Receiver<Bytes>>>,
}

impl MemoryQueueFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the sender feeding the named queue, creating it if needed.
    pub fn sender(&self, queue_name: &str) -> mpsc::Sender<Bytes> {
        let mut senders = self.senders.lock();
        if let Some(tx) = senders.get(queue_name) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(64);
        senders.insert(queue_name.to_string(), tx.clone());
        self.receivers.lock().insert(queue_name.to_string(), rx);
        tx
    }
}

#[async_trait]
impl QueueFactory for MemoryQueueFactory {
    async fn open(
        &self,
        core_service: &str,
        config: &NotificationQueueConfig,
    ) -> SyncResult<Box<dyn Queue>> {
        let format = MessageFormat::from_config(config)?;
        let name = config
            .settings
            .get("queue_name")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                SyncError::Config(format!("queue of {core_service} has no queue_name"))
            })?;

        self.sender(name);
        let bodies = self.receivers.lock().remove(name).ok_or_else(|| {
            SyncError::Config(format!("queue {name} is already open"))
        })?;

        Ok(Box::new(ChannelQueue {
            format,
            source_endpoint: config.source_endpoint().unwrap_or_default().to_string(),
            bodies,
            pending: VecDeque::new(),
        }))
    }
}
