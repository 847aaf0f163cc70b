//! Object storage capabilities.
//!
//! Vendor adapters implement [`ObjectStoreClient`] and a [`ClientFactory`]
//! that builds clients from temporary credentials. The engine only ever holds
//! clients through a [`RenewingClient`], which swaps them as credentials expire.

use crate::core_api::{CoreServiceApi, ObjectStoreInfo, StsCredentials};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectListing {
    /// Objects in this page.
    pub objects: Vec<ObjectSummary>,
    /// Token for the next page; `None` on the last page.
    pub next_continuation_token: Option<String>,
}

/// An object's content, delivered chunk by chunk.
///
/// Copies pass the source's stream straight to the target, so at most the
/// chunks in flight are held in memory regardless of object size.
pub type ObjectBody = BoxStream<'static, SyncResult<Bytes>>;

/// Operations on objects in a bucket.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Returns the user metadata of an object.
    async fn head_object(&self, bucket: &str, key: &str) -> SyncResult<HashMap<String, String>>;

    /// Opens an object for reading.
    async fn get_object(&self, bucket: &str, key: &str) -> SyncResult<ObjectBody>;

    /// Writes an object with user metadata, consuming the body as it arrives.
    ///
    /// An error yielded by the body aborts the write.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: ObjectBody,
        metadata: &HashMap<String, String>,
    ) -> SyncResult<()>;

    /// Removes an object.
    async fn delete_object(&self, bucket: &str, key: &str) -> SyncResult<()>;

    /// Lists objects under a prefix, one page at a time.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> SyncResult<ObjectListing>;
}

/// A storage client whose credentials renew in the background.
#[async_trait]
pub trait RenewingClient: Send + Sync {
    /// Returns the current client, or the error from the last renewal.
    fn client(&self) -> SyncResult<Arc<dyn ObjectStoreClient>>;

    /// Renews credentials and the client now.
    async fn force_refresh(&self);

    /// Renews on an interval until cancelled.
    async fn refresh_routine(&self, cancel: CancellationToken) {
        cancel.cancelled().await;
    }
}

/// Builds vendor clients from temporary credentials.
pub trait ClientFactory: Send + Sync {
    /// Creates a client for the object store.
    fn build(
        &self,
        object_store: &ObjectStoreInfo,
        credentials: &StsCredentials,
    ) -> SyncResult<Arc<dyn ObjectStoreClient>>;
}

#[derive(Default)]
struct ClientState {
    client: Option<Arc<dyn ObjectStoreClient>>,
    last_error: Option<String>,
}

/// [`RenewingClient`] backed by core service issued STS credentials.
pub struct StsRenewingClient {
    api: Arc<dyn CoreServiceApi>,
    factory: Arc<dyn ClientFactory>,
    core_service: String,
    object_store: ObjectStoreInfo,
    interval: Duration,
    state: RwLock<ClientState>,
}

impl StsRenewingClient {
    /// Creates the client and performs the first credential fetch.
    ///
    /// A failed first fetch is kept as the last error, not returned.
    pub async fn new(
        api: Arc<dyn CoreServiceApi>,
        factory: Arc<dyn ClientFactory>,
        core_service: impl Into<String>,
        object_store: ObjectStoreInfo,
        interval: Duration,
    ) -> Self {
        let client = Self {
            api,
            factory,
            core_service: core_service.into(),
            object_store,
            interval,
            state: RwLock::new(ClientState::default()),
        };
        client.update().await;
        client
    }

    async fn renew(&self) -> SyncResult<Arc<dyn ObjectStoreClient>> {
        let credentials = self
            .api
            .sts_credentials(&self.core_service, &self.object_store.name)
            .await
            .map_err(|e| SyncError::ObjectStore(format!("could not renew STS credentials: {e}")))?;
        self.factory.build(&self.object_store, &credentials)
    }

    async fn update(&self) {
        let result = self.renew().await;
        let mut state = self.state.write();
        match result {
            Ok(client) => {
                info!(object_store = %self.object_store.name, "refreshed object store client");
                state.client = Some(client);
                state.last_error = None;
            }
            Err(e) => {
                warn!(object_store = %self.object_store.name, error = %e, "failed to refresh object store client");
                state.client = None;
                state.last_error = Some(e.to_string());
            }
        }
    }
}

#[async_trait]
impl RenewingClient for StsRenewingClient {
    fn client(&self) -> SyncResult<Arc<dyn ObjectStoreClient>> {
        let state = self.state.read();
        if let Some(e) = &state.last_error {
            return Err(SyncError::ObjectStore(e.clone()));
        }
        state
            .client
            .clone()
            .ok_or_else(|| SyncError::ObjectStore("no object store client is available".into()))
    }

    async fn force_refresh(&self) {
        self.update().await;
    }

    async fn refresh_routine(&self, cancel: CancellationToken) {
        info!(object_store = %self.object_store.name, interval = ?self.interval, "starting object store client refresh routine");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.update().await,
            }
        }

        info!(object_store = %self.object_store.name, "stopping object store client refresh routine");
    }
}
