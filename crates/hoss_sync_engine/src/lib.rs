//! # Hoss Sync Engine
//!
//! Keeps namespaces of independently operated Hoss core services in sync.
//!
//! The engine learns the desired sync relationships by polling every
//! configured core service, turns them into a routing graph, and replicates
//! object writes, deletes and lifecycle changes along that graph.
//!
//! ## Components
//!
//! - [`DesiredStateMonitor`]: one poller per core service
//! - [`Reconciler`]: sole writer of the [`ConfigGraph`], diffing desired against live state
//! - [`Demuxer`]: routes each inbound [`Message`] to the responsible core service node
//! - worker pools: execute messages from each node's bounded work queue
//! - [`SyncService`]: starts everything and shuts it down
//!
//! External systems are reached through capability traits: [`CoreServiceApi`],
//! [`TokenSource`], [`ObjectStoreClient`], [`RenewingClient`] and [`Queue`].
//! [`HttpCoreApi`] implements the core service API over HTTP, and the
//! [`memory`] module provides in-memory implementations of all of them.
//!
//! ## Example
//!
//! ```rust,no_run
//! use hoss_sync_engine::memory::{MemoryCoreServices, MemoryQueueFactory, StaticClientFactory};
//! use hoss_sync_engine::{EngineConfig, ServiceDeps, StaticToken, SyncService};
//! use std::sync::Arc;
//!
//! # async fn run() -> hoss_sync_engine::SyncResult<()> {
//! let api = Arc::new(MemoryCoreServices::new());
//! api.add_core_service("http://core/v1");
//!
//! let deps = ServiceDeps {
//!     api,
//!     tokens: Arc::new(StaticToken::new("token")),
//!     clients: Arc::new(StaticClientFactory::new()),
//!     queues: Arc::new(MemoryQueueFactory::new()),
//! };
//! let service = SyncService::start(EngineConfig::new(["http://core/v1"]), deps).await?;
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod core_api;
mod demuxer;
mod desired;
mod error;
mod graph;
mod http;
pub mod memory;
mod message;
mod monitor;
mod object_store;
mod queue;
mod reconciler;
mod service;
mod token;
mod worker;

pub use config::{EngineConfig, RefreshIntervals, RetryConfig};
pub use core_api::{
    CoreServiceApi, CreateDatasetRequest, DatasetSyncRequest, MetadataDocument, NamespaceInfo,
    NamespaceSyncRequest, NotificationQueueConfig, ObjectStoreInfo, StsCredentials,
    SYNC_USER_AGENT,
};
pub use demuxer::{forward_queue, forward_replay, Demuxer, DispatchOutcome};
pub use desired::{
    index as index_relationships, RelationshipId, RelationshipSet, SyncKind, SyncRelationship,
};
pub use error::{SyncError, SyncResult};
pub use graph::{
    ConfigGraph, CoreServiceConfig, CoreServiceState, NamespaceConfig, NamespaceLocation,
    ObjectStoreConfig, SyncKey, SyncTarget,
};
pub use http::HttpCoreApi;
pub use message::{
    ApiEvent, ApiEventType, BucketEntity, BucketEvent, BucketNotification, EventSource,
    ExecuteContext, MatchOutcome, Message, ObjectEntity, S3Entity, BACKFILL_USER_AGENT,
};
pub use monitor::DesiredStateMonitor;
pub use object_store::{
    ClientFactory, ObjectBody, ObjectListing, ObjectStoreClient, ObjectSummary, RenewingClient,
    StsRenewingClient,
};
pub use queue::{decode, MessageFormat, Queue, QueueFactory};
pub use reconciler::{ReconcilePlan, Reconciler, ReloadHandle};
pub use service::{ServiceDeps, SyncService};
pub use token::{RenewingServiceTokens, ServiceTokens, StaticToken, TokenSource};
pub use worker::spawn_workers;
