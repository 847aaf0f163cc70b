//! Service bootstrap: wires every component together and owns their tasks.

use crate::config::{EngineConfig, RetryConfig};
use crate::core_api::CoreServiceApi;
use crate::demuxer::{forward_queue, forward_replay, Demuxer};
use crate::error::{SyncError, SyncResult};
use crate::graph::{ConfigGraph, CoreServiceConfig, ObjectStoreConfig};
use crate::message::ExecuteContext;
use crate::monitor::DesiredStateMonitor;
use crate::object_store::{ClientFactory, RenewingClient, StsRenewingClient};
use crate::queue::{Queue, QueueFactory};
use crate::reconciler::{ReloadHandle, Reconciler};
use crate::token::TokenSource;
use crate::worker::spawn_workers;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// External collaborators of the engine.
#[derive(Clone)]
pub struct ServiceDeps {
    /// Core service REST client.
    pub api: Arc<dyn CoreServiceApi>,
    /// Service identity tokens, renewed in the background.
    pub tokens: Arc<dyn TokenSource>,
    /// Vendor storage client factory.
    pub clients: Arc<dyn ClientFactory>,
    /// Notification queue transports.
    pub queues: Arc<dyn QueueFactory>,
}

/// A running sync engine.
pub struct SyncService {
    graph: Arc<ConfigGraph>,
    monitors: Vec<Arc<DesiredStateMonitor>>,
    reload: ReloadHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncService {
    /// Starts the engine.
    ///
    /// Fails when the configuration is invalid, a core service never becomes
    /// ready, or a queue cannot be opened. Nothing keeps running after a
    /// failed start.
    pub async fn start(config: EngineConfig, deps: ServiceDeps) -> SyncResult<Self> {
        config.validate()?;

        for endpoint in &config.core_services {
            wait_for_core_service(deps.api.as_ref(), endpoint, &config.startup_retry).await?;
        }
        deps.tokens.refresh().await?;

        let mut renewing: Vec<Arc<dyn RenewingClient>> = Vec::new();
        let mut nodes = Vec::with_capacity(config.core_services.len());
        for endpoint in &config.core_services {
            let mut stores = Vec::new();
            for info in deps.api.object_stores(endpoint).await? {
                let client: Arc<dyn RenewingClient> = Arc::new(
                    StsRenewingClient::new(
                        deps.api.clone(),
                        deps.clients.clone(),
                        endpoint.clone(),
                        info.clone(),
                        config.refresh_intervals.sts_creds,
                    )
                    .await,
                );
                renewing.push(client.clone());
                stores.push(ObjectStoreConfig {
                    name: info.name,
                    endpoint: info.endpoint,
                    client,
                });
            }

            nodes.push(CoreServiceConfig::new(
                endpoint.clone(),
                deps.api.clone(),
                stores,
                config.worker_buffer_size,
                config.replay_buffer_size,
            ));
        }
        let graph = Arc::new(ConfigGraph::new(nodes));

        let mut queues: Vec<(String, Box<dyn Queue>)> = Vec::new();
        for endpoint in &config.core_services {
            for queue_config in deps.api.queue_configurations(endpoint).await? {
                let queue = deps.queues.open(endpoint, &queue_config).await.map_err(|e| {
                    SyncError::Config(format!(
                        "could not load {} notification queue of {endpoint}: {e}",
                        queue_config.kind
                    ))
                })?;
                queues.push((format!("{endpoint} {}", queue_config.kind), queue));
            }
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let tokens = deps.tokens.clone();
        let token_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            tokens.refresh_routine(token_cancel).await;
        }));
        for client in renewing {
            let client_cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                client.refresh_routine(client_cancel).await;
            }));
        }

        let changed = Arc::new(Notify::new());
        let monitors: Vec<_> = config
            .core_services
            .iter()
            .map(|endpoint| {
                Arc::new(DesiredStateMonitor::new(
                    endpoint.clone(),
                    deps.api.clone(),
                    config.refresh_intervals.core_service,
                ))
            })
            .collect();
        for monitor in &monitors {
            tasks.push(tokio::spawn(
                monitor.clone().run(changed.clone(), cancel.clone()),
            ));
        }

        let (reconciler, reload) =
            Reconciler::new(graph.clone(), monitors.clone(), config.force_reload_timeout);
        tasks.push(tokio::spawn(reconciler.run(changed, cancel.clone())));

        let ctx = ExecuteContext::new(config.backfill_delay, cancel.clone());
        for node in graph.nodes() {
            tasks.extend(spawn_workers(node, config.worker_instance_count, &ctx));
        }

        let (merged_tx, merged_rx) = mpsc::channel(config.worker_buffer_size);
        for (name, queue) in queues {
            tasks.push(tokio::spawn(forward_queue(
                queue,
                name,
                merged_tx.clone(),
                cancel.clone(),
            )));
        }
        for node in graph.nodes() {
            tasks.push(tokio::spawn(forward_replay(
                node.clone(),
                merged_tx.clone(),
                cancel.clone(),
            )));
        }
        drop(merged_tx);

        let demuxer = Demuxer::new(graph.clone(), reload.clone());
        tasks.push(tokio::spawn(demuxer.run(merged_rx, cancel.clone())));

        info!(core_services = config.core_services.len(), "sync service started");
        Ok(Self {
            graph,
            monitors,
            reload,
            cancel,
            tasks,
        })
    }

    /// The live routing graph.
    pub fn graph(&self) -> &Arc<ConfigGraph> {
        &self.graph
    }

    /// The desired-state monitors, one per core service.
    pub fn monitors(&self) -> &[Arc<DesiredStateMonitor>] {
        &self.monitors
    }

    /// Handle for forcing a reconciliation.
    pub fn reload_handle(&self) -> &ReloadHandle {
        &self.reload
    }

    /// Stops every loop and waits for them. Messages in flight may be abandoned.
    pub async fn shutdown(self) {
        info!("sync service is stopping");
        self.cancel.cancel();
        for node in self.graph.nodes() {
            node.close();
        }

        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(error = %e, "sync service task failed");
            }
        }
        info!("sync service stopped");
    }
}

/// Pings a core service until it answers, retrying transient failures.
async fn wait_for_core_service(
    api: &dyn CoreServiceApi,
    endpoint: &str,
    retry: &RetryConfig,
) -> SyncResult<()> {
    let mut attempt = 0;
    loop {
        match api.ping(endpoint).await {
            Ok(()) => {
                info!(endpoint, "core service is ready");
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                attempt += 1;
                let delay = retry.delay_for_attempt(attempt);
                warn!(endpoint, error = %e, ?delay, "core service is not ready, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
