//! Per-node worker pools.

use crate::graph::CoreServiceConfig;
use crate::message::ExecuteContext;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Spawns `count` workers draining the node's work queue.
///
/// A worker runs one message at a time to completion, so a slow message
/// only holds back its own node's queue.
pub fn spawn_workers(
    node: &Arc<CoreServiceConfig>,
    count: usize,
    ctx: &ExecuteContext,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| tokio::spawn(run_worker(id, node.clone(), ctx.clone())))
        .collect()
}

async fn run_worker(id: usize, node: Arc<CoreServiceConfig>, ctx: ExecuteContext) {
    debug!(endpoint = %node.endpoint(), worker = id, "starting worker");
    let work = node.work_receiver().clone();

    loop {
        let message = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            message = work.recv() => match message {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        let description = message.to_string();
        if let Err(e) = message.execute(&node, &ctx).await {
            error!(
                endpoint = %node.endpoint(),
                worker = id,
                message = %description,
                error = %e,
                "failed to execute message"
            );
        }
    }

    info!(endpoint = %node.endpoint(), worker = id, "worker stopped");
}
