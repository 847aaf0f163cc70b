//! The demuxer: routes every inbound message to the node responsible for it.
//!
//! Notification queues and the per-node replay queues are merged into one
//! stream by forwarder tasks. The demuxer matches each message against the
//! nodes in configuration order and hands it to the first match's work
//! queue. That send waits while the queue is full, which is the only
//! backpressure in the engine.

use crate::graph::{ConfigGraph, CoreServiceConfig};
use crate::message::Message;
use crate::queue::Queue;
use crate::reconciler::ReloadHandle;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to a dispatched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed to the work queue of the node with this endpoint.
    Queued(String),
    /// Matched, but needs no work.
    Ignored,
    /// No node is responsible. The message is dropped.
    Unroutable,
    /// The matching node's work queue is closed.
    Dropped,
}

/// Single dispatch loop over the merged inbound stream.
pub struct Demuxer {
    graph: Arc<ConfigGraph>,
    reload: ReloadHandle,
}

impl Demuxer {
    /// Creates a demuxer over the graph.
    pub fn new(graph: Arc<ConfigGraph>, reload: ReloadHandle) -> Self {
        Self { graph, reload }
    }

    /// Routes one message.
    pub async fn dispatch(&self, mut message: Message) -> DispatchOutcome {
        if message.require_reload() {
            debug!(message = %message, "forcing reload before routing");
            self.reload.force_reload().await;
        }

        for node in self.graph.nodes() {
            let outcome = message.matches(node);
            if !outcome.matched {
                continue;
            }
            if outcome.ignore {
                return DispatchOutcome::Ignored;
            }

            return match node.work_sender().send(message).await {
                Ok(()) => DispatchOutcome::Queued(node.endpoint().to_string()),
                Err(_) => {
                    warn!(endpoint = %node.endpoint(), "work queue closed, dropping message");
                    DispatchOutcome::Dropped
                }
            };
        }

        error!(message = %message, "no core service matches message, dropping it");
        DispatchOutcome::Unroutable
    }

    /// Dispatches until the inbound stream ends or the engine shuts down.
    pub async fn run(self, mut inbound: mpsc::Receiver<Message>, cancel: CancellationToken) {
        info!("starting demuxer");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.dispatch(message) => {}
            }
        }

        info!("stopping demuxer");
    }
}

/// Forwards a notification queue into the merged stream.
pub async fn forward_queue(
    mut queue: Box<dyn Queue>,
    name: String,
    merged: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = queue.recv() => message,
        };

        let Some(message) = message else {
            error!(queue = %name, "notification queue closed");
            break;
        };
        if merged.send(message).await.is_err() {
            break;
        }
    }
}

/// Forwards a node's replay queue into the merged stream.
pub async fn forward_replay(
    node: Arc<CoreServiceConfig>,
    merged: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let replay = node.replay_receiver().clone();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = replay.recv() => message,
        };

        let Ok(message) = message else {
            break;
        };
        if merged.send(message).await.is_err() {
            break;
        }
    }
}
