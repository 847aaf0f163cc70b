//! Desired-state monitors: one poller per core service.

use crate::core_api::CoreServiceApi;
use crate::desired::SyncRelationship;
use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polls one core service for its sync relationships.
///
/// Each poll is conditional on the time of the last successful poll, so an
/// unchanged relationship list costs a `304` and leaves the held set alone.
pub struct DesiredStateMonitor {
    endpoint: String,
    api: Arc<dyn CoreServiceApi>,
    interval: Duration,
    relationships: RwLock<Vec<SyncRelationship>>,
    last_checked: Mutex<Option<DateTime<Utc>>>,
    reload: Notify,
}

impl DesiredStateMonitor {
    /// Creates a monitor. Nothing is polled until [`run`](Self::run) or
    /// [`poll_once`](Self::poll_once) is called.
    pub fn new(endpoint: impl Into<String>, api: Arc<dyn CoreServiceApi>, interval: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api,
            interval,
            relationships: RwLock::new(Vec::new()),
            last_checked: Mutex::new(None),
            reload: Notify::new(),
        }
    }

    /// Core service endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the relationships from the last successful poll that returned data.
    pub fn snapshot(&self) -> Vec<SyncRelationship> {
        self.relationships.read().clone()
    }

    /// Wakes the poll loop without waiting for the next tick.
    pub fn force_reload(&self) {
        self.reload.notify_one();
    }

    /// Polls once. Returns true when the held relationship set was replaced.
    pub async fn poll_once(&self) -> SyncResult<bool> {
        let now = Utc::now();
        let since = *self.last_checked.lock();

        let relationships = self.api.sync_relationships(&self.endpoint, since).await?;
        *self.last_checked.lock() = Some(now);

        match relationships {
            Some(relationships) => {
                debug!(endpoint = %self.endpoint, count = relationships.len(), "new sync relationships");
                *self.relationships.write() = relationships;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Polls and logs failures. Returns true when the held set was replaced.
    pub(crate) async fn refresh(&self) -> bool {
        match self.poll_once().await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "could not query sync configuration");
                false
            }
        }
    }

    /// Polls on every tick or forced reload until cancelled, signalling
    /// `changed` whenever the held set is replaced.
    pub async fn run(self: Arc<Self>, changed: Arc<Notify>, cancel: CancellationToken) {
        info!(endpoint = %self.endpoint, interval = ?self.interval, "starting to monitor core service for sync config changes");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.reload.notified() => {}
            }

            if self.refresh().await {
                changed.notify_one();
            }
        }

        info!(endpoint = %self.endpoint, "stopping sync config monitor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::SyncKind;
    use crate::memory::MemoryCoreServices;

    const CORE: &str = "http://core-a/v1";

    fn relationship(target: &str) -> SyncRelationship {
        SyncRelationship::new(SyncKind::Simplex, (CORE, "ns"), ("http://core-b/v1", target))
    }

    #[tokio::test]
    async fn unchanged_poll_keeps_snapshot() {
        let api = Arc::new(MemoryCoreServices::new());
        api.add_core_service(CORE);
        api.set_relationships(CORE, vec![relationship("a")]);
        let monitor = DesiredStateMonitor::new(CORE, api.clone(), Duration::from_secs(60));

        assert!(monitor.poll_once().await.unwrap());
        assert_eq!(monitor.snapshot().len(), 1);
        assert!(!monitor.poll_once().await.unwrap());
        assert_eq!(monitor.snapshot().len(), 1);

        api.set_relationships(CORE, vec![relationship("a"), relationship("b")]);
        assert!(monitor.poll_once().await.unwrap());
        assert_eq!(monitor.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn failed_poll_is_not_fatal() {
        let api = Arc::new(MemoryCoreServices::new());
        let monitor = DesiredStateMonitor::new("http://unknown/v1", api, Duration::from_secs(60));

        assert!(monitor.poll_once().await.is_err());
        assert!(!monitor.refresh().await);
        assert!(monitor.snapshot().is_empty());
    }

    #[tokio::test]
    async fn forced_reload_bypasses_interval() {
        let api = Arc::new(MemoryCoreServices::new());
        api.add_core_service(CORE);
        let monitor = Arc::new(DesiredStateMonitor::new(CORE, api.clone(), Duration::from_secs(3600)));
        let changed = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.clone().run(changed.clone(), cancel.clone()));

        // the first tick polls immediately
        changed.notified().await;

        api.set_relationships(CORE, vec![relationship("a")]);
        monitor.force_reload();
        tokio::time::timeout(Duration::from_secs(5), changed.notified())
            .await
            .unwrap();
        assert_eq!(monitor.snapshot().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
