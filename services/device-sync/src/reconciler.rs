//! Push and pull loops between a device and the ingestion gate.

use std::{sync::Arc, time::Duration};

use ingestion::api::BatchSubmitRequest;
use schema::ScanSubmission;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    client::{GateClient, TransportError},
    local_view::MergeStats,
    node::{DeviceNode, PushReport},
};

pub const DEFAULT_PUSH_BATCH_SIZE: usize = 50;
pub const DEFAULT_PULL_PAGE_LIMIT: usize = 200;
/// Pages pulled per tick before yielding back to the interval.
pub const MAX_PULL_PAGES_PER_TICK: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub push_interval: Duration,
    pub pull_interval_online: Duration,
    pub pull_interval_offline: Duration,
    pub pull_page_limit: usize,
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_PUSH_BATCH_SIZE,
            push_interval: Duration::from_secs(2),
            pull_interval_online: Duration::from_secs(5),
            pull_interval_offline: Duration::from_secs(60),
            pull_page_limit: DEFAULT_PULL_PAGE_LIMIT,
            request_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Reconciler {
    node: Arc<DeviceNode>,
    client: Arc<dyn GateClient>,
    config: SyncConfig,
}

pub struct ReconcilerHandles {
    push: JoinHandle<()>,
    pull: JoinHandle<()>,
}

impl ReconcilerHandles {
    pub async fn join(self) {
        for (name, handle) in [("push", self.push), ("pull", self.pull)] {
            if let Err(err) = handle.await {
                warn!(task = name, error = %err, "sync loop ended abnormally");
            }
        }
    }
}

impl Reconciler {
    pub fn new(node: Arc<DeviceNode>, client: Arc<dyn GateClient>, config: SyncConfig) -> Self {
        Self {
            node,
            client,
            config,
        }
    }

    pub fn node(&self) -> &Arc<DeviceNode> {
        &self.node
    }

    /// Sends one batch of due outbox entries. An empty outbox is a no-op.
    pub async fn push_once(&self) -> Result<PushReport, TransportError> {
        let batch = self.node.due_batch(self.config.batch_size.max(1));
        if batch.is_empty() {
            return Ok(PushReport::default());
        }
        let request = BatchSubmitRequest {
            events: batch
                .iter()
                .map(|pending| ScanSubmission::from(&pending.event))
                .collect(),
        };

        let sent = tokio::time::timeout(
            self.config.request_timeout,
            self.client.submit_batch(&request),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout));

        match sent {
            Ok(response) => {
                self.node.set_online(true);
                let report = self
                    .node
                    .apply_push_results(&batch, &response)
                    .map_err(|err| outbox_failure(&err))?;
                info!(
                    sent = report.sent,
                    accepted = report.accepted,
                    duplicates = report.duplicates,
                    rejected = report.rejected,
                    retried = report.retried,
                    "pushed outbox batch"
                );
                Ok(report)
            }
            Err(err) => {
                if err.is_connectivity() {
                    self.node.set_online(false);
                }
                if let Err(journal) = self.node.record_batch_failure(&batch, &err.to_string()) {
                    warn!(error = %journal, "could not record push failure");
                }
                debug!(error = %err, entries = batch.len(), "push deferred");
                Err(err)
            }
        }
    }

    /// Pulls ledger pages after the local watermark until the gate has no more.
    pub async fn pull_once(&self) -> Result<MergeStats, TransportError> {
        let mut total = MergeStats::default();
        for _ in 0..MAX_PULL_PAGES_PER_TICK {
            let after = self.node.watermark();
            let page = tokio::time::timeout(
                self.config.request_timeout,
                self.client.events_after(after, self.config.pull_page_limit),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout));

            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    if err.is_connectivity() {
                        self.node.set_online(false);
                    }
                    return Err(err);
                }
            };
            self.node.set_online(true);
            let merged = self
                .node
                .merge_remote(&page)
                .map_err(|err| TransportError::Decode(err.to_string()))?;
            total.received += merged.received;
            total.inserted += merged.inserted;
            total.confirmed_own += merged.confirmed_own;
            total.purged += merged.purged;
            if !page.has_more || page.next_seq <= after {
                break;
            }
        }
        if total.received > 0 || total.purged > 0 {
            debug!(
                received = total.received,
                inserted = total.inserted,
                purged = total.purged,
                watermark = self.node.watermark(),
                "pulled ledger events"
            );
        }
        Ok(total)
    }

    /// Starts both loops; they stop once `shutdown` flips to `true`.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> ReconcilerHandles {
        let push = {
            let reconciler = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(
                    reconciler.config.push_interval.max(Duration::from_millis(1)),
                );
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => match reconciler.push_once().await {
                            Ok(_) => {}
                            Err(err) if err.is_connectivity() => {
                                debug!(error = %err, pending = reconciler.node.outbox_len(), "push tick deferred");
                            }
                            Err(err) => {
                                warn!(error = %err, pending = reconciler.node.outbox_len(), "push tick failed");
                            }
                        },
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("push loop stopped");
            })
        };

        let pull = {
            let reconciler = self;
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                loop {
                    if let Err(err) = reconciler.pull_once().await {
                        debug!(error = %err, "pull deferred");
                    }
                    let wait = reconciler.pull_interval();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("pull loop stopped");
            })
        };

        ReconcilerHandles { push, pull }
    }

    fn pull_interval(&self) -> Duration {
        if self.node.is_online() {
            self.config.pull_interval_online
        } else {
            self.config.pull_interval_offline
        }
    }
}

fn outbox_failure(err: &crate::outbox::OutboxError) -> TransportError {
    warn!(error = %err, "outbox journal write failed after push");
    TransportError::Decode(format!("outbox: {err}"))
}
