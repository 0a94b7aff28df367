//! Background loops of the ingestion server.

use std::time::Duration;

use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::runtime::SharedRuntime;

/// Runs the at-risk sweep every `interval` until `shutdown` flips to `true`.
pub fn spawn_at_risk_sweep(
    runtime: SharedRuntime,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("at-risk sweep", interval, shutdown, move || {
        let report = runtime.run_sweep();
        info!(
            subjects = report.subjects_evaluated,
            flagged = report.flagged.len(),
            "at-risk sweep finished"
        );
    })
}

/// Syncs batched event-log writes whose interval has elapsed.
pub fn spawn_wal_flush(
    runtime: SharedRuntime,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn_periodic("event log flush", interval, shutdown, move || {
        runtime.flush_wal_if_due();
    })
}

fn spawn_periodic(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so work starts one interval in.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(task = name, "background loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::runtime::{IngestionRuntime, RuntimeOptions};
    use schema::{HOUR_MS, ManualClock, ScanSubmission, scan_event_builder};
    use store::InMemoryStore;
    use uuid::Uuid;

    const T0: i64 = 1_767_240_000_000;

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_caches_reports_and_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(T0));
        let runtime = Arc::new(IngestionRuntime::with_options(
            InMemoryStore::new(),
            RuntimeOptions {
                clock: clock.clone(),
                ..RuntimeOptions::default()
            },
        ));
        let event = scan_event_builder(Uuid::new_v4(), 1, "device-a", T0);
        runtime.submit_scan(&ScanSubmission::from(&event)).unwrap();
        clock.set(T0 + 6 * HOUR_MS);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_at_risk_sweep(runtime.clone(), Duration::from_secs(120), stop_rx);

        tokio::time::sleep(Duration::from_secs(121)).await;
        let report = runtime.last_sweep().expect("sweep should have run");
        assert_eq!(report.flagged.len(), 1);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_stops_loop() {
        let runtime = Arc::new(IngestionRuntime::in_memory(InMemoryStore::new()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_wal_flush(runtime, Duration::from_millis(5), stop_rx);
        drop(stop_tx);
        handle.await.unwrap();
    }
}
