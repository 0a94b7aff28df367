use std::sync::Arc;

use anyhow::Context;
use ingestion::{
    IngestionRuntime, RuntimeOptions, SharedRuntime, config::IngestConfig, sweep, transport_axum,
};
use registry::{InMemoryRegistry, SubjectRegistry};
use store::{FileWal, InMemoryStore};
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = IngestConfig::from_env_and_args().context("invalid ingestion configuration")?;
    for line in config.summary() {
        info!("config {line}");
    }

    let registry: Option<Arc<dyn SubjectRegistry>> = match config.registry_path.as_ref() {
        Some(path) => {
            let registry = InMemoryRegistry::load_roster_file(path)
                .with_context(|| format!("failed loading roster '{}'", path.display()))?;
            info!(subjects = registry.len(), path = %path.display(), "participant registry loaded");
            Some(Arc::new(registry) as Arc<dyn SubjectRegistry>)
        }
        None => {
            warn!("no registry configured; subject ids are not checked against a roster");
            None
        }
    };

    let store = match config.wal_path.as_ref() {
        Some(path) => {
            let wal = FileWal::open_with_policy(path, config.wal_policy.clone())
                .with_context(|| format!("failed opening WAL '{}'", path.display()))?;
            let (store, stats) =
                InMemoryStore::load_from_wal_with_stats(wal, config.checkpoint_policy.clone())
                    .with_context(|| format!("failed replaying WAL '{}'", path.display()))?;
            info!(
                snapshot_records = stats.replay.snapshot_records,
                wal_records = stats.replay.wal_records,
                skipped_torn_records = stats.replay.skipped_torn_records,
                events = stats.events_loaded,
                purges = stats.purges_applied,
                last_seq = stats.last_seq,
                "event log replayed"
            );
            store
        }
        None => {
            warn!("no WAL path configured; events are kept in memory only");
            InMemoryStore::new()
        }
    };

    let mut options = RuntimeOptions::from_config(&config);
    options.registry = registry;
    let runtime: SharedRuntime = Arc::new(IngestionRuntime::with_options(store, options));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = vec![sweep::spawn_at_risk_sweep(
        runtime.clone(),
        config.sweep_interval,
        shutdown_rx.clone(),
    )];
    if let Some(interval) = config.wal_flush_interval {
        loops.push(sweep::spawn_wal_flush(
            runtime.clone(),
            interval,
            shutdown_rx.clone(),
        ));
    }

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %listener.local_addr()?, "yatra ingestion listening");

    let mut server_shutdown = shutdown_rx;
    let mut server = tokio::spawn(transport_axum::serve(
        listener,
        runtime.clone(),
        async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        },
    ));

    let served = tokio::select! {
        joined = &mut server => joined,
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            server.await
        }
    };
    let _ = shutdown_tx.send(true);
    for handle in loops {
        if let Err(err) = handle.await {
            error!(error = %err, "background loop panicked");
        }
    }
    runtime.flush_wal();
    info!("yatra ingestion stopped");

    served
        .context("http server task failed")?
        .context("http server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                error!(error = %err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
