use std::sync::Arc;

use anyhow::Context;
use device_sync::{
    DeviceNode, GateClient, HttpGateClient, Outbox, Reconciler, config::DeviceConfig,
    node::open_outbox,
};
use registry::{InMemoryRegistry, SubjectRegistry};
use schema::CheckpointId;
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal,
    sync::watch,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = DeviceConfig::from_env_and_args().context("invalid device configuration")?;
    for line in config.summary() {
        info!("config {line}");
    }

    let outbox = match config.outbox_path.as_ref() {
        Some(path) => {
            open_outbox(path, config.outbox)
                .with_context(|| format!("failed opening outbox '{}'", path.display()))?
                .0
        }
        None => {
            warn!("no outbox path configured; unsynced scans are lost on restart");
            Outbox::in_memory(config.outbox)
        }
    };

    let mut node = DeviceNode::new(config.settings(), outbox);
    match config.registry_path.as_ref() {
        Some(path) => {
            let registry = InMemoryRegistry::load_roster_file(path)
                .with_context(|| format!("failed loading roster '{}'", path.display()))?;
            info!(subjects = registry.len(), path = %path.display(), "participant registry loaded");
            node = node.with_registry(Arc::new(registry) as Arc<dyn SubjectRegistry>);
        }
        None => warn!("no registry configured; scans must name subject ids directly"),
    }
    let node = Arc::new(node);

    let client: Arc<dyn GateClient> = Arc::new(
        HttpGateClient::new(&config.gate_url, config.sync.request_timeout)
            .context("failed building gate client")?,
    );
    let reconciler = Arc::new(Reconciler::new(node.clone(), client, config.sync));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync = reconciler.clone().spawn(shutdown_rx);
    info!(device_id = node.device_id(), gate = %config.gate_url, "yatra device ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_command(&node, line.trim()),
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "failed reading operator input");
                    break;
                }
            },
            _ = &mut shutdown => break,
        }
    }

    let _ = shutdown_tx.send(true);
    sync.join().await;
    // One last attempt so a clean exit leaves as little as possible unsynced.
    if let Err(err) = reconciler.push_once().await {
        warn!(error = %err, pending = node.outbox_len(), "final push failed; scans stay queued");
    }
    if let Err(err) = node.compact_outbox() {
        warn!(error = %err, "outbox compaction failed");
    }
    info!(pending = node.outbox_len(), "yatra device stopped");
    Ok(())
}

fn handle_command(node: &DeviceNode, line: &str) {
    if line.is_empty() {
        return;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    let reply = match parts.as_slice() {
        ["at-risk"] => json!({ "at_risk": node.at_risk() }),
        ["requeue"] => match node.requeue_attention() {
            Ok(requeued) => json!({ "requeued": requeued }),
            Err(err) => json!({ "error": err.to_string() }),
        },
        ["status"] => json!({
            "device_id": node.device_id(),
            "online": node.is_online(),
            "pending": node.outbox_len(),
            "needs_attention": node.needs_attention().len(),
            "watermark": node.watermark(),
        }),
        ["stats", token] => match node.resolve_subject(token) {
            Ok(subject_id) => json!({ "stats": node.subject_stats(&subject_id) }),
            Err(err) => json!({ "error": err.to_string() }),
        },
        [token, checkpoint] => match checkpoint.parse::<CheckpointId>() {
            Ok(checkpoint_id) => match node.capture_token(token, checkpoint_id) {
                Ok(outcome) => json!({ "scan": outcome }),
                Err(err) => json!({ "error": err.to_string() }),
            },
            Err(_) => json!({ "error": format!("invalid checkpoint '{checkpoint}'") }),
        },
        _ => json!({
            "error": "expected '<token> <checkpoint>', 'stats <token>', 'at-risk', 'requeue' or 'status'"
        }),
    };
    println!("{reply}");
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
