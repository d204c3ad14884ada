use std::fs;
use std::path::Path;

use meshnode::config::Settings;
use meshnode::metrics;
use meshnode::node::NodeBuilder;
use meshnode::Error;
use meshnode::Result;
use meshnode::SystemError;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let settings = Settings::load(None)?;

    // Initializing Logs
    let _guard = init_observability(&settings.node.id, &settings.node.log_dir)?;

    // Initializing Shutdown Signal
    let (graceful_tx, graceful_rx) = watch::channel(());

    if settings.monitoring.metrics_enabled {
        let port = settings.monitoring.metrics_port;
        let shutdown = graceful_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_server(port, shutdown).await {
                error!("metrics server: {}", e);
            }
        });
    }

    let node = NodeBuilder::new(settings).build().await?;
    if node.bootstrap().await? {
        info!("bootstrapped a new mesh");
    }

    info!(node_id = %node.id(), "node started. Waiting for a shutdown signal...");
    if let Err(e) = wait_for_signal().await {
        error!("signal handling failed: {:?}", e);
    }
    if let Err(e) = graceful_tx.send(()) {
        error!("failed to send shutdown signal: {}", e);
    }

    node.shutdown().await?;
    info!("exiting");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(signal_error)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(signal_error)?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
    }
    Ok(())
}

fn signal_error(e: std::io::Error) -> Error {
    SystemError::NodeStartFailed(format!("install signal handler: {}", e)).into()
}

/// One log file per node under `log_dir`, filtered by `RUST_LOG`
fn init_observability(
    node_id: &str,
    log_dir: &Path,
) -> Result<WorkerGuard> {
    let dir = log_dir.join(node_id);
    fs::create_dir_all(&dir)
        .map_err(|e| SystemError::NodeStartFailed(format!("create log dir {:?}: {}", dir, e)))?;

    let file = tracing_appender::rolling::never(dir, "meshnode.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(EnvFilter::from_default_env());
    let stdout_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(guard)
}
