use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use markerhub::batch::BatchCoalescer;
use markerhub::config::{Cli, Config};
use markerhub::connection::manager::ConnectionManager;
use markerhub::consumer::Consumer;
use markerhub::hub::Hub;
use markerhub::hydrator::Hydrator;
use markerhub::pubsub::PubSubClient;

/// Process exit codes per spec: 0 normal shutdown, 1 hydrate failure at
/// startup, 2 fatal internal error.
const EXIT_OK: u8 = 0;
const EXIT_HYDRATE_FAILED: u8 = 1;
const EXIT_INTERNAL_ERROR: u8 = 2;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match Config::from_env_with_overlay(&cli) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{:15.15}[x] {:20} config error: {}", "main", "config", e);
            return ExitCode::from(EXIT_INTERNAL_ERROR);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("{:15.15}[x] {:20} failed to start tokio runtime: {}", "main", "runtime", e);
            return ExitCode::from(EXIT_INTERNAL_ERROR);
        }
    };

    runtime.block_on(run(config))
}

async fn run(config: Arc<Config>) -> ExitCode {
    let hub = Arc::new(Hub::new(Arc::clone(&config)));

    info!(
        "{:15.15}[>] {:20} starting, listen_port={} batch_interval={:?}",
        "main", "startup", config.listen_port, config.batch_interval
    );

    let hydrator = Hydrator::new(&config);
    if let Err(e) = hydrator.hydrate_startup(&hub).await {
        error!(
            "{:15.15}[x] {:20} startup hydrate failed after retry budget: {}",
            "main", "hydrate-fail", e
        );
        return ExitCode::from(EXIT_HYDRATE_FAILED);
    }
    info!(
        "{:15.15}[>] {:20} hydrate complete, {} markers active",
        "main", "hydrate-ok", hub.metrics.snapshot().markers_active
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let pubsub_client = PubSubClient::new(&config);
    let consumer = Consumer::new(pubsub_client, Hydrator::new(&config));
    let consumer_hub = Arc::clone(&hub);
    let consumer_shutdown = shutdown_rx.clone();
    let consumer_task = tokio::spawn(async move {
        consumer.run(consumer_hub, consumer_shutdown).await;
    });

    let coalescer = BatchCoalescer::new(config.batch_interval);
    let coalescer_hub = Arc::clone(&hub);
    let coalescer_shutdown = shutdown_rx.clone();
    let coalescer_task = tokio::spawn(async move {
        coalescer.run(coalescer_hub, coalescer_shutdown).await;
    });

    let manager = ConnectionManager::new(Arc::clone(&hub));
    let manager_shutdown = shutdown_rx.clone();
    let listen_port = config.listen_port;
    let manager_task = tokio::spawn(async move {
        if let Err(e) = manager.run(listen_port, manager_shutdown).await {
            error!("{:15.15}[x] {:20} connection manager exited: {}", "main", "manager-fail", e);
        }
    });

    if tokio::signal::ctrl_c().await.is_err() {
        error!("{:15.15}[x] {:20} failed to install ctrl_c handler", "main", "signal");
    } else {
        info!("{:15.15}[<] {:20} shutdown signal received", "main", "shutdown");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(consumer_task, coalescer_task, manager_task);

    info!("{:15.15}[<] {:20} shutdown complete", "main", "shutdown");
    ExitCode::from(EXIT_OK)
}
