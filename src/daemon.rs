use anyhow::{Context, Result};
use fs2::FileExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::consumer::Consumer;
use crate::cursor::{platform, CursorMonitor};
use crate::claude::ClaudeTailer;
use crate::error::PipelineError;
use crate::health::Metrics;
use crate::ingress::{self, AppState};
use crate::queue::{MessageQueue, RedisQueue};
use crate::registry::{self, SessionRegistry};
use crate::store::Store;

/// Workers get this long to finish their in-flight batch and persist state.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

const QUEUE_CONNECT_ATTEMPTS: u32 = 3;

/// Run the capture pipeline until a termination signal arrives.
pub async fn run(config: Config) -> Result<(), PipelineError> {
    std::fs::create_dir_all(&config.data_dir)?;

    // One daemon per data dir; two instances would interleave offset writes.
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(config.lock_path())?;
    lock_file.try_lock_exclusive().map_err(|_| {
        PipelineError::Config(format!(
            "another instance holds {}",
            config.lock_path().display()
        ))
    })?;

    let store = Arc::new(Store::open(&config.store_path())?);
    let registry = Arc::new(SessionRegistry::new(store.clone())?);
    let metrics = Arc::new(Metrics::default());
    let queue = connect_queue(&config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    info!(
        data_dir = %config.data_dir.display(),
        redis = %config.redis_url(),
        "blueplane telemetry core starting"
    );

    let mut workers = Vec::new();

    let app_state = AppState {
        queue: queue.clone(),
        store: store.clone(),
        registry: registry.clone(),
        metrics: metrics.clone(),
    };
    let port = config.ingress_port;
    let ingress_shutdown = shutdown_rx.clone();
    workers.push(tokio::spawn(async move {
        if let Err(e) = ingress::serve(app_state, port, ingress_shutdown).await {
            error!(error = %e, "ingress server exited");
        }
    }));

    let monitor = CursorMonitor::new(
        platform::resolve_user_dir(config.cursor_data_dir.as_deref()),
        Duration::from_secs(config.cursor_poll_secs),
        registry.clone(),
        store.clone(),
        queue.clone(),
        metrics.clone(),
    )
    .with_workspace_root(config.workspace_root.clone());
    workers.push(tokio::spawn(monitor.run(shutdown_rx.clone())));

    let tailer = ClaudeTailer::new(
        config.claude_projects_dir.clone(),
        Duration::from_secs(config.claude_poll_secs),
        store.clone(),
        queue.clone(),
        metrics.clone(),
    );
    workers.push(tokio::spawn(tailer.run(shutdown_rx.clone())));

    let consumer = Consumer::new(queue.clone(), store.clone(), metrics.clone());
    workers.push(tokio::spawn(consumer.run(shutdown_rx.clone())));

    workers.push(tokio::spawn(registry::run_sweeper(
        registry.clone(),
        shutdown_rx.clone(),
    )));

    // Park until the signal handler flips the flag.
    let mut wait = shutdown_rx.clone();
    let _ = wait.changed().await;
    info!("shutdown requested, draining workers");

    let drain = async {
        for worker in workers {
            let _ = worker.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, drain).await.is_err() {
        warn!("shutdown budget exceeded, abandoning workers");
    }

    info!("blueplane telemetry core stopped");
    Ok(())
}

async fn connect_queue(config: &Config) -> Result<Arc<dyn MessageQueue>, PipelineError> {
    let url = config.redis_url();
    let mut last_err = None;
    for attempt in 0..QUEUE_CONNECT_ATTEMPTS {
        match RedisQueue::connect(&url).await {
            Ok(queue) => return Ok(Arc::new(queue)),
            Err(e) => {
                warn!(attempt, error = %e, "queue connect failed");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| PipelineError::TransientIo("queue unreachable".into())))
}

fn spawn_signal_handler(shutdown: tokio::sync::watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        let _ = shutdown.send(true);
    });
}

/// Wire the tracing subscriber: stderr plus `logs/processing.log`.
pub fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    let log_path = config.log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).context("creating log directory")?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false),
        )
        .try_init()
        .ok();
    Ok(())
}
