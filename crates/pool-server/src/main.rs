mod cli;
mod recognizer;

use std::future::IntoFuture as _;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hony_pool_core::{PoolConfig, paths};
use hony_pool_engine::history::FileRegionHistory;
use hony_pool_engine::{PoolEvent, PoolHandle, PoolOptions, start_pool};

use crate::cli::Cli;
use crate::recognizer::ExternalProcessFactory;

/// What a Ctrl-C press means for the pool: the first one drains (admission
/// closes, in-flight recognitions finish), the second aborts outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Drain,
    Abort,
}

/// Watch for Ctrl-C and translate presses into [`StopSignal`]s. The watcher
/// exits after the abort signal; everything past that is the runtime's
/// problem.
fn spawn_stop_watcher() -> tokio::sync::mpsc::UnboundedReceiver<StopSignal> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut draining = false;
        while tokio::signal::ctrl_c().await.is_ok() {
            let signal = if draining {
                StopSignal::Abort
            } else {
                StopSignal::Drain
            };
            draining = true;
            if tx.send(signal).is_err() || signal == StopSignal::Abort {
                return;
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let root = paths::project_root().context("failed to resolve project root")?;
    let mut config = PoolConfig::load(&paths::config_file(&root))
        .context("failed to load configuration")?
        .unwrap_or_default();

    if let Some(min) = cli.min_instances {
        config.min_instances = min;
    }
    if let Some(max) = cli.max_instances {
        config.max_instances = max;
    }
    if config.model.storage_directory.is_none() {
        config.model.storage_directory = Some(paths::default_model_dir(&root));
    }
    config.validate().context("invalid configuration")?;

    tracing::info!(
        "honygo-ocr {} instances={}..{} workers={} queue={}",
        env!("CARGO_PKG_VERSION"),
        config.min_instances,
        config.max_instances,
        config.max_workers,
        config.max_queue_size
    );

    let options = PoolOptions {
        config,
        factory: Arc::new(ExternalProcessFactory::new(cli.python_bin.clone())),
        predictor: Some(Arc::new(FileRegionHistory::load(
            paths::region_history_file(&root),
        ))),
        performance_log_dir: Some(paths::performance_log_dir(&root)),
    };

    let pool = start_pool(options)
        .await
        .context("pool initialization failed")?;
    spawn_event_logger(&pool);

    let app = hony_pool_gateway::router(pool.clone());
    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("gateway listening on http://{addr}");

    let mut stop_rx = spawn_stop_watcher();

    let (graceful_tx, graceful_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = graceful_rx.await;
            })
            .into_future(),
    );

    let mut graceful_tx = Some(graceful_tx);
    loop {
        tokio::select! {
            signal = stop_rx.recv() => match signal {
                Some(StopSignal::Drain) => {
                    tracing::info!(
                        "stop requested; draining in-flight recognitions (press CTRL+C again to exit immediately)"
                    );
                    if let Some(tx) = graceful_tx.take() {
                        let _ = tx.send(());
                    }
                }
                Some(StopSignal::Abort) => {
                    tracing::warn!("stop requested again; exiting immediately");
                    std::process::exit(130);
                }
                None => break,
            },
            joined = &mut server => {
                joined.context("gateway task failed")??;
                break;
            }
        }
    }

    pool.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

fn spawn_event_logger(pool: &PoolHandle) {
    let mut events = pool.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                PoolEvent::Warning { message } => tracing::warn!("{message}"),
                PoolEvent::Error { message } => tracing::error!("{message}"),
                PoolEvent::InstanceReady { instance_id } => {
                    tracing::info!("instance {instance_id} ready");
                }
                PoolEvent::InstanceError {
                    instance_id,
                    message,
                } => tracing::warn!("instance {instance_id} error: {message}"),
                PoolEvent::InstanceStopped { instance_id } => {
                    tracing::info!("instance {instance_id} stopped");
                }
                PoolEvent::ScalingDecision { decision } => tracing::info!(
                    "scaling {:?} ({}); pool now {} instance(s)",
                    decision.action,
                    decision.reason,
                    decision.instances
                ),
                PoolEvent::TaskFailed { task_id, error } => {
                    tracing::debug!("task {task_id} failed: {error}");
                }
                PoolEvent::Stopped => break,
                _ => {}
            }
        }
    });
}
