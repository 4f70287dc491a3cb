//! Daemon orchestration: wires the watcher, gate, queue, worker pool, S3
//! cache, and health surface together and runs until a shutdown signal
//! arrives (spec.md §5).

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::destination;
use crate::error::ConfigError;
use crate::gate::CompletenessGate;
use crate::health::{HealthServer, HealthState, HealthTicker};
use crate::queue::FileQueue;
use crate::replicator::{ConfiguredDestination, Replicator};
use crate::s3_cache::S3ClientCache;
use crate::watcher::DirectoryWatcher;

/// Build every collaborator from `cfg`, run the startup sweep, spawn the
/// worker pool and watcher thread, and block until a SIGINT/SIGTERM is
/// delivered. Returns after the full cooperative shutdown sequence
/// completes (spec.md §5: close queue → drain → stop watcher → close S3
/// clients → stop health listener).
pub fn run(cfg: AppConfig) -> Result<(), ConfigError> {
    let queue = Arc::new(FileQueue::new(cfg.queue_capacity));
    let gate = Arc::new(CompletenessGate::new(cfg.rounds, cfg.stability_period, cfg.check_interval));
    let s3_cache = Arc::new(S3ClientCache::new());

    let mut destinations = Vec::with_capacity(cfg.destinations.len());
    for spec in &cfg.destinations {
        let adapter = destination::build(spec, &s3_cache).map_err(|e| {
            ConfigError(format!("failed to build destination {}: {}", spec.describe(), e))
        })?;
        destinations.push(ConfiguredDestination { spec: spec.clone(), adapter });
    }
    let replicator =
        Arc::new(Replicator::new(cfg.ingest_root.clone(), destinations, cfg.checksum_retry_limit));

    let watcher = Arc::new(
        DirectoryWatcher::new(cfg.ingest_root.clone())
            .map_err(|e| ConfigError(format!("failed to start directory watcher: {e}")))?,
    );

    info!(ingest_root = %cfg.ingest_root.display(), "running startup sweep");
    {
        let gate = gate.clone();
        let queue = queue.clone();
        watcher.startup_sweep(&mut |path| dispatch(&gate, &queue, path));
    }

    let watcher_handle: JoinHandle<()> = {
        let watcher = watcher.clone();
        let gate = gate.clone();
        let queue = queue.clone();
        thread::Builder::new()
            .name("watcher".into())
            .spawn(move || watcher.run(&mut |path| dispatch(&gate, &queue, path)))
            .expect("failed to spawn watcher thread")
    };

    let mut worker_handles = Vec::with_capacity(cfg.workers);
    for id in 0..cfg.workers {
        let queue = queue.clone();
        let replicator = replicator.clone();
        worker_handles.push(
            thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker_loop(id, queue, replicator))
                .expect("failed to spawn worker thread"),
        );
    }

    let health_state =
        Arc::new(HealthState { queue: queue.clone(), s3_cache: s3_cache.clone(), worker_count: cfg.workers });
    let health_server = HealthServer::start(health_state.clone(), cfg.health_port)
        .map_err(|e| ConfigError(format!("failed to start health server on port {}: {}", cfg.health_port, e)))?;
    let health_ticker = HealthTicker::start(health_state);

    wait_for_shutdown_signal()?;

    info!("shutdown signal received, draining in-flight work");
    queue.close();
    for handle in worker_handles {
        let _ = handle.join();
    }
    watcher.stop();
    let _ = watcher_handle.join();
    s3_cache.close();
    health_server.stop();
    health_ticker.stop();
    info!("shutdown complete");
    Ok(())
}

fn dispatch(gate: &CompletenessGate, queue: &FileQueue, path: PathBuf) {
    if !gate.wait_until_stable(&path) {
        warn!(?path, "file did not stabilise within the configured rounds, skipping this event");
        return;
    }
    if let Err(e) = queue.enqueue(path.clone()) {
        warn!(?path, "failed to enqueue file, queue already closed: {e}");
    }
}

fn worker_loop(id: usize, queue: Arc<FileQueue>, replicator: Arc<Replicator>) {
    loop {
        let path = match queue.dequeue() {
            Ok(path) => path,
            Err(_) => return, // queue closed and drained
        };
        if let Err(e) = replicator.replicate(&path) {
            warn!(worker = id, %e, "replication failed, source retained for retry");
        }
    }
}

/// Installs a SIGINT/SIGTERM handler and blocks until it fires (spec.md §5:
/// the process has no async runtime on the main thread, so `ctrlc` is used
/// rather than a signal future).
fn wait_for_shutdown_signal() -> Result<(), ConfigError> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| ConfigError(format!("failed to install signal handler: {e}")))?;
    let _ = rx.recv();
    Ok(())
}
