//! Read-only health HTTP surface (spec.md §4.G).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde_json::json;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::queue::FileQueue;
use crate::s3_cache::S3ClientCache;

const DEGRADED_FILL_PCT: f64 = 80.0;
const UNHEALTHY_FILL_PCT: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl SubStatus {
    fn as_str(self) -> &'static str {
        match self {
            SubStatus::Healthy => "healthy",
            SubStatus::Degraded => "degraded",
            SubStatus::Unhealthy => "unhealthy",
        }
    }

    fn worse(self, other: SubStatus) -> SubStatus {
        use SubStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

/// Read-only snapshot handle into the pipeline's live components (spec.md
/// §4.G: the health surface never writes). No locks beyond what the queue
/// and S3 cache already hold for their own bookkeeping.
pub struct HealthState {
    pub queue: Arc<FileQueue>,
    pub s3_cache: Arc<S3ClientCache>,
    pub worker_count: usize,
}

impl HealthState {
    fn file_watcher_status(&self) -> SubStatus {
        let fill_pct = if self.queue.capacity() == 0 {
            0.0
        } else {
            (self.queue.len() as f64 / self.queue.capacity() as f64) * 100.0
        };
        if fill_pct > UNHEALTHY_FILL_PCT {
            SubStatus::Unhealthy
        } else if fill_pct > DEGRADED_FILL_PCT {
            SubStatus::Degraded
        } else {
            SubStatus::Healthy
        }
    }

    /// Aggregate sub-statuses into the JSON body spec.md §6 fixes the shape
    /// of, plus the HTTP status code to respond with.
    fn aggregate(&self) -> (StatusCode, serde_json::Value) {
        let file_watcher = self.file_watcher_status();
        let s3_clients = SubStatus::Healthy;
        let worker_pool = SubStatus::Healthy;
        let overall = file_watcher.worse(s3_clients).worse(worker_pool);

        let code = if overall == SubStatus::Unhealthy { StatusCode::SERVICE_UNAVAILABLE } else { StatusCode::OK };
        let body = json!({
            "status": overall.as_str(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "components": {
                "file_watcher": {
                    "status": file_watcher.as_str(),
                    "queue_len": self.queue.len(),
                    "queue_capacity": self.queue.capacity(),
                },
                "s3_clients": {
                    "status": s3_clients.as_str(),
                    "active_count": self.s3_cache.active_count(),
                },
                "worker_pool": {
                    "status": worker_pool.as_str(),
                    "worker_count": self.worker_count,
                },
            },
        });
        (code, body)
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let (code, body) = state.aggregate();
    (code, Json(body))
}

async fn live_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "alive"})))
}

fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/ready", get(health_handler))
        .route("/health/live", get(live_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs the axum listener on a dedicated thread with its own tokio runtime
/// (the rest of the daemon is blocking-threaded, spec.md §5).
pub struct HealthServer {
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthServer {
    pub fn start(state: Arc<HealthState>, port: u16) -> std::io::Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let app = router(state);

        let handle = std::thread::Builder::new()
            .name("health-server".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!("failed to start health server runtime: {e}");
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(std_listener) {
                        Ok(l) => l,
                        Err(e) => {
                            warn!("failed to adopt health listener: {e}");
                            return;
                        }
                    };
                    info!(%addr, "health server listening");
                    let server = axum::serve(listener, app).with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    });
                    if let Err(e) = server.await {
                        warn!("health server exited with error: {e}");
                    }
                });
            })
            .expect("failed to spawn health server thread");

        Ok(HealthServer { shutdown_tx: Mutex::new(Some(shutdown_tx)), handle: Mutex::new(Some(handle)) })
    }

    /// Stop the listener and join its thread. Idempotent.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().expect("health shutdown lock poisoned").take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().expect("health handle lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

/// Background ticker (spec.md §4.G): evaluates the same aggregation every
/// 10 s and logs it, independent of HTTP traffic.
pub struct HealthTicker {
    stop_tx: Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthTicker {
    pub fn start(state: Arc<HealthState>) -> Self {
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = unbounded();
        let handle = std::thread::Builder::new()
            .name("health-ticker".into())
            .spawn(move || run_ticker(state, stop_rx))
            .expect("failed to spawn health ticker thread");
        HealthTicker { stop_tx, handle: Mutex::new(Some(handle)) }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.lock().expect("health ticker handle lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn run_ticker(state: Arc<HealthState>, stop_rx: Receiver<()>) {
    loop {
        match stop_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(()) => return,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                let (_, body) = state.aggregate();
                info!(health = %body, "periodic health evaluation");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::FileQueue;
    use crate::s3_cache::S3ClientCache;

    fn state(capacity: usize, len_to_fill: usize) -> Arc<HealthState> {
        let queue = Arc::new(FileQueue::new(capacity));
        for i in 0..len_to_fill {
            queue.enqueue(std::path::PathBuf::from(format!("/f{i}"))).unwrap();
        }
        Arc::new(HealthState { queue, s3_cache: Arc::new(S3ClientCache::new()), worker_count: 4 })
    }

    #[test]
    fn healthy_when_queue_mostly_empty() {
        let s = state(10, 1);
        let (code, body) = s.aggregate();
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[test]
    fn degraded_above_80_percent() {
        let s = state(10, 9);
        let (code, body) = s.aggregate();
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["components"]["file_watcher"]["status"], "degraded");
    }

    #[test]
    fn unhealthy_above_90_percent_returns_503() {
        let queue = Arc::new(FileQueue::new(10));
        // Fill past 90% using a queue whose capacity tracking allows it;
        // 10/10 = 100% exceeds 90%.
        for i in 0..10 {
            queue.enqueue(std::path::PathBuf::from(format!("/f{i}"))).unwrap();
        }
        let s = Arc::new(HealthState { queue, s3_cache: Arc::new(S3ClientCache::new()), worker_count: 2 });
        let (code, body) = s.aggregate();
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
    }
}
