//! Bounded work queue with edge-triggered saturation telemetry (spec.md §4.E).

use std::path::PathBuf;
use std::sync::Mutex;

use crossbeam_channel::{Receiver, RecvError, SendError, Sender, bounded};
use tracing::{info, warn};

/// Path of a file observed in the ingest tree, queued for replication.
/// Duplicates are expected and harmless (spec.md §3).
pub type PendingFile = PathBuf;

const SATURATION_THRESHOLD_PCT: f64 = 80.0;

/// A mutex-guarded edge latch: emits exactly one WARN when fill crosses
/// ≥80% and exactly one INFO when it drops back below (spec.md §4.E,
/// testable property 5).
struct SaturationLatch {
    tripped: Mutex<bool>,
}

impl SaturationLatch {
    fn new() -> Self {
        SaturationLatch { tripped: Mutex::new(false) }
    }

    fn observe(&self, len: usize, capacity: usize) {
        if capacity == 0 {
            return;
        }
        let fill_pct = (len as f64 / capacity as f64) * 100.0;
        let mut tripped = self.tripped.lock().expect("saturation latch poisoned");
        if fill_pct >= SATURATION_THRESHOLD_PCT && !*tripped {
            *tripped = true;
            warn!(len, capacity, fill_pct, "queue capacity critical");
        } else if fill_pct < SATURATION_THRESHOLD_PCT && *tripped {
            *tripped = false;
            info!(len, capacity, fill_pct, "queue capacity normalised");
        }
    }
}

/// Bounded FIFO of [`PendingFile`], capacity `Q` (spec.md §3, §4.E). The
/// sender lives behind a mutex so `close()` can drop it from any thread;
/// crossbeam's channel itself disconnects (wakes blocked receivers with
/// `Err`) once its last `Sender` is gone, which is exactly the "closed
/// exactly once, drains in flight" invariant spec.md asks for.
pub struct FileQueue {
    tx: Mutex<Option<Sender<PendingFile>>>,
    rx: Receiver<PendingFile>,
    capacity: usize,
    latch: SaturationLatch,
}

impl FileQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        FileQueue { tx: Mutex::new(Some(tx)), rx, capacity, latch: SaturationLatch::new() }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Blocking enqueue. The sole backpressure mechanism (spec.md §4.E):
    /// when the queue is full this call blocks the calling (watcher
    /// dispatch) thread until a worker makes room or the queue is closed.
    /// Returns `Err` if the queue has already been closed.
    pub fn enqueue(&self, file: PendingFile) -> Result<(), SendError<PendingFile>> {
        let sender = {
            let guard = self.tx.lock().expect("queue sender lock poisoned");
            match &*guard {
                Some(tx) => tx.clone(),
                None => return Err(SendError(file)),
            }
        };
        sender.send(file)?;
        self.latch.observe(self.len(), self.capacity);
        Ok(())
    }

    /// Blocking dequeue for a worker thread. Returns `Err` once the queue
    /// is closed and drained.
    pub fn dequeue(&self) -> Result<PendingFile, RecvError> {
        let item = self.rx.recv();
        self.latch.observe(self.len(), self.capacity);
        item
    }

    /// Close the queue: no further `enqueue` calls may succeed; in-flight
    /// `dequeue` calls drain whatever remains (spec.md §4.E shutdown).
    /// Idempotent.
    pub fn close(&self) {
        self.tx.lock().expect("queue sender lock poisoned").take();
    }
}
