//! Recursive directory watcher with live subtree registration (spec.md §4.D).
//!
//! Ownership: this struct owns the subtree subscription set (spec.md §3).
//! It does not own the queue or the completeness gate — it calls into a
//! caller-supplied dispatch closure for every candidate path, which is the
//! "dispatcher thread" spec.md §4.C/§5 describes (gate checks run here, not
//! on a worker thread).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// A candidate path filtered past the tempfile heuristic, handed to the
/// dispatch closure. Directories and files are distinguished by the caller
/// re-statting, since the path may have changed between the event firing
/// and the dispatch running.
pub struct DirectoryWatcher {
    ingest_root: PathBuf,
    watcher: Mutex<RecommendedWatcher>,
    subscribed: Mutex<HashSet<PathBuf>>,
    events_rx: Receiver<notify::Result<Event>>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

/// Basename tempfile heuristic (spec.md §3 PendingFile invariant ii): a
/// leading `.` or `~` marks a partial/editor-swap file, filtered out before
/// it ever reaches the gate or the queue.
pub fn is_tempfile_name(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.starts_with('.') || name.starts_with('~'),
        None => true,
    }
}

impl DirectoryWatcher {
    pub fn new(ingest_root: PathBuf) -> notify::Result<Self> {
        let (events_tx, events_rx) = unbounded();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = events_tx.send(res);
        })?;
        let (stop_tx, stop_rx) = unbounded();
        Ok(DirectoryWatcher {
            ingest_root,
            watcher: Mutex::new(watcher),
            subscribed: Mutex::new(HashSet::new()),
            events_rx,
            stop_tx,
            stop_rx,
        })
    }

    /// Startup sweep (spec.md §4.D): subscribe every directory and dispatch
    /// every regular file already present, recovering files that arrived
    /// while the process was down.
    pub fn startup_sweep(&self, dispatch: &mut dyn FnMut(PathBuf)) {
        for entry in WalkDir::new(&self.ingest_root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path().to_path_buf();
            if entry.file_type().is_dir() {
                self.subscribe(&path);
            } else if entry.file_type().is_file() {
                if !is_tempfile_name(&path) {
                    dispatch(path);
                }
            }
        }
    }

    fn subscribe(&self, dir: &Path) {
        let mut subscribed = self.subscribed.lock().expect("watcher subscription lock poisoned");
        if subscribed.contains(dir) {
            return;
        }
        let mut watcher = self.watcher.lock().expect("watcher lock poisoned");
        match watcher.watch(dir, RecursiveMode::NonRecursive) {
            Ok(()) => {
                subscribed.insert(dir.to_path_buf());
                trace!(?dir, "subscribed directory");
            }
            Err(e) => warn!(?dir, "failed to subscribe directory: {e}"),
        }
    }

    fn unsubscribe(&self, path: &Path) {
        let mut subscribed = self.subscribed.lock().expect("watcher subscription lock poisoned");
        if subscribed.remove(path) {
            let mut watcher = self.watcher.lock().expect("watcher lock poisoned");
            // Failure is silently ignored: the path may not have been
            // tracked (spec.md §4.D).
            let _ = watcher.unwatch(path);
        }
    }

    /// Run the event loop until `stop()` is called. Blocks the calling
    /// thread; intended to be spawned on its own thread (spec.md §5).
    pub fn run(&self, dispatch: &mut dyn FnMut(PathBuf)) {
        loop {
            if self.stop_rx.try_recv().is_ok() {
                return;
            }
            match self.events_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Ok(event)) => self.handle_event(event, dispatch),
                Ok(Err(e)) => debug!("notifier error (drained, non-fatal): {e}"),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn handle_event(&self, event: Event, dispatch: &mut dyn FnMut(PathBuf)) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in event.paths {
                    if is_tempfile_name(&path) {
                        continue;
                    }
                    match std::fs::metadata(&path) {
                        Ok(meta) if meta.is_dir() => self.subscribe(&path),
                        Ok(meta) if meta.is_file() => dispatch(path),
                        _ => {}
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    self.unsubscribe(&path);
                }
            }
            _ => {}
        }
    }

    /// Signal `run()` to return. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tempfile_names_are_filtered() {
        assert!(is_tempfile_name(Path::new("/a/.partial")));
        assert!(is_tempfile_name(Path::new("/a/~lock")));
        assert!(!is_tempfile_name(Path::new("/a/report.csv")));
    }

    #[test]
    fn startup_sweep_dispatches_existing_files_and_skips_tempfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"y").unwrap();
        std::fs::write(dir.path().join(".partial"), b"z").unwrap();

        let watcher = DirectoryWatcher::new(dir.path().to_path_buf()).unwrap();
        let mut seen = Vec::new();
        watcher.startup_sweep(&mut |p| seen.push(p));

        assert!(seen.iter().any(|p| p.ends_with("a.txt")));
        assert!(seen.iter().any(|p| p.ends_with("sub/b.txt")));
        assert!(!seen.iter().any(|p| p.ends_with(".partial")));
    }

    #[test]
    fn stop_causes_run_to_return() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = DirectoryWatcher::new(dir.path().to_path_buf()).unwrap();
        watcher.subscribe(dir.path());
        watcher.stop();
        let mut seen = Vec::new();
        watcher.run(&mut |p| seen.push(p));
        assert!(seen.is_empty());
    }
}
