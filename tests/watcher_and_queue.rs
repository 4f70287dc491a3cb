//! Tempfile-skip and queue-saturation scenarios (spec.md §8, S5-S6).

use std::path::PathBuf;

use assert_fs::TempDir;
use assert_fs::prelude::*;
use predicates::prelude::*;
use replicatord::queue::FileQueue;
use replicatord::watcher::DirectoryWatcher;

#[test]
fn s5_tempfile_skip_never_dispatched() {
    let dir = TempDir::new().unwrap();
    dir.child(".partial").write_str("still writing").unwrap();
    dir.child("~lockfile").write_str("editor swap").unwrap();
    dir.child("ready.txt").write_str("done").unwrap();

    let watcher = DirectoryWatcher::new(dir.path().to_path_buf()).unwrap();
    let mut dispatched = Vec::new();
    watcher.startup_sweep(&mut |p| dispatched.push(p));

    assert!(dispatched.iter().any(|p| p.ends_with("ready.txt")));
    assert!(!dispatched.iter().any(|p| p.ends_with(".partial")));
    assert!(!dispatched.iter().any(|p| p.ends_with("~lockfile")));

    // The tempfiles are never consumed; they remain exactly where they landed.
    dir.child(".partial").assert(predicate::path::exists());
    dir.child("~lockfile").assert(predicate::path::exists());
}

#[test]
fn s6_saturation_signal_does_not_exceed_capacity() {
    let q = FileQueue::new(10);
    for i in 0..8 {
        q.enqueue(PathBuf::from(format!("/stalled-{i}"))).unwrap();
    }
    assert_eq!(q.len(), 8);
    assert!(q.len() <= q.capacity());

    // Draining below the 80% threshold must not panic or misbehave; the
    // saturation latch's own edge-triggered behaviour is unit-tested in
    // queue.rs against the WARN/INFO log lines directly.
    for _ in 0..4 {
        q.dequeue().unwrap();
    }
    assert_eq!(q.len(), 4);
}
