//! Completeness gate: decide whether a just-discovered file has stopped
//! being written and is safe to replicate (spec.md §4.C).

use std::fs::File;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use fs4::fs_std::FileExt;
use tracing::{debug, trace};

/// Indexer/finder/antivirus processes ignored by the external-open scan
/// (spec.md §4.C step 3).
const IGNORED_PROCESS_NAMES: &[&str] = &[
    "mds", "mdworker", "Spotlight", "mds_stores", "tracker-miner-fs", "SearchIndexer",
];

pub struct CompletenessGate {
    rounds: usize,
    stability_period: Duration,
    check_interval: Duration,
    lsof_path: Option<std::path::PathBuf>,
}

impl CompletenessGate {
    pub fn new(rounds: usize, stability_period: Duration, check_interval: Duration) -> Self {
        let lsof_path = which::which("lsof").ok();
        if lsof_path.is_none() {
            debug!("lsof not found at startup; external-open scan degraded to two-check gate");
        }
        CompletenessGate { rounds, stability_period, check_interval, lsof_path }
    }

    /// Run up to `rounds` rounds of the three checks. Returns `true` once a
    /// single round passes every check; `false` after exhausting `rounds`
    /// (spec.md §4.C — the file is skipped this event, a later watcher event
    /// re-enqueues it).
    pub fn wait_until_stable(&self, path: &Path) -> bool {
        for round in 0..self.rounds {
            trace!(?path, round, "completeness gate round");
            if !self.stat_stability(path) {
                continue;
            }
            if !self.exclusive_open_test(path) {
                std::thread::sleep(self.check_interval);
                continue;
            }
            if let Some(lsof) = &self.lsof_path {
                if !self.external_open_scan(path, lsof) {
                    std::thread::sleep(self.check_interval);
                    continue;
                }
            }
            return true;
        }
        false
    }

    /// Step 1: sample `(size, mtime)`, sleep, resample. Any change fails the
    /// round immediately without the extra `check_interval` sleep — the
    /// fresh write is assumed to still be ongoing.
    fn stat_stability(&self, path: &Path) -> bool {
        let Some((size0, mtime0)) = stat_pair(path) else { return false };
        std::thread::sleep(self.stability_period);
        let Some((size1, mtime1)) = stat_pair(path) else { return false };
        size0 == size1 && mtime0 == mtime1
    }

    /// Step 2: advisory exclusive non-blocking lock, released immediately.
    fn exclusive_open_test(&self, path: &Path) -> bool {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(_) => return false,
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                true
            }
            Err(_) => false,
        }
    }

    /// Step 3: shell out to `lsof -Fn <path>` and look for any PID holding
    /// the file open besides this process (spec.md §4.C).
    fn external_open_scan(&self, path: &Path, lsof: &Path) -> bool {
        let output = match Command::new(lsof).arg("-Fn").arg(path).output() {
            Ok(o) => o,
            Err(_) => return true, // tool vanished mid-run; don't block on it
        };
        if !output.status.success() {
            // lsof exits non-zero when nothing has the file open.
            return true;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let current_pid = std::process::id();
        let mut holder_pid: Option<u32> = None;
        for line in stdout.lines() {
            if let Some(pid_str) = line.strip_prefix('p') {
                holder_pid = pid_str.parse().ok();
            }
            if let Some(pid) = holder_pid {
                if pid == current_pid {
                    continue;
                }
                if let Some(name) = process_name_for(pid) {
                    if IGNORED_PROCESS_NAMES.iter().any(|ignored| name.contains(ignored)) {
                        continue;
                    }
                }
                return false;
            }
        }
        true
    }
}

fn stat_pair(path: &Path) -> Option<(u64, std::time::SystemTime)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.len(), meta.modified().ok()?))
}

fn process_name_for(pid: u32) -> Option<String> {
    let output = Command::new("ps").arg("-p").arg(pid.to_string()).arg("-o").arg("comm=").output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_stability_true_for_untouched_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let gate = CompletenessGate::new(1, Duration::from_millis(5), Duration::from_millis(5));
        assert!(gate.stat_stability(&path));
    }

    #[test]
    fn stat_stability_false_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        let gate = CompletenessGate::new(1, Duration::from_millis(5), Duration::from_millis(5));
        assert!(!gate.stat_stability(&path));
    }

    #[test]
    fn exclusive_open_test_passes_for_unlocked_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let gate = CompletenessGate::new(1, Duration::from_millis(5), Duration::from_millis(5));
        assert!(gate.exclusive_open_test(&path));
    }

    #[test]
    fn wait_until_stable_succeeds_for_quiescent_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let gate = CompletenessGate::new(3, Duration::from_millis(5), Duration::from_millis(5));
        assert!(gate.wait_until_stable(&path));
    }

    #[test]
    fn wait_until_stable_fails_for_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        let gate = CompletenessGate::new(2, Duration::from_millis(5), Duration::from_millis(5));
        assert!(!gate.wait_until_stable(&path));
    }
}
