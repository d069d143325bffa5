//! Scheduler & Worker Pool (C4): a four-band priority queue drained by an
//! adaptively sized thread pool, with scan-group cancellation and lazy
//! directory expansion (spec §4.4).

use crate::error::ScanError;
use crate::guard::PolicyGuard;
use crate::policy::Priority;
use crate::task::{CancelToken, ScanGroupId, ScanTarget, ScanTask};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// FIFO sequence number breaks ties within the same priority band so the
/// queue is stable, not merely priority-ordered.
struct QueuedTask {
    task: ScanTask,
    sequence: u64,
}

impl QueuedTask {
    fn key(&self) -> (u8, std::cmp::Reverse<u64>) {
        (self.task.priority.band(), std::cmp::Reverse(self.sequence))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the lowest band (highest
        // priority) and lowest sequence (oldest) to sort first, so reverse.
        other.key().cmp(&self.key())
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    next_sequence: u64,
    cancelled_groups: HashSet<u128>,
    full_scan_active: bool,
    shutdown: bool,
}

/// Minimum and maximum worker counts the adaptive resize timer will settle
/// on: `[2, min(8, logical_cpus)]` (spec §4.4).
pub struct WorkerBounds {
    pub min: usize,
    pub max: usize,
}

impl WorkerBounds {
    pub fn from_logical_cpus(logical_cpus: usize) -> Self {
        let max = logical_cpus.clamp(1, 8);
        let min = 2.min(max);
        Self { min, max }
    }

    /// Initial worker count before the first resize sample: `max(2,
    /// logical_cpus/2)`, bounded to `max` (spec §4.4).
    pub fn initial(&self, logical_cpus: usize) -> usize {
        (logical_cpus / 2).max(2).min(self.max)
    }
}

/// Callback invoked by each worker thread to execute a dequeued task and
/// produce per-file results. The scheduler itself is engine-agnostic; the
/// orchestrator supplies this closure.
pub type TaskRunner = dyn Fn(ScanTask) + Send + Sync;

/// Callback invoked once a scan group has no outstanding tasks left: the
/// original submission plus every task a directory expansion spawned from
/// it (spec §4.9 `ScanCompleted`).
pub type GroupDrainSink = dyn Fn(ScanGroupId) + Send + Sync;

pub struct Scheduler {
    state: Mutex<QueueState>,
    cond: Condvar,
    worker_target: Arc<AtomicUsize>,
    bounds: WorkerBounds,
    logical_cpus: usize,
    running_workers: AtomicUsize,
    shutdown_flag: Arc<AtomicBool>,
    guard: Arc<PolicyGuard>,
    group_tokens: Mutex<HashMap<u128, CancelToken>>,
    last_progress_emit: Mutex<HashMap<u128, Instant>>,
    /// Outstanding task count per group: incremented on every `submit`,
    /// decremented once a file task runs or a directory task finishes
    /// expanding. Reaching zero fires `on_drained`.
    group_outstanding: Mutex<HashMap<u128, i64>>,
    on_drained: Mutex<Option<Arc<GroupDrainSink>>>,
}

impl Scheduler {
    pub fn new(guard: Arc<PolicyGuard>, bounds: WorkerBounds) -> Arc<Self> {
        Self::with_logical_cpus(guard, bounds, std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }

    pub fn with_logical_cpus(guard: Arc<PolicyGuard>, bounds: WorkerBounds, logical_cpus: usize) -> Arc<Self> {
        let initial = bounds.initial(logical_cpus);
        Arc::new(Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_sequence: 0,
                cancelled_groups: HashSet::new(),
                full_scan_active: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
            worker_target: Arc::new(AtomicUsize::new(initial)),
            bounds,
            logical_cpus: logical_cpus.max(1),
            running_workers: AtomicUsize::new(0),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            guard,
            group_tokens: Mutex::new(HashMap::new()),
            last_progress_emit: Mutex::new(HashMap::new()),
            group_outstanding: Mutex::new(HashMap::new()),
            on_drained: Mutex::new(None),
        })
    }

    /// Submits a task. A `Full`-mode task is rejected with `Busy` while
    /// another full-scope scan group is active (spec §4.4 concurrency
    /// safety); directory tasks are expanded lazily by workers, not here.
    pub fn submit(self: &Arc<Self>, task: ScanTask) -> Result<(), ScanError> {
        let mut state = self.state.lock();
        if matches!(task.target, ScanTarget::Directory(_)) && task.policy.mode == crate::policy::ScanMode::Full {
            if state.full_scan_active {
                return Err(ScanError::Busy);
            }
            state.full_scan_active = true;
        }
        self.group_tokens.lock().insert(task.group.0.as_u128(), task.cancel_token.clone());
        *self.group_outstanding.lock().entry(task.group.0.as_u128()).or_insert(0) += 1;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.heap.push(QueuedTask { task, sequence });
        drop(state);
        self.cond.notify_one();
        Ok(())
    }

    /// Registers the sink invoked once a scan group's outstanding task
    /// count reaches zero. Must be set before `run` to avoid missing an
    /// already-drained group (the CLI/facade sets this once at startup).
    pub fn set_on_drained(&self, sink: Arc<GroupDrainSink>) {
        *self.on_drained.lock() = Some(sink);
    }

    fn complete_one(&self, group: &ScanGroupId) {
        let drained = {
            let mut outstanding = self.group_outstanding.lock();
            match outstanding.get_mut(&group.0.as_u128()) {
                Some(count) => {
                    *count -= 1;
                    let done = *count <= 0;
                    if done {
                        outstanding.remove(&group.0.as_u128());
                    }
                    done
                }
                None => false,
            }
        };
        if drained {
            if let Some(sink) = self.on_drained.lock().clone() {
                sink(group.clone());
            }
        }
    }

    /// Cancels every queued and in-flight task belonging to `group`.
    pub fn cancel_group(&self, group: &ScanGroupId) {
        if let Some(token) = self.group_tokens.lock().get(&group.0.as_u128()) {
            token.cancel();
        }
        self.state.lock().cancelled_groups.insert(group.0.as_u128());
    }

    fn is_group_cancelled(&self, group: &ScanGroupId) -> bool {
        self.state.lock().cancelled_groups.contains(&group.0.as_u128())
    }

    /// Spawns worker threads (driven by `worker_target`) plus the adaptive
    /// resize timer thread; blocks the caller not at all — everything here
    /// runs on dedicated `std::thread`s (spec §5: no async runtime).
    pub fn run(self: &Arc<Self>, runner: Arc<TaskRunner>) {
        let resize_scheduler = self.clone();
        std::thread::spawn(move || resize_scheduler.resize_loop());

        let target = self.worker_target.load(AtomicOrdering::SeqCst);
        for _ in 0..target {
            self.spawn_worker(runner.clone());
        }
    }

    fn spawn_worker(self: &Arc<Self>, runner: Arc<TaskRunner>) {
        let scheduler = self.clone();
        self.running_workers.fetch_add(1, AtomicOrdering::SeqCst);
        std::thread::spawn(move || {
            scheduler.worker_loop(runner);
            scheduler.running_workers.fetch_sub(1, AtomicOrdering::SeqCst);
        });
    }

    fn worker_loop(self: &Arc<Self>, runner: Arc<TaskRunner>) {
        loop {
            if self.shutdown_flag.load(AtomicOrdering::SeqCst) {
                return;
            }
            // Cooperative shrink: if we're above target, this worker exits
            // instead of waiting for more work (spec §4.4 adaptive resize).
            if self.running_workers.load(AtomicOrdering::SeqCst) > self.worker_target.load(AtomicOrdering::SeqCst) {
                return;
            }

            let task = {
                let mut state = self.state.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    if let Some(queued) = state.heap.pop() {
                        break Some(queued.task);
                    }
                    let timed_out = self.cond.wait_for(&mut state, Duration::from_millis(500)).timed_out();
                    if timed_out
                        && self.running_workers.load(AtomicOrdering::SeqCst)
                            > self.worker_target.load(AtomicOrdering::SeqCst)
                    {
                        return;
                    }
                }
            };

            let Some(task) = task else { continue };

            if self.is_group_cancelled(&task.group) || task.cancel_token.is_cancelled() {
                debug!(group = %task.group, "dropping task from cancelled group");
                self.complete_one(&task.group);
                continue;
            }

            match task.target {
                ScanTarget::Directory(ref spec) => {
                    self.expand_directory(&task, spec.root.clone());
                    if task.policy.mode == crate::policy::ScanMode::Full {
                        self.state.lock().full_scan_active = false;
                    }
                    self.complete_one(&task.group);
                }
                ScanTarget::File(_) => {
                    let group = task.group.clone();
                    runner(task);
                    self.complete_one(&group);
                }
            }
        }
    }

    /// Lazily walks a directory, re-enqueueing each discovered file as its
    /// own task at the same priority so no single directory blocks the
    /// queue (spec §4.4).
    fn expand_directory(self: &Arc<Self>, task: &ScanTask, root: std::path::PathBuf) {
        let files = crate::guard::enumerate_allowed(&root, &self.guard, &task.policy);
        for path in files {
            if task.cancel_token.is_cancelled() {
                break;
            }
            let Ok(identity) = crate::identity::FileIdentity::stat(&path) else { continue };
            let file_task = ScanTask::new(
                task.group.clone(),
                ScanTarget::File(identity),
                task.priority,
                task.policy.clone(),
                task.cancel_token.clone(),
            );
            let _ = self.submit(file_task);
        }
    }

    /// `true` if enough time has passed since the last progress emission
    /// for `group` to publish another one, batching at <= 10 Hz (spec §4.4).
    pub fn should_emit_progress(&self, group: &ScanGroupId) -> bool {
        let mut map = self.last_progress_emit.lock();
        let now = Instant::now();
        match map.get(&group.0.as_u128()) {
            Some(last) if now.duration_since(*last) < Duration::from_millis(100) => false,
            _ => {
                map.insert(group.0.as_u128(), now);
                true
            }
        }
    }

    fn resize_loop(self: Arc<Self>) {
        loop {
            if self.shutdown_flag.load(AtomicOrdering::SeqCst) {
                return;
            }
            std::thread::sleep(Duration::from_secs(5));
            let target = self.compute_target_workers();
            let previous = self.worker_target.swap(target, AtomicOrdering::SeqCst);
            if target > previous {
                info!(from = previous, to = target, "scaling worker pool up");
            } else if target < previous {
                info!(from = previous, to = target, "scaling worker pool down");
            }
        }
    }

    /// Samples `/proc/loadavg` and `/proc/meminfo` (POSIX-only, spec
    /// non-goals) to pick a worker-count target within `bounds`.
    /// Adjusts the worker target by one step per 5s sample (spec §4.4):
    /// scale down when memory pressure exceeds 85% or load average exceeds
    /// `logical_cpus * 1.5`; scale up when utilization is >80% and both
    /// pressures are below threshold. Utilization is approximated by
    /// whether the queue still has work waiting for an idle worker.
    fn compute_target_workers(&self) -> usize {
        let load1 = read_loadavg().unwrap_or(0.0);
        let mem_pressure = read_mem_pressure().unwrap_or(0.0);
        let current = self.worker_target.load(AtomicOrdering::SeqCst);
        let load_high = load1 > self.logical_cpus as f64 * 1.5;
        let mem_high = mem_pressure > 0.85;

        if mem_high || load_high {
            warn!(mem_pressure, load1, "resource pressure high, shrinking worker pool");
            return current.saturating_sub(1).max(self.bounds.min);
        }

        let queue_depth = self.state.lock().heap.len();
        let utilization = if current == 0 { 1.0 } else { (queue_depth as f64 / current as f64).min(1.0) };
        if utilization > 0.8 {
            return (current + 1).min(self.bounds.max);
        }
        current.clamp(self.bounds.min, self.bounds.max)
    }

    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, AtomicOrdering::SeqCst);
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }
}

fn read_loadavg() -> Option<f64> {
    let content = fs::read_to_string("/proc/loadavg").ok()?;
    content.split_whitespace().next()?.parse().ok()
}

fn read_mem_pressure() -> Option<f64> {
    let content = fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.trim().split_whitespace().next()?.parse::<f64>().ok();
        }
    }
    match (total, available) {
        (Some(t), Some(a)) if t > 0.0 => Some(1.0 - (a / t)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ScanPolicy;
    use crate::task::DirectorySpec;

    fn scheduler() -> Arc<Scheduler> {
        let guard = Arc::new(PolicyGuard::new(None, &PolicyGuard::default_denylist()).unwrap());
        Scheduler::new(guard, WorkerBounds { min: 1, max: 2 })
    }

    #[test]
    fn higher_priority_dequeues_first() {
        let sched = scheduler();
        let group = ScanGroupId::new();
        let policy = Arc::new(ScanPolicy::default());

        let mut state = sched.state.lock();
        for (priority, seq) in [
            (Priority::Background, 0),
            (Priority::Interactive, 1),
            (Priority::Scheduled, 2),
        ] {
            let task = ScanTask::new(
                group.clone(),
                ScanTarget::Directory(DirectorySpec { root: "/tmp".into() }),
                priority,
                policy.clone(),
                CancelToken::new(),
            );
            state.heap.push(QueuedTask { task, sequence: seq });
        }
        let first = state.heap.pop().unwrap();
        assert_eq!(first.task.priority, Priority::Interactive);
    }

    #[test]
    fn second_full_scan_is_rejected_busy() {
        let sched = scheduler();
        let policy = Arc::new(ScanPolicy { mode: crate::policy::ScanMode::Full, ..ScanPolicy::default() });
        let t1 = ScanTask::new(
            ScanGroupId::new(),
            ScanTarget::Directory(DirectorySpec { root: "/tmp".into() }),
            Priority::Background,
            policy.clone(),
            CancelToken::new(),
        );
        sched.submit(t1).unwrap();

        let t2 = ScanTask::new(
            ScanGroupId::new(),
            ScanTarget::Directory(DirectorySpec { root: "/tmp".into() }),
            Priority::Background,
            policy,
            CancelToken::new(),
        );
        let err = sched.submit(t2).unwrap_err();
        assert!(matches!(err, ScanError::Busy));
    }

    #[test]
    fn cancel_group_marks_token_cancelled() {
        let sched = scheduler();
        let group = ScanGroupId::new();
        let token = CancelToken::new();
        let policy = Arc::new(ScanPolicy::default());
        let task = ScanTask::new(
            group.clone(),
            ScanTarget::Directory(DirectorySpec { root: "/tmp".into() }),
            Priority::Background,
            policy,
            token.clone(),
        );
        sched.submit(task).unwrap();
        sched.cancel_group(&group);
        assert!(token.is_cancelled());
    }
}
