//! Top-level facade: wires the guard, engines, cache, scheduler,
//! orchestrator, monitor, quarantine store, session manager, and event
//! bus into the CLI surface the UI and `sentinel-cli` call (spec §6):
//! `scan`, `cancel`, `subscribe`, `quarantine_list/restore/purge`,
//! `monitor_start/stop`, `update_definitions`.

use crate::bus::EventBus;
use crate::cache::ScanCache;
use crate::config::Config;
use crate::engines::av::{AvAdapter, AvConfig};
use crate::engines::heuristic::HeuristicAdapter;
use crate::engines::rootkit::{RootkitAdapter, RootkitConfig};
use crate::engines::EngineAdapter;
use crate::error::ScanError;
use crate::guard::{Decision, PolicyGuard};
use crate::identity::FileIdentity;
use crate::monitor::{ChangeSink, Monitor, MonitorHandle};
use crate::orchestrator::Orchestrator;
use crate::policy::{EngineKind, Priority, ScanPolicy};
use crate::quarantine::{QuarantineRecord, QuarantineStore};
use crate::report::ScanSummary;
use crate::result::{CompositeVerdict, EngineResult, ScanResult};
use crate::scheduler::{Scheduler, TaskRunner, WorkerBounds};
use crate::session::{OperationScope, SessionManager, SessionManagerConfig};
use crate::task::{CancelToken, ScanGroupId, ScanTarget, ScanTask};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{info, warn};
use uuid::Uuid;

/// Bookkeeping for one in-flight scan group, accumulated by the runner
/// closure as each file task completes and consumed once the scheduler
/// reports the group fully drained (spec §4.9 `ScanCompleted` summary).
struct GroupRun {
    started_at: SystemTime,
    start_instant: Instant,
    policy: Arc<ScanPolicy>,
    results: Vec<ScanResult>,
    scanned: u64,
    cancel_token: CancelToken,
}

pub struct SentinelEngine {
    config: Config,
    guard: Arc<PolicyGuard>,
    cache: Arc<ScanCache>,
    scheduler: Arc<Scheduler>,
    orchestrator: Arc<Orchestrator>,
    rootkit_adapter: Option<Arc<RootkitAdapter>>,
    bus: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    quarantine: Arc<QuarantineStore>,
    monitor: Monitor,
    monitor_handle: Mutex<Option<MonitorHandle>>,
    runs: Arc<Mutex<HashMap<u128, GroupRun>>>,
    summaries: Mutex<HashMap<u128, ScanSummary>>,
}

impl SentinelEngine {
    /// Constructs every component from `config`, warms up the configured
    /// engines, and starts the worker pool. Returned wrapped in `Arc`
    /// since every long-lived thread (workers, resize timer, monitor
    /// coalescer) needs to outlive the call that created it.
    pub fn new(config: Config) -> Result<Arc<Self>, ScanError> {
        let guard = Arc::new(PolicyGuard::new(None, &PolicyGuard::default_denylist())?);

        let helper_path = config.session.elevation_helper_path.clone();
        let elevate: Box<crate::session::ElevationFn> = Box::new(move |scope| {
            let scope_arg = scope_to_arg(scope);
            let status = std::process::Command::new(&helper_path)
                .arg(scope_arg)
                .status()
                .map_err(|e| ScanError::AuthFailed(format!("failed to spawn elevation helper: {e}")))?;
            if status.success() {
                Ok(())
            } else {
                Err(ScanError::AuthFailed(format!("elevation helper exited with {status}")))
            }
        });
        let sessions = Arc::new(SessionManager::new(
            SessionManagerConfig {
                ttl: Duration::from_secs(config.session.ttl_seconds),
                auth_timeout: Duration::from_secs(config.session.auth_timeout_seconds),
            },
            elevate,
        ));

        let cache = Arc::new(ScanCache::new(config.cache.ttl, config.cache.byte_budget_bytes));
        let quarantine = Arc::new(QuarantineStore::new(config.quarantine.root.clone(), sessions.clone()));

        let av: Option<Arc<dyn EngineAdapter>> = config.engines.enabled.contains(&EngineKind::Av).then(|| {
            Arc::new(AvAdapter::new(AvConfig { binary_path: config.engines.av_binary_path.clone(), ..AvConfig::default() }))
                as Arc<dyn EngineAdapter>
        });
        let heuristic: Option<Arc<dyn EngineAdapter>> =
            config.engines.enabled.contains(&EngineKind::Heuristic).then(|| Arc::new(HeuristicAdapter::new()) as Arc<dyn EngineAdapter>);
        let rootkit_adapter = config.engines.enabled.contains(&EngineKind::Rootkit).then(|| {
            Arc::new(RootkitAdapter::new(
                RootkitConfig { binary_path: config.engines.rootkit_binary_path.clone() },
                sessions.clone(),
            ))
        });
        let rootkit: Option<Arc<dyn EngineAdapter>> =
            rootkit_adapter.clone().map(|r| r as Arc<dyn EngineAdapter>);

        let orchestrator = Arc::new(Orchestrator::new(av, heuristic, rootkit));
        orchestrator.warmup_all()?;

        let bounds = WorkerBounds { min: config.workers.min_workers, max: config.workers.max_workers };
        let scheduler = Scheduler::new(guard.clone(), bounds);

        let bus = Arc::new(EventBus::new(crate::bus::DEFAULT_CAPACITY));
        let monitor_excluded_roots = vec![config.quarantine.root.clone(), config.cache.journal_path.clone()];
        let monitor = Monitor::new(guard.clone(), Arc::new(ScanPolicy::default()), monitor_excluded_roots);

        let engine = Arc::new(Self {
            config,
            guard,
            cache,
            scheduler,
            orchestrator,
            rootkit_adapter,
            bus,
            sessions,
            quarantine,
            monitor,
            monitor_handle: Mutex::new(None),
            runs: Arc::new(Mutex::new(HashMap::new())),
            summaries: Mutex::new(HashMap::new()),
        });
        engine.start_workers();
        Ok(engine)
    }

    fn start_workers(self: &Arc<Self>) {
        let guard = self.guard.clone();
        let cache = self.cache.clone();
        let orchestrator = self.orchestrator.clone();
        let bus = self.bus.clone();
        let runs = self.runs.clone();

        let runner: Arc<TaskRunner> = Arc::new(move |task: ScanTask| {
            let identity = match &task.target {
                ScanTarget::File(identity) => identity.clone(),
                ScanTarget::Directory(_) => return,
            };

            let result = match guard.check_resource_budget(&task, identity.size) {
                Decision::Skip(reason) => ScanResult {
                    file: identity.clone(),
                    composite_verdict: CompositeVerdict::Skipped { reason },
                    per_engine: vec![],
                    produced_at: SystemTime::now(),
                    cache_key: String::new(),
                },
                Decision::Proceed => {
                    let fingerprint = orchestrator.combined_fingerprint();
                    let cache_key = ScanCache::key_for(&identity, &task.policy.cache_fingerprint(), &fingerprint);
                    if task.policy.use_cache {
                        cache.get_or_compute(&cache_key, &identity, &fingerprint, || {
                            orchestrator.scan_file(&identity, &task.policy, &task.cancel_token)
                        })
                    } else {
                        orchestrator.scan_file(&identity, &task.policy, &task.cancel_token)
                    }
                }
            };

            if matches!(result.composite_verdict, CompositeVerdict::Malicious { .. } | CompositeVerdict::Suspicious { .. }) {
                bus.detection(&task.group, &identity, result.composite_verdict.clone());
            }
            bus.file_scanned(&task.group, &identity);

            let scanned = {
                let mut runs_guard = runs.lock();
                runs_guard.get_mut(&task.group.0.as_u128()).map(|run| {
                    run.scanned += 1;
                    run.results.push(result);
                    run.scanned
                })
            };
            if let Some(scanned) = scanned {
                bus.progress(&task.group, scanned, None);
            }
        });

        let bus_drain = self.bus.clone();
        let runs_drain = self.runs.clone();
        let summaries_drain_engine = self.clone();
        self.scheduler.set_on_drained(Arc::new(move |group: ScanGroupId| {
            let run = runs_drain.lock().remove(&group.0.as_u128());
            let Some(run) = run else { return };
            let duration = run.start_instant.elapsed();
            let cancelled = run.cancel_token.is_cancelled();
            let summary = ScanSummary::from_results(&group, &run.policy, run.started_at, duration, &run.results, cancelled);
            bus_drain.scan_completed(&group, duration.as_millis() as u64);
            summaries_drain_engine.summaries.lock().insert(group.0.as_u128(), summary);
        }));

        self.scheduler.run(runner);
    }

    /// Submits `path` (file or directory) as a new `Interactive`-priority
    /// scan group and returns its id immediately; results stream over
    /// `subscribe()` and the final summary is retrievable via
    /// `scan_summary` (spec §6 `scan(target, policy) -> scan_group_id`).
    pub fn scan(self: &Arc<Self>, path: PathBuf, policy: ScanPolicy) -> Result<ScanGroupId, ScanError> {
        self.submit_scan(path, policy, Priority::Interactive)
    }

    fn submit_scan(self: &Arc<Self>, path: PathBuf, policy: ScanPolicy, priority: Priority) -> Result<ScanGroupId, ScanError> {
        let policy = Arc::new(policy);
        let identity = self.guard.canonicalize(&path, policy.follow_symlinks)?;
        let is_dir = std::fs::metadata(&identity.absolute_path).map(|m| m.is_dir()).unwrap_or(false);
        let full_directory_scan = is_dir && policy.mode == crate::policy::ScanMode::Full;

        let group = ScanGroupId::new();
        let cancel_token = CancelToken::new();
        self.runs.lock().insert(
            group.0.as_u128(),
            GroupRun {
                started_at: SystemTime::now(),
                start_instant: Instant::now(),
                policy: policy.clone(),
                results: Vec::new(),
                scanned: 0,
                cancel_token: cancel_token.clone(),
            },
        );

        let target = if is_dir {
            ScanTarget::Directory(crate::task::DirectorySpec { root: identity.absolute_path.clone() })
        } else {
            ScanTarget::File(identity)
        };
        let task = ScanTask::new(group.clone(), target, priority, policy, cancel_token);
        self.scheduler.submit(task)?;
        self.bus.scan_started(&group);

        if full_directory_scan {
            self.spawn_rootkit_check(group.clone());
        }

        Ok(group)
    }

    /// Rootkit checks only operate at directory/system granularity (spec
    /// §4.2), so a `Full`-mode directory scan triggers one alongside the
    /// per-file dispatch rather than through the per-file engine path.
    fn spawn_rootkit_check(self: &Arc<Self>, group: ScanGroupId) {
        let Some(rootkit) = self.rootkit_adapter.clone() else { return };
        let bus = self.bus.clone();
        std::thread::spawn(move || {
            let result = rootkit.check_system(Duration::from_secs(120), &CancelToken::new());
            if let EngineResult { verdict: crate::result::Verdict::Malicious { ref family, severity }, .. } = result {
                bus.publish(crate::bus::Event::Detection {
                    group: group.to_string(),
                    path: "<system>".to_string(),
                    verdict: CompositeVerdict::Malicious { family: family.clone(), severity },
                });
            }
        });
    }

    /// Cancels every queued and in-flight task belonging to `group` (spec
    /// §6 `cancel(scan_group_id)`).
    pub fn cancel(&self, group: &ScanGroupId) {
        self.scheduler.cancel_group(group);
    }

    /// Subscribes to the structured event stream (spec §6 `subscribe()`).
    pub fn subscribe(&self) -> Receiver<crate::bus::Event> {
        self.bus.subscribe()
    }

    /// Retrieves the persisted summary for a completed scan group, if one
    /// has finished since this process started.
    pub fn scan_summary(&self, group: &ScanGroupId) -> Option<ScanSummary> {
        self.summaries.lock().get(&group.0.as_u128()).cloned()
    }

    pub fn quarantine_list(&self) -> Result<Vec<QuarantineRecord>, ScanError> {
        self.quarantine.list()
    }

    pub fn quarantine_restore(&self, id: Uuid, overwrite: bool) -> Result<(), ScanError> {
        self.quarantine.restore(id, overwrite)?;
        self.bus.quarantine_changed(&id.to_string());
        Ok(())
    }

    pub fn quarantine_purge(&self, id: Uuid) -> Result<(), ScanError> {
        self.quarantine.purge(id)?;
        self.bus.quarantine_changed(&id.to_string());
        Ok(())
    }

    pub fn quarantine_file(&self, path: &Path, family: String) -> Result<QuarantineRecord, ScanError> {
        let record = self.quarantine.quarantine(path, family)?;
        self.bus.quarantine_changed(&record.id.to_string());
        Ok(record)
    }

    /// Starts the real-time monitor over `config.monitor.watched_roots`,
    /// dispatching each coalesced batch of changed paths as `Realtime`
    /// priority file tasks (spec §6 `monitor_start()`).
    pub fn monitor_start(self: &Arc<Self>) -> Result<(), ScanError> {
        let mut handle_guard = self.monitor_handle.lock();
        if handle_guard.is_some() {
            return Ok(());
        }
        if !self.config.monitor.enabled || self.config.monitor.watched_roots.is_empty() {
            return Err(ScanError::PathInvalid("monitor has no watched_roots configured".into()));
        }

        let guard = self.guard.clone();
        let scheduler = self.scheduler.clone();
        let runs = self.runs.clone();
        let bus = self.bus.clone();
        let policy = Arc::new(ScanPolicy::default());
        let excluded_roots = self.monitor.excluded_roots().to_vec();

        let sink: Arc<ChangeSink> = Arc::new(move |paths: Vec<PathBuf>| {
            let group = ScanGroupId::new();
            let cancel_token = CancelToken::new();
            runs.lock().insert(
                group.0.as_u128(),
                GroupRun {
                    started_at: SystemTime::now(),
                    start_instant: Instant::now(),
                    policy: policy.clone(),
                    results: Vec::new(),
                    scanned: 0,
                    cancel_token: cancel_token.clone(),
                },
            );
            bus.scan_started(&group);
            for path in paths {
                if !guard.is_allowed(&path, &policy) || crate::monitor::is_excluded(&path, &excluded_roots) {
                    continue;
                }
                let Ok(identity) = FileIdentity::stat(&path) else { continue };
                let task = ScanTask::new(
                    group.clone(),
                    ScanTarget::File(identity),
                    Priority::Realtime,
                    policy.clone(),
                    cancel_token.clone(),
                );
                if let Err(e) = scheduler.submit(task) {
                    warn!(error = %e, "monitor failed to submit realtime scan task");
                }
            }
        });

        let handle = self.monitor.start(self.config.monitor.watched_roots.clone(), sink);
        *handle_guard = Some(handle);
        info!("real-time monitor started");
        Ok(())
    }

    pub fn monitor_stop(&self) {
        if let Some(handle) = self.monitor_handle.lock().take() {
            handle.stop();
            info!("real-time monitor stopped");
        }
    }

    /// Runs the external definitions updater under an `UpdateDefinitions`
    /// session, then re-warms every engine and lazily invalidates cache
    /// entries keyed on the old definitions fingerprint (spec §6
    /// `update_definitions()`, §4.3 engine-upgrade policy).
    pub fn update_definitions(&self) -> Result<(), ScanError> {
        let updater_path = self.config.engines.definitions_updater_path.clone();
        self.sessions.with_session(crate::session::quarantine_and_update_scope(), move |_creds| {
            let status = std::process::Command::new(&updater_path)
                .status()
                .map_err(|e| ScanError::EngineUnavailable { engine: "definitions-updater".into(), reason: e.to_string() })?;
            if !status.success() {
                return Err(ScanError::EngineUnavailable {
                    engine: "definitions-updater".into(),
                    reason: format!("exited with {status}"),
                });
            }
            Ok(())
        })?;

        self.orchestrator.warmup_all()?;
        let fingerprint = self.orchestrator.combined_fingerprint();
        self.cache.invalidate_stale_definitions(&fingerprint);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.monitor_stop();
        self.scheduler.shutdown();
    }
}

fn scope_to_arg(scope: &std::collections::HashSet<OperationScope>) -> String {
    let mut names: Vec<&str> = scope
        .iter()
        .map(|s| match s {
            OperationScope::RootkitScan => "rootkit-scan",
            OperationScope::Quarantine => "quarantine",
            OperationScope::UpdateDefinitions => "update-definitions",
        })
        .collect();
    names.sort_unstable();
    names.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.engines.enabled = [EngineKind::Heuristic].into_iter().collect();
        config.quarantine.root = root.join("quarantine");
        config.cache.journal_path = root.join("cache.journal");
        config.session.elevation_helper_path = PathBuf::from("/bin/true");
        config.workers = crate::config::WorkersConfig { min_workers: 1, max_workers: 2 };
        config
    }

    #[test]
    fn scan_single_clean_file_completes_and_publishes_events() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clean.txt");
        std::fs::write(&file, b"hello world").unwrap();

        let engine = SentinelEngine::new(test_config(dir.path())).unwrap();
        let rx = engine.subscribe();
        let group = engine.scan(file, ScanPolicy::default()).unwrap();

        let mut saw_completed = false;
        let deadline = Instant::now() + StdDuration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(StdDuration::from_millis(200)) {
                if let crate::bus::Event::ScanCompleted { group: g, .. } = &event {
                    if *g == group.to_string() {
                        saw_completed = true;
                        break;
                    }
                }
            }
        }
        assert!(saw_completed, "expected a ScanCompleted event for the scan group");
        let summary = engine.scan_summary(&group).expect("summary recorded after drain");
        assert_eq!(summary.files_scanned, 1);
        assert_eq!(summary.clean, 1);
    }

    #[test]
    fn scan_detects_eicar_marker_via_heuristic_rule() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("eicar.txt");
        std::fs::write(&file, b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*").unwrap();

        let engine = SentinelEngine::new(test_config(dir.path())).unwrap();
        let rx = engine.subscribe();
        let group = engine.scan(file, ScanPolicy::default()).unwrap();

        let mut saw_detection = false;
        let deadline = Instant::now() + StdDuration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(crate::bus::Event::Detection { group: g, .. }) = rx.recv_timeout(StdDuration::from_millis(200)) {
                if g == group.to_string() {
                    saw_detection = true;
                    break;
                }
            }
        }
        assert!(saw_detection, "expected a Detection event for the eicar marker");
    }

    #[test]
    fn quarantine_round_trip_through_facade() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("evil.exe");
        std::fs::write(&file, b"malware").unwrap();

        let engine = SentinelEngine::new(test_config(dir.path())).unwrap();
        let record = engine.quarantine_file(&file, "Trojan.Test".into()).unwrap();
        assert_eq!(engine.quarantine_list().unwrap().len(), 1);

        engine.quarantine_restore(record.id, false).unwrap();
        assert!(file.exists());
        assert!(engine.quarantine_list().unwrap().is_empty());
    }
}
