//! Event/Report Bus (C9): a bounded, multi-producer multi-consumer channel
//! delivering structured scan and monitor events, with a selective-drop
//! backpressure policy (spec §3 event kinds, §4.9).

use crate::identity::FileIdentity;
use crate::result::CompositeVerdict;
use crate::task::ScanGroupId;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    ScanStarted { group: String },
    Progress { group: String, scanned: u64, total_estimate: Option<u64>, dropped: u64 },
    FileScanned { group: String, path: String, dropped: u64 },
    Detection { group: String, path: String, verdict: CompositeVerdict },
    ScanCompleted { group: String, duration_ms: u64 },
    Error { group: Option<String>, kind: String, message: String },
    MonitorDegraded { reason: String },
    SessionEstablished { scope: Vec<String> },
    QuarantineChanged { record_id: String },
}

impl Event {
    fn kind_name(&self) -> &'static str {
        match self {
            Event::ScanStarted { .. } => "ScanStarted",
            Event::Progress { .. } => "Progress",
            Event::FileScanned { .. } => "FileScanned",
            Event::Detection { .. } => "Detection",
            Event::ScanCompleted { .. } => "ScanCompleted",
            Event::Error { .. } => "Error",
            Event::MonitorDegraded { .. } => "MonitorDegraded",
            Event::SessionEstablished { .. } => "SessionEstablished",
            Event::QuarantineChanged { .. } => "QuarantineChanged",
        }
    }

    fn with_dropped(self, dropped: u64) -> Self {
        match self {
            Event::Progress { group, scanned, total_estimate, dropped: _ } => {
                Event::Progress { group, scanned, total_estimate, dropped }
            }
            Event::FileScanned { group, path, dropped: _ } => Event::FileScanned { group, path, dropped },
            other => other,
        }
    }
}

/// Never dropped: the bus retries these by blocking briefly rather than
/// discarding (spec §3: "never `Detection`/`ScanCompleted`/`Error`").
fn is_droppable(event: &Event) -> bool {
    matches!(event, Event::Progress { .. } | Event::FileScanned { .. })
}

pub struct EventBus {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    dropped_counts: Mutex<HashMap<&'static str, AtomicU64>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, dropped_counts: Mutex::new(HashMap::new()) }
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        self.rx.clone()
    }

    /// Publishes `event`. On a full buffer, `Progress` is dropped first,
    /// then `FileScanned`; `Detection`/`ScanCompleted`/`Error` always
    /// eventually get in (blocking `send` as a last resort), per the
    /// ordering in spec §3.
    pub fn publish(&self, event: Event) {
        if is_droppable(&event) {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped_event)) => {
                    let kind = dropped_event.kind_name();
                    let count = {
                        let mut map = self.dropped_counts.lock().unwrap();
                        let counter = map.entry(kind).or_insert_with(|| AtomicU64::new(0));
                        counter.fetch_add(1, Ordering::SeqCst) + 1
                    };
                    warn!(kind, count, "event bus full, dropping droppable event");
                    let _ = count;
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
            return;
        }

        // Fold any pending dropped count into this same-kind event before
        // send so consumers see how many prior events of this kind they
        // missed (spec §3 "dropped counts surfaced in the next event").
        let kind = event.kind_name();
        let dropped = self
            .dropped_counts
            .lock()
            .unwrap()
            .get(kind)
            .map(|c| c.swap(0, Ordering::SeqCst))
            .unwrap_or(0);
        let event = event.with_dropped(dropped);
        if self.tx.send(event).is_err() {
            warn!(kind, "event bus disconnected, dropping non-droppable event");
        }
    }

    pub fn scan_started(&self, group: &ScanGroupId) {
        self.publish(Event::ScanStarted { group: group.to_string() });
    }

    pub fn file_scanned(&self, group: &ScanGroupId, identity: &FileIdentity) {
        self.publish(Event::FileScanned {
            group: group.to_string(),
            path: identity.to_report_path(),
            dropped: 0,
        });
    }

    pub fn detection(&self, group: &ScanGroupId, identity: &FileIdentity, verdict: CompositeVerdict) {
        self.publish(Event::Detection { group: group.to_string(), path: identity.to_report_path(), verdict });
    }

    pub fn scan_completed(&self, group: &ScanGroupId, duration_ms: u64) {
        self.publish(Event::ScanCompleted { group: group.to_string(), duration_ms });
    }

    pub fn progress(&self, group: &ScanGroupId, scanned: u64, total_estimate: Option<u64>) {
        self.publish(Event::Progress { group: group.to_string(), scanned, total_estimate, dropped: 0 });
    }

    pub fn error(&self, group: Option<&ScanGroupId>, kind: &str, message: impl Into<String>) {
        self.publish(Event::Error { group: group.map(|g| g.to_string()), kind: kind.to_string(), message: message.into() });
    }

    pub fn monitor_degraded(&self, reason: impl Into<String>) {
        self.publish(Event::MonitorDegraded { reason: reason.into() });
    }

    pub fn session_established(&self, scope: &[&str]) {
        self.publish(Event::SessionEstablished { scope: scope.iter().map(|s| s.to_string()).collect() });
    }

    pub fn quarantine_changed(&self, record_id: &str) {
        self.publish(Event::QuarantineChanged { record_id: record_id.to_string() });
    }
}
