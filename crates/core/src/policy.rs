//! Policy types shared across the guard, scheduler, and orchestrator
//! (spec §3 `ScanPolicy`, §4.1 `RiskClass`, §4.5 `ConsensusPolicy`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    Av,
    Heuristic,
    Rootkit,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Av => "av",
            EngineKind::Heuristic => "heuristic",
            EngineKind::Rootkit => "rootkit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    Quick,
    Full,
    Custom,
}

/// Dispatch priority, highest first. Derived `Ord` ranks variants in
/// declaration order, so `Interactive < Scheduled < ...` would be wrong —
/// the scheduler's `BinaryHeap` wraps this with an explicit `band()` so
/// declaration order never silently governs priority (see `task.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Interactive,
    Scheduled,
    Background,
    Realtime,
}

impl Priority {
    /// Lower band number dispatches first. `Interactive` and `Realtime` are
    /// both latency-sensitive; `Interactive` (user is waiting synchronously)
    /// outranks `Realtime` (monitor-driven, no human in the loop waiting).
    pub fn band(self) -> u8 {
        match self {
            Priority::Interactive => 0,
            Priority::Realtime => 1,
            Priority::Scheduled => 2,
            Priority::Background => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusPolicy {
    AvOnly,
    AvThenHeuristic,
    HybridConsensus,
    AllEngines,
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        ConsensusPolicy::HybridConsensus
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskClass {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPolicy {
    pub engines: HashSet<EngineKind>,
    pub mode: ScanMode,
    pub follow_symlinks: bool,
    pub max_file_size: u64,
    pub archive_recursion_depth: u32,
    #[serde(with = "duration_ms")]
    pub timeout_per_file: Duration,
    pub use_cache: bool,
    pub consensus: ConsensusPolicy,
    pub heuristic_suspicious_threshold: u32,
}

impl ScanPolicy {
    /// Stable fingerprint of the cache-relevant policy fields (spec §3
    /// `CacheEntry.key`): two policies that would score the same file
    /// identically share this fingerprint.
    pub fn cache_fingerprint(&self) -> String {
        format!("{:?}-{}", self.mode, self.heuristic_suspicious_threshold)
    }
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            engines: [EngineKind::Av, EngineKind::Heuristic].into_iter().collect(),
            mode: ScanMode::Quick,
            follow_symlinks: false,
            max_file_size: 100 * 1024 * 1024,
            archive_recursion_depth: 4,
            timeout_per_file: Duration::from_secs(30),
            use_cache: true,
            consensus: ConsensusPolicy::default(),
            heuristic_suspicious_threshold: 50,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interactive_outranks_realtime_outranks_scheduled() {
        assert!(Priority::Interactive.band() < Priority::Realtime.band());
        assert!(Priority::Realtime.band() < Priority::Scheduled.band());
        assert!(Priority::Scheduled.band() < Priority::Background.band());
    }
}
