//! Engine Adapters (C2): a uniform interface over the AV engine, the
//! heuristic rule engine, and the rootkit checker (spec §4.2).

pub mod av;
pub mod heuristic;
pub mod rootkit;

use crate::error::ScanError;
use crate::policy::EngineKind;
use crate::result::EngineResult;
use crate::task::CancelToken;
use std::time::Duration;

/// Every concrete adapter implements this uniform contract. Adapters are
/// `Send + Sync` so the orchestrator can hold them behind `Arc<dyn
/// EngineAdapter>` and dispatch across worker threads (spec §4.2).
pub trait EngineAdapter: Send + Sync {
    fn engine_id(&self) -> EngineKind;

    /// Scan a single file, respecting `timeout` and polling `cancel`
    /// between bounded work units at least every 256 KiB / 100 ms (spec §5).
    fn scan(&self, path: &std::path::Path, timeout: Duration, cancel: &CancelToken) -> EngineResult;

    /// One-time setup (load rulesets, spawn long-lived child processes, ...).
    fn warmup(&self) -> Result<(), ScanError>;

    /// Opaque fingerprint identifying the current definitions/ruleset
    /// version; any change invalidates dependent cache entries (spec §3).
    fn definitions_fingerprint(&self) -> Vec<u8>;

    fn shutdown(&self);
}

/// Work-unit granularity shared by adapters that stream file bytes: poll
/// the cancel token at least this often (spec §5).
pub const CANCEL_POLL_BYTES: usize = 256 * 1024;

/// Exponential backoff schedule for adapter child-process crashes (spec §4.2:
/// base 200 ms, max 5 s, 5 attempts).
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0, max_attempts: 5, base: Duration::from_millis(200), cap: Duration::from_secs(5) }
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Returns the delay for the next attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32 << self.attempt.min(8);
        let delay = self.base.saturating_mul(factor);
        self.attempt += 1;
        delay.min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_five_seconds_after_five_attempts() {
        let mut b = Backoff::new();
        let mut delays = Vec::new();
        while !b.exhausted() {
            delays.push(b.next_delay());
        }
        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0], Duration::from_millis(200));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(5)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(5).min(Duration::from_millis(200) * 16));
    }
}
