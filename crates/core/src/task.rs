//! Scan tasks, cancellation tokens, and scan groups (spec §3 `ScanTask`,
//! §4.4 cancellation and scan-group semantics).

use crate::identity::FileIdentity;
use crate::policy::{Priority, ScanPolicy};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum ScanTarget {
    File(FileIdentity),
    Directory(DirectorySpec),
}

#[derive(Debug, Clone)]
pub struct DirectorySpec {
    pub root: PathBuf,
}

/// Cooperative cancellation handle. Cloning shares the same underlying
/// flag; every engine adapter polls this between bounded work units
/// (spec §5: at minimum every 256 KiB / 100 ms).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Identifies all tasks produced by one user-initiated scan request; shares
/// an id, a cancel token, and a running summary (spec §2 "scan group").
#[derive(Debug, Clone)]
pub struct ScanGroupId(pub Uuid);

impl ScanGroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScanGroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScanGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct ScanTask {
    pub id: Uuid,
    pub group: ScanGroupId,
    pub target: ScanTarget,
    pub priority: Priority,
    pub policy: Arc<ScanPolicy>,
    pub cancel_token: CancelToken,
    pub created_at: Instant,
}

impl ScanTask {
    pub fn new(
        group: ScanGroupId,
        target: ScanTarget,
        priority: Priority,
        policy: Arc<ScanPolicy>,
        cancel_token: CancelToken,
    ) -> Self {
        Self { id: Uuid::new_v4(), group, target, priority, policy, cancel_token, created_at: Instant::now() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_shares_state_across_clones() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }
}
