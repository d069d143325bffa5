//! Privileged Session Manager (C8): single-prompt elevation for the
//! rootkit, quarantine, and definitions-update adapters (spec §4.8).

use crate::error::ScanError;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationScope {
    RootkitScan,
    Quarantine,
    UpdateDefinitions,
}

/// Scope requested by the definitions updater and the quarantine store.
/// The two are requested together so running one right after the other
/// reuses the same session instead of prompting twice: a session's scope
/// only grows on re-acquisition, so the first of the pair to run decides
/// what the other needs to already be covered.
pub fn quarantine_and_update_scope() -> HashSet<OperationScope> {
    [OperationScope::Quarantine, OperationScope::UpdateDefinitions].into_iter().collect()
}

/// Opaque credentials handle passed to the privileged closure. The secret
/// is zeroized on drop and is never `Serialize`d (spec §4.8: "never
/// written to disk").
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionCredentials {
    secret: String,
}

impl SessionCredentials {
    /// Exposes the token only for handing to the privileged helper's
    /// protocol; never logged.
    pub fn token(&self) -> &str {
        &self.secret
    }
}

struct AuthSession {
    scope: HashSet<OperationScope>,
    established_at: Instant,
    ttl: Duration,
    revoked: bool,
    credentials: std::sync::Arc<SessionCredentials>,
}

impl AuthSession {
    fn is_valid(&self) -> bool {
        !self.revoked && self.established_at.elapsed() < self.ttl
    }

    fn covers(&self, scope: &HashSet<OperationScope>) -> bool {
        self.is_valid() && scope.is_subset(&self.scope)
    }
}

enum State {
    Idle,
    Acquiring,
    Ready(AuthSession),
}

struct Inner {
    state: State,
}

pub struct SessionManagerConfig {
    pub ttl: Duration,
    pub auth_timeout: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(5 * 60), auth_timeout: Duration::from_secs(60) }
    }
}

/// The elevation helper handshake: given the requested scope, interactively
/// authenticate and return `Ok(())` on success. Real implementations drive
/// an external helper process over piped stdio (spec §4.8's "line-oriented
/// on a private channel"); tests substitute a stub closure.
pub type ElevationFn = dyn Fn(&HashSet<OperationScope>) -> Result<(), ScanError> + Send + Sync;

/// Singleton guarded by one mutex (spec §5 shared-resource policy);
/// coalesces concurrent `with_session` callers onto a single in-flight
/// acquisition via `Condvar`, mirroring the cache's per-key wait-handle
/// design (C3).
pub struct SessionManager {
    config: SessionManagerConfig,
    inner: Mutex<Inner>,
    cond: Condvar,
    elevate: Box<ElevationFn>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig, elevate: Box<ElevationFn>) -> Self {
        Self { config, inner: Mutex::new(Inner { state: State::Idle }), cond: Condvar::new(), elevate }
    }

    /// Acquires (or reuses) a session covering `scope`, runs `f` with
    /// credentials, and returns. At most one authentication prompt is
    /// outstanding at a time across concurrent callers (spec §4.8).
    pub fn with_session<F, T>(&self, scope: HashSet<OperationScope>, f: F) -> Result<T, ScanError>
    where
        F: FnOnce(&SessionCredentials) -> Result<T, ScanError>,
    {
        let credentials = self.acquire(scope)?;
        f(&credentials)
    }

    fn acquire(&self, scope: HashSet<OperationScope>) -> Result<std::sync::Arc<SessionCredentials>, ScanError> {
        let deadline = Instant::now() + self.config.auth_timeout;
        let mut guard = self.inner.lock();
        loop {
            match &guard.state {
                State::Ready(session) if session.covers(&scope) => {
                    return Ok(session.credentials.clone());
                }
                State::Ready(session) if !session.is_valid() => {
                    guard.state = State::Idle;
                    continue;
                }
                State::Acquiring => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ScanError::AuthTimeout(self.config.auth_timeout.as_secs()));
                    }
                    let timed_out = self.cond.wait_for(&mut guard, remaining).timed_out();
                    if timed_out {
                        return Err(ScanError::AuthTimeout(self.config.auth_timeout.as_secs()));
                    }
                    continue;
                }
                // Idle, or Ready with insufficient scope: this caller drives
                // a fresh acquisition, widened to the union of scopes so a
                // caller requesting a strict superset doesn't re-prompt.
                State::Idle | State::Ready(_) => {
                    let requested = match &guard.state {
                        State::Ready(session) => session.scope.union(&scope).cloned().collect(),
                        _ => scope.clone(),
                    };
                    guard.state = State::Acquiring;
                    drop(guard);

                    let outcome = self.run_handshake(&requested, deadline);

                    guard = self.inner.lock();
                    match outcome {
                        Ok(credentials) => {
                            info!(?requested, "privileged session established");
                            guard.state = State::Ready(AuthSession {
                                scope: requested,
                                established_at: Instant::now(),
                                ttl: self.config.ttl,
                                revoked: false,
                                credentials: credentials.clone(),
                            });
                            self.cond.notify_all();
                            return Ok(credentials);
                        }
                        Err(e) => {
                            warn!(error = %e, "privileged session acquisition failed");
                            guard.state = State::Idle;
                            self.cond.notify_all();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Runs the elevation handshake on a worker thread so a wedged helper
    /// cannot hold the session mutex, enforcing `auth_timeout` (spec §4.8
    /// `Timeout`: "no response within 60s").
    fn run_handshake(
        &self,
        scope: &HashSet<OperationScope>,
        deadline: Instant,
    ) -> Result<std::sync::Arc<SessionCredentials>, ScanError> {
        let (tx, rx) = mpsc::channel();
        let scope_owned = scope.clone();
        let elevate = &self.elevate;
        // SAFETY-free: `elevate` outlives this call since it's borrowed from
        // `self`, and we join (via recv) before returning.
        std::thread::scope(|s| {
            s.spawn(|| {
                let result = elevate(&scope_owned);
                let _ = tx.send(result);
            });
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(Ok(())) => Ok(std::sync::Arc::new(SessionCredentials { secret: Uuid::new_v4().to_string() })),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ScanError::AuthTimeout(self.config.auth_timeout.as_secs())),
            }
        })
    }

    /// Explicit revoke; invalidates the cached session regardless of TTL
    /// (spec §4.8: "revoked ... on explicit user request").
    pub fn revoke(&self) {
        let mut guard = self.inner.lock();
        guard.state = State::Idle;
        self.cond.notify_all();
    }
}
