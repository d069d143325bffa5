//! Structured error taxonomy (see spec §7).
//!
//! Every error kind here is surfaced both as a value on the event bus
//! (wrapped in `Event::Error`) and as the `Err` variant returned from
//! core entry points. Per-file errors never abort a scan group; only
//! the kinds marked `is_group_fatal` do.

use std::fmt;
use thiserror::Error;

/// A single engine's definitions/ruleset identity fingerprint.
pub type DefinitionsFingerprint = Vec<u8>;

#[derive(Debug, Clone, Error)]
pub enum ScanError {
    #[error("path invalid: {0}")]
    PathInvalid(String),

    #[error("engine unavailable: {engine}: {reason}")]
    EngineUnavailable { engine: String, reason: String },

    #[error("engine {engine} timed out after {elapsed_ms}ms")]
    EngineTimeout { engine: String, elapsed_ms: u64 },

    #[error("engine {engine} crashed: {reason}")]
    EngineCrashed { engine: String, reason: String },

    #[error("scan cancelled")]
    Cancelled,

    #[error("a conflicting full-scope scan is already running")]
    Busy,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("scope denied: requested {requested:?}, session covers {covers:?}")]
    ScopeDenied { requested: String, covers: String },

    #[error("privileged session expired")]
    SessionExpired,

    #[error("privileged helper did not respond within {0}s")]
    AuthTimeout(u64),

    #[error("quarantine integrity check failed for record {record_id}")]
    QuarantineIntegrity { record_id: String },

    #[error("scan cache corrupt: {0}")]
    CacheCorrupt(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ScanError {
    fn from(e: std::io::Error) -> Self {
        ScanError::Io(e.to_string())
    }
}

impl ScanError {
    /// Per-file errors are recorded on the file's result and never terminate
    /// the enclosing scan group (spec §7 propagation policy).
    pub fn is_group_fatal(&self) -> bool {
        matches!(
            self,
            ScanError::ResourceExhausted(_) | ScanError::Busy | ScanError::AuthFailed(_)
        )
    }

    /// Whether this error ends the specific engine invocation but lets the
    /// scan proceed with the remaining configured engines.
    pub fn is_engine_recoverable(&self) -> bool {
        matches!(
            self,
            ScanError::EngineUnavailable { .. }
                | ScanError::EngineTimeout { .. }
                | ScanError::EngineCrashed { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ScanError::PathInvalid(_) => "PathInvalid",
            ScanError::EngineUnavailable { .. } => "EngineUnavailable",
            ScanError::EngineTimeout { .. } => "EngineTimeout",
            ScanError::EngineCrashed { .. } => "EngineCrashed",
            ScanError::Cancelled => "Cancelled",
            ScanError::Busy => "Busy",
            ScanError::AuthFailed(_) => "AuthFailed",
            ScanError::ScopeDenied { .. } => "ScopeDenied",
            ScanError::SessionExpired => "SessionExpired",
            ScanError::AuthTimeout(_) => "Timeout",
            ScanError::QuarantineIntegrity { .. } => "QuarantineIntegrity",
            ScanError::CacheCorrupt(_) => "CacheCorrupt",
            ScanError::ResourceExhausted(_) => "ResourceExhausted",
            ScanError::Io(_) => "Io",
        }
    }
}

pub type ScanOutcome<T> = Result<T, ScanError>;

impl fmt::Display for DefinitionsFingerprintDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Hex-display helper for definitions fingerprints in log lines.
pub struct DefinitionsFingerprintDisplay<'a>(pub &'a [u8]);
