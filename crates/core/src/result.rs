//! Per-engine and composite scan results (spec §3 `EngineResult`,
//! `ScanResult`).

use crate::identity::FileIdentity;
use crate::policy::{EngineKind, Severity};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Verdict {
    Clean,
    Suspicious { score: u32, tags: Vec<String> },
    Malicious { family: String, severity: Severity },
    Error { kind: String },
    Skipped { reason: SkipReason },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Oversize,
    Timeout,
    Denied,
    Unsupported,
    EngineDegraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResult {
    pub engine_id: EngineKind,
    pub verdict: Verdict,
    #[serde(with = "duration_ns")]
    pub duration: Duration,
    pub scanned_bytes: u64,
}

impl EngineResult {
    pub fn skipped(engine_id: EngineKind, reason: SkipReason) -> Self {
        Self {
            engine_id,
            verdict: Verdict::Skipped { reason },
            duration: Duration::ZERO,
            scanned_bytes: 0,
        }
    }

    pub fn cancelled(engine_id: EngineKind) -> Self {
        Self { engine_id, verdict: Verdict::Cancelled, duration: Duration::ZERO, scanned_bytes: 0 }
    }

    pub fn error(engine_id: EngineKind, kind: impl Into<String>, duration: Duration) -> Self {
        Self { engine_id, verdict: Verdict::Error { kind: kind.into() }, duration, scanned_bytes: 0 }
    }
}

/// The composite outcome, derived deterministically by the orchestrator
/// from `per_engine` and the active `ConsensusPolicy` (spec §3, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompositeVerdict {
    Clean,
    Suspicious { score: u32, tags: Vec<String> },
    Malicious { family: String, severity: Severity },
    Degraded { reason: String },
    Skipped { reason: SkipReason },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub file: FileIdentity,
    pub composite_verdict: CompositeVerdict,
    pub per_engine: Vec<EngineResult>,
    #[serde(with = "systemtime_unix_ms")]
    pub produced_at: SystemTime,
    pub cache_key: String,
}

mod duration_ns {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

mod systemtime_unix_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let ms = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
        s.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(UNIX_EPOCH + Duration::from_millis(ms))
    }
}

impl FileIdentity {
    /// `serde` impl is intentionally omitted from `identity.rs` itself (it
    /// lives here) because `ScanResult` is the only thing that needs to
    /// serialize a `FileIdentity`, and keeping it next to the other
    /// report-shaped `serde` impls keeps `identity.rs` dependency-light.
    pub fn to_report_path(&self) -> String {
        self.absolute_path.display().to_string()
    }
}

// Manual Serialize/Deserialize for FileIdentity so PathBuf + content_hash
// round-trip as plain JSON (no newtypes leaking into the report format).
impl Serialize for FileIdentity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("FileIdentity", 6)?;
        s.serialize_field("absolute_path", &self.absolute_path)?;
        s.serialize_field("device_id", &self.device_id)?;
        s.serialize_field("inode", &self.inode)?;
        s.serialize_field("size", &self.size)?;
        s.serialize_field("mtime_ns", &self.mtime_ns.to_string())?;
        s.serialize_field(
            "content_hash",
            &self.content_hash.map(|h| crate::identity::hex(&h)),
        )?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for FileIdentity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            absolute_path: std::path::PathBuf,
            device_id: u64,
            inode: u64,
            size: u64,
            mtime_ns: String,
            content_hash: Option<String>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let mtime_ns = raw.mtime_ns.parse().map_err(serde::de::Error::custom)?;
        let content_hash = raw
            .content_hash
            .map(|h| {
                let bytes = (0..h.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&h[i..i + 2], 16))
                    .collect::<Result<Vec<u8>, _>>()
                    .map_err(serde::de::Error::custom)?;
                bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("content_hash must be 32 bytes"))
            })
            .transpose()?;
        Ok(FileIdentity {
            absolute_path: raw.absolute_path,
            device_id: raw.device_id,
            inode: raw.inode,
            size: raw.size,
            mtime_ns,
            content_hash,
        })
    }
}
