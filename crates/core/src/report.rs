//! Scan group reports: a stable JSON summary produced once a scan group
//! completes (spec §6 persisted state / CLI surface).

use crate::policy::{ScanPolicy, Severity};
use crate::result::{CompositeVerdict, ScanResult};
use crate::task::ScanGroupId;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Stable JSON report produced when a scan group terminates (spec §4.9:
/// `{started_at, ended_at, policy, files_scanned, bytes_scanned,
/// detections, errors, cancelled}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub group: String,
    pub started_at_unix_ms: u64,
    pub ended_at_unix_ms: u64,
    pub duration_ms: u64,
    pub policy: ScanPolicy,
    pub files_scanned: u64,
    pub bytes_scanned: u64,
    pub clean: u64,
    pub suspicious: u64,
    pub malicious: u64,
    pub skipped: u64,
    pub cancelled: bool,
    pub highest_severity: Option<Severity>,
    pub detections: Vec<DetectionSummary>,
    pub errors: Vec<ErrorSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSummary {
    pub path: String,
    pub family: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub path: String,
    pub engine: String,
    pub kind: String,
}

impl ScanSummary {
    pub fn from_results(
        group: &ScanGroupId,
        policy: &ScanPolicy,
        started_at: SystemTime,
        duration: Duration,
        results: &[ScanResult],
        group_cancelled: bool,
    ) -> Self {
        let ended_at = started_at + duration;
        let mut summary = ScanSummary {
            group: group.to_string(),
            started_at_unix_ms: unix_ms(started_at),
            ended_at_unix_ms: unix_ms(ended_at),
            duration_ms: duration.as_millis() as u64,
            policy: policy.clone(),
            files_scanned: results.len() as u64,
            bytes_scanned: results.iter().map(|r| r.per_engine.iter().map(|e| e.scanned_bytes).max().unwrap_or(0)).sum(),
            clean: 0,
            suspicious: 0,
            malicious: 0,
            skipped: 0,
            cancelled: group_cancelled,
            highest_severity: None,
            detections: Vec::new(),
            errors: Vec::new(),
        };

        for result in results {
            match &result.composite_verdict {
                CompositeVerdict::Clean => summary.clean += 1,
                CompositeVerdict::Suspicious { .. } => summary.suspicious += 1,
                CompositeVerdict::Malicious { family, severity } => {
                    summary.malicious += 1;
                    summary.highest_severity = Some(match summary.highest_severity {
                        Some(existing) if existing >= *severity => existing,
                        _ => *severity,
                    });
                    summary.detections.push(DetectionSummary {
                        path: result.file.to_report_path(),
                        family: family.clone(),
                        severity: *severity,
                    });
                }
                CompositeVerdict::Degraded { .. } | CompositeVerdict::Skipped { .. } => summary.skipped += 1,
                CompositeVerdict::Cancelled => {}
            }
            for engine in &result.per_engine {
                if let crate::result::Verdict::Error { kind } = &engine.verdict {
                    summary.errors.push(ErrorSummary {
                        path: result.file.to_report_path(),
                        engine: engine.engine_id.as_str().to_string(),
                        kind: kind.clone(),
                    });
                }
            }
        }

        summary
    }
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(std::time::UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FileIdentity;

    fn result(verdict: CompositeVerdict) -> ScanResult {
        ScanResult {
            file: FileIdentity {
                absolute_path: "/tmp/f".into(),
                device_id: 1,
                inode: 1,
                size: 1,
                mtime_ns: 1,
                content_hash: None,
            },
            composite_verdict: verdict,
            per_engine: vec![],
            produced_at: SystemTime::now(),
            cache_key: "k".into(),
        }
    }

    #[test]
    fn tallies_each_verdict_kind() {
        let group = ScanGroupId::new();
        let policy = crate::policy::ScanPolicy::default();
        let results = vec![
            result(CompositeVerdict::Clean),
            result(CompositeVerdict::Suspicious { score: 60, tags: vec![] }),
            result(CompositeVerdict::Malicious { family: "X".into(), severity: Severity::High }),
            result(CompositeVerdict::Skipped { reason: crate::result::SkipReason::Oversize }),
        ];
        let summary =
            ScanSummary::from_results(&group, &policy, SystemTime::now(), Duration::from_secs(1), &results, false);
        assert_eq!(summary.clean, 1);
        assert_eq!(summary.suspicious, 1);
        assert_eq!(summary.malicious, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.highest_severity, Some(Severity::High));
        assert!(!summary.cancelled);
    }

    #[test]
    fn json_field_names_are_stable() {
        let group = ScanGroupId::new();
        let policy = crate::policy::ScanPolicy::default();
        let summary = ScanSummary::from_results(&group, &policy, SystemTime::now(), Duration::ZERO, &[], false);
        let json = serde_json::to_string(&summary).unwrap();
        for field in [
            "group",
            "started_at_unix_ms",
            "ended_at_unix_ms",
            "policy",
            "files_scanned",
            "bytes_scanned",
            "clean",
            "suspicious",
            "malicious",
            "skipped",
            "cancelled",
            "errors",
        ] {
            assert!(json.contains(field), "missing field {field}");
        }
    }

    #[test]
    fn errors_are_collected_from_per_engine_results() {
        let group = ScanGroupId::new();
        let policy = crate::policy::ScanPolicy::default();
        let mut r = result(CompositeVerdict::Degraded { reason: "engine error".into() });
        r.per_engine.push(crate::result::EngineResult::error(
            crate::policy::EngineKind::Av,
            "spawn_failed",
            Duration::from_millis(5),
        ));
        let summary =
            ScanSummary::from_results(&group, &policy, SystemTime::now(), Duration::from_secs(1), &[r], false);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].engine, "av");
        assert_eq!(summary.errors[0].kind, "spawn_failed");
    }
}
