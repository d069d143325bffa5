//! Hybrid Scan Orchestrator (C5): dispatches the configured engines for one
//! file and composes their results into a single `CompositeVerdict`
//! according to the active `ConsensusPolicy` (spec §4.5).

use crate::engines::EngineAdapter;
use crate::identity::FileIdentity;
use crate::policy::{ConsensusPolicy, EngineKind, ScanPolicy, Severity};
use crate::result::{CompositeVerdict, EngineResult, ScanResult, SkipReason, Verdict};
use crate::task::CancelToken;
use std::sync::Arc;
use std::time::SystemTime;

pub struct Orchestrator {
    av: Option<Arc<dyn EngineAdapter>>,
    heuristic: Option<Arc<dyn EngineAdapter>>,
    rootkit: Option<Arc<dyn EngineAdapter>>,
}

impl Orchestrator {
    pub fn new(
        av: Option<Arc<dyn EngineAdapter>>,
        heuristic: Option<Arc<dyn EngineAdapter>>,
        rootkit: Option<Arc<dyn EngineAdapter>>,
    ) -> Self {
        Self { av, heuristic, rootkit }
    }

    fn adapter_for(&self, kind: EngineKind) -> Option<&Arc<dyn EngineAdapter>> {
        match kind {
            EngineKind::Av => self.av.as_ref(),
            EngineKind::Heuristic => self.heuristic.as_ref(),
            EngineKind::Rootkit => self.rootkit.as_ref(),
        }
    }

    /// Scans one file with every engine named in `policy.engines` that has
    /// a registered adapter, dispatched in parallel via `rayon` (spec §4.5:
    /// engine count is small and bounded, so a scoped join is enough).
    pub fn scan_file(&self, identity: &FileIdentity, policy: &ScanPolicy, cancel: &CancelToken) -> ScanResult {
        let engines: Vec<EngineKind> = policy
            .engines
            .iter()
            .copied()
            .filter(|k| self.adapter_for(*k).is_some())
            .collect();

        use rayon::iter::{IntoParallelIterator, ParallelIterator};
        let per_engine: Vec<EngineResult> = engines
            .into_par_iter()
            .map(|kind| {
                let adapter = self.adapter_for(kind).expect("filtered above");
                adapter.scan(&identity.absolute_path, policy.timeout_per_file, cancel)
            })
            .collect();

        let composite = compose(&per_engine, &policy.consensus, policy.heuristic_suspicious_threshold);
        let cache_key = crate::cache::ScanCache::key_for(
            identity,
            &policy.cache_fingerprint(),
            &self.combined_fingerprint(),
        );

        ScanResult { file: identity.clone(), composite_verdict: composite, per_engine, produced_at: SystemTime::now(), cache_key }
    }

    /// Combined definitions fingerprint across every registered adapter
    /// (spec §3 `CacheEntry.key`'s `definitions_fingerprint` component).
    pub fn combined_fingerprint(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for adapter in [&self.av, &self.heuristic, &self.rootkit].into_iter().flatten() {
            out.extend(adapter.definitions_fingerprint());
        }
        out
    }

    pub fn warmup_all(&self) -> Result<(), crate::error::ScanError> {
        for adapter in [&self.av, &self.heuristic, &self.rootkit].into_iter().flatten() {
            adapter.warmup()?;
        }
        Ok(())
    }
}

/// Pure composition function: derives the single `CompositeVerdict` from
/// per-engine results under `policy` (spec §4.5). No I/O, no locking —
/// this is the function property-tested in `tests/`.
///
/// `heuristic_suspicious_threshold` only gates `AvThenHeuristic`'s upgrade
/// from `Clean` to `Suspicious` (spec §4.5: upgrade only once the heuristic
/// score meets the configured threshold, default 50/100).
pub fn compose(per_engine: &[EngineResult], policy: &ConsensusPolicy, heuristic_suspicious_threshold: u32) -> CompositeVerdict {
    if per_engine.iter().any(|r| matches!(r.verdict, Verdict::Cancelled)) {
        return CompositeVerdict::Cancelled;
    }
    if per_engine.is_empty() {
        return CompositeVerdict::Skipped { reason: SkipReason::EngineDegraded };
    }

    let malicious: Vec<(EngineKind, &str, Severity)> = per_engine
        .iter()
        .filter_map(|r| match &r.verdict {
            Verdict::Malicious { family, severity } => Some((r.engine_id, family.as_str(), *severity)),
            _ => None,
        })
        .collect();

    let av_result = per_engine.iter().find(|r| r.engine_id == EngineKind::Av);
    let heuristic_result = per_engine.iter().find(|r| r.engine_id == EngineKind::Heuristic);

    match policy {
        ConsensusPolicy::AvOnly => match av_result.map(|r| &r.verdict) {
            Some(Verdict::Malicious { family, severity }) => {
                CompositeVerdict::Malicious { family: family.clone(), severity: *severity }
            }
            Some(Verdict::Error { .. }) | None => degraded_or_skipped(per_engine),
            _ => CompositeVerdict::Clean,
        },
        ConsensusPolicy::AvThenHeuristic => {
            if let Some(Verdict::Malicious { family, severity }) = av_result.map(|r| &r.verdict) {
                return CompositeVerdict::Malicious { family: family.clone(), severity: *severity };
            }
            match heuristic_result.map(|r| &r.verdict) {
                Some(Verdict::Suspicious { score, tags }) if *score >= heuristic_suspicious_threshold => {
                    CompositeVerdict::Suspicious { score: *score, tags: tags.clone() }
                }
                _ => fold_clean_or_degraded(per_engine),
            }
        }
        ConsensusPolicy::HybridConsensus => {
            if !malicious.is_empty() {
                let (family, severity) = highest_severity(&malicious);
                return CompositeVerdict::Malicious { family: family.to_string(), severity };
            }
            let suspicious_score: u32 = per_engine
                .iter()
                .filter_map(|r| match &r.verdict {
                    Verdict::Suspicious { score, .. } => Some(*score),
                    _ => None,
                })
                .max()
                .unwrap_or(0);
            if suspicious_score > 0 {
                let tags: Vec<String> = per_engine
                    .iter()
                    .filter_map(|r| match &r.verdict {
                        Verdict::Suspicious { tags, .. } => Some(tags.clone()),
                        _ => None,
                    })
                    .flatten()
                    .collect();
                return CompositeVerdict::Suspicious { score: suspicious_score, tags };
            }
            fold_clean_or_degraded(per_engine)
        }
        ConsensusPolicy::AllEngines => {
            if !malicious.is_empty() {
                // Every engine must agree on Malicious for AllEngines' strict
                // reading; a split verdict downgrades to Suspicious instead
                // of silently picking a winner.
                let all_malicious = per_engine.iter().all(|r| matches!(r.verdict, Verdict::Malicious { .. }));
                if all_malicious {
                    let (family, severity) = highest_severity(&malicious);
                    return CompositeVerdict::Malicious { family: family.to_string(), severity };
                }
                return CompositeVerdict::Suspicious { score: 100, tags: vec!["split-verdict".into()] };
            }
            fold_clean_or_degraded(per_engine)
        }
    }
}

/// Family-naming tie-break (spec §4.5): prefer the AV family unless its
/// severity is lower than the heuristic's, in which case prefer heuristic.
/// When AV didn't report `Malicious` at all (e.g. the rootkit engine is the
/// only/highest-severity reporter under `AllEngines`), fall back to the
/// highest-severity entry, breaking remaining ties by family name so the
/// result stays deterministic regardless of dispatch order.
fn highest_severity<'a>(malicious: &[(EngineKind, &'a str, Severity)]) -> (&'a str, Severity) {
    let av = malicious.iter().find(|(k, _, _)| *k == EngineKind::Av);
    let heuristic = malicious.iter().find(|(k, _, _)| *k == EngineKind::Heuristic);
    if let (Some((_, av_family, av_sev)), Some((_, heur_family, heur_sev))) = (av, heuristic) {
        return if *av_sev < *heur_sev { (heur_family, *heur_sev) } else { (av_family, *av_sev) };
    }
    malicious
        .iter()
        .max_by(|a, b| a.2.cmp(&b.2).then_with(|| a.1.cmp(b.1)))
        .map(|(_, family, severity)| (*family, *severity))
        .expect("non-empty")
}

fn fold_clean_or_degraded(per_engine: &[EngineResult]) -> CompositeVerdict {
    let any_error = per_engine.iter().any(|r| matches!(r.verdict, Verdict::Error { .. }));
    if any_error {
        return degraded_or_skipped(per_engine);
    }
    CompositeVerdict::Clean
}

fn degraded_or_skipped(per_engine: &[EngineResult]) -> CompositeVerdict {
    let reasons: Vec<String> = per_engine
        .iter()
        .filter_map(|r| match &r.verdict {
            Verdict::Error { kind } => Some(format!("{}:{}", r.engine_id.as_str(), kind)),
            _ => None,
        })
        .collect();
    CompositeVerdict::Degraded { reason: reasons.join(",") }
}
