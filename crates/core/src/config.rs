//! Typed configuration (spec §6). The core never reads a config file
//! itself — that's the CLI's job via `toml` — but it owns the typed
//! shape every other component is constructed from.

use crate::policy::{ConsensusPolicy, EngineKind, ScanMode, ScanPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_file_size_bytes: u64,
    pub archive_recursion_depth: u32,
    pub follow_symlinks: bool,
    #[serde(with = "millis")]
    pub timeout_per_file: Duration,
    pub heuristic_suspicious_threshold: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 100 * 1024 * 1024,
            archive_recursion_depth: 4,
            follow_symlinks: false,
            timeout_per_file: Duration::from_secs(30),
            heuristic_suspicious_threshold: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "millis")]
    pub ttl: Duration,
    /// Total cache size budget in bytes, shared (roughly evenly) across
    /// shards; eviction is LRU within each shard once its share fills.
    pub byte_budget_bytes: u64,
    pub journal_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            byte_budget_bytes: 64 * 1024 * 1024,
            journal_path: PathBuf::from("/var/lib/sentinel/cache.journal"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub min_workers: usize,
    pub max_workers: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let bounds = crate::scheduler::WorkerBounds::from_logical_cpus(num_cpus_fallback());
        Self { min_workers: bounds.min, max_workers: bounds.max }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub watched_roots: Vec<PathBuf>,
    pub enabled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { watched_roots: Vec::new(), enabled: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_seconds: u64,
    pub auth_timeout_seconds: u64,
    pub elevation_helper_path: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 5 * 60,
            auth_timeout_seconds: 60,
            elevation_helper_path: PathBuf::from("/usr/libexec/sentinel-elevate"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    pub root: PathBuf,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self { root: PathBuf::from("/var/lib/sentinel/quarantine") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesConfig {
    pub enabled: HashSet<EngineKind>,
    pub av_binary_path: String,
    pub rootkit_binary_path: String,
    /// Separate updater binary invoked under `UpdateDefinitions` scope
    /// (spec §4: "definitions retrievable by a separate updater binary").
    pub definitions_updater_path: String,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            enabled: [EngineKind::Av, EngineKind::Heuristic].into_iter().collect(),
            av_binary_path: "clamscan".to_string(),
            rootkit_binary_path: "rkhunter".to_string(),
            definitions_updater_path: "freshclam".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub scan: ScanConfig,
    pub cache: CacheConfig,
    pub workers: WorkersConfig,
    pub monitor: MonitorConfig,
    pub session: SessionConfig,
    pub quarantine: QuarantineConfig,
    pub consensus_policy: ConsensusPolicy,
    pub engines: EnginesConfig,
}

impl Config {
    /// Parses TOML text into a `Config`, matching the teacher's
    /// `parse_repos_toml` pattern (load by the caller, never by the core).
    pub fn from_toml_str(text: &str) -> Result<Self, crate::error::ScanError> {
        toml::from_str(text).map_err(|e| crate::error::ScanError::Io(format!("invalid config: {e}")))
    }

    /// Maps the typed config into the `ScanPolicy` issued for interactive
    /// scans, so `scan.*`, `consensus_policy`, and `engines.enabled` in a
    /// loaded TOML file actually govern a scan rather than being parsed and
    /// then ignored.
    pub fn scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            engines: self.engines.enabled.clone(),
            mode: ScanMode::Quick,
            follow_symlinks: self.scan.follow_symlinks,
            max_file_size: self.scan.max_file_size_bytes,
            archive_recursion_depth: self.scan.archive_recursion_depth,
            timeout_per_file: self.scan.timeout_per_file,
            use_cache: true,
            consensus: self.consensus_policy,
            heuristic_suspicious_threshold: self.scan.heuristic_suspicious_threshold,
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

mod millis {
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
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = Config::from_toml_str(&text).unwrap();
        assert_eq!(parsed.scan.max_file_size_bytes, config.scan.max_file_size_bytes);
        assert_eq!(parsed.workers.min_workers, config.workers.min_workers);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let parsed = Config::from_toml_str("[scan]\nmax_file_size_bytes = 1024\n").unwrap();
        assert_eq!(parsed.scan.max_file_size_bytes, 1024);
        assert_eq!(parsed.workers.min_workers, WorkersConfig::default().min_workers);
    }

    #[test]
    fn scan_policy_reflects_parsed_scan_settings() {
        let parsed =
            Config::from_toml_str("[scan]\nmax_file_size_bytes = 2048\nheuristic_suspicious_threshold = 75\n")
                .unwrap();
        let policy = parsed.scan_policy();
        assert_eq!(policy.max_file_size, 2048);
        assert_eq!(policy.heuristic_suspicious_threshold, 75);
    }

    #[test]
    fn scan_policy_honors_consensus_policy_override() {
        let mut config = Config::default();
        config.consensus_policy = ConsensusPolicy::AvOnly;
        assert_eq!(config.scan_policy().consensus, ConsensusPolicy::AvOnly);
    }
}
