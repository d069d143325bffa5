//! Path & Policy Guard (C1): canonicalization, allow/deny enforcement,
//! risk classification, and resource budgeting (spec §4.1).

use crate::error::ScanError;
use crate::identity::FileIdentity;
use crate::policy::{RiskClass, ScanPolicy};
use crate::task::ScanTask;
use ignore::overrides::{Override, OverrideBuilder};
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Decision returned by `check_resource_budget` (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Skip(crate::result::SkipReason),
}

pub struct PolicyGuard {
    /// When set, `canonicalize` rejects any path resolving outside this root.
    scope_root: Option<PathBuf>,
    deny: Override,
    allow_hidden: bool,
}

impl PolicyGuard {
    pub fn new(scope_root: Option<PathBuf>, deny_globs: &[String]) -> Result<Self, ScanError> {
        let base = scope_root.clone().unwrap_or_else(|| PathBuf::from("/"));
        let mut builder = OverrideBuilder::new(&base);
        for pattern in deny_globs {
            builder
                .add(pattern)
                .map_err(|e| ScanError::PathInvalid(format!("bad deny pattern {pattern}: {e}")))?;
        }
        let deny = builder.build().map_err(|e| ScanError::PathInvalid(e.to_string()))?;
        Ok(Self { scope_root, deny, allow_hidden: false })
    }

    pub fn default_denylist() -> Vec<String> {
        vec![
            "!.git".to_string(),
            "!node_modules".to_string(),
            "!target".to_string(),
        ]
    }

    /// Resolve `path` into a `FileIdentity`, applying symlink-following
    /// policy and scope enforcement (spec §4.1).
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn canonicalize(&self, path: &Path, follow_symlinks: bool) -> Result<FileIdentity, ScanError> {
        let resolved = if follow_symlinks {
            path.canonicalize()
                .map_err(|e| ScanError::PathInvalid(format!("{}: {e}", path.display())))?
        } else {
            // Canonicalize the parent, then rejoin the final component, so a
            // symlink leaf is not itself resolved while its ancestry still is.
            let parent = path.parent().unwrap_or(Path::new("/"));
            let file_name = path.file_name().ok_or_else(|| {
                ScanError::PathInvalid(format!("{}: no file name", path.display()))
            })?;
            let parent_canon = parent
                .canonicalize()
                .map_err(|e| ScanError::PathInvalid(format!("{}: {e}", path.display())))?;
            parent_canon.join(file_name)
        };

        if resolved.to_str().is_none() {
            return Err(ScanError::PathInvalid("non-UTF-8 path".into()));
        }

        if let Some(ref scope) = self.scope_root {
            if !resolved.starts_with(scope) {
                return Err(ScanError::PathInvalid(format!(
                    "{} escapes scan scope {}",
                    resolved.display(),
                    scope.display()
                )));
            }
        }

        let meta = fs::symlink_metadata(&resolved)
            .map_err(|e| ScanError::PathInvalid(format!("{}: {e}", resolved.display())))?;
        let file_type = meta.file_type();
        if file_type.is_block_device()
            || file_type.is_char_device()
            || file_type.is_fifo()
            || file_type.is_socket()
        {
            return Err(ScanError::PathInvalid(format!(
                "{}: reserved device file",
                resolved.display()
            )));
        }

        let meta = if follow_symlinks && file_type.is_symlink() {
            fs::metadata(&resolved)
                .map_err(|e| ScanError::PathInvalid(format!("{}: {e}", resolved.display())))?
        } else {
            meta
        };

        Ok(FileIdentity::from_metadata(resolved, &meta))
    }

    /// `true` if `path` is not excluded by the deny-list.
    pub fn is_allowed(&self, path: &Path, _policy: &ScanPolicy) -> bool {
        !self.deny.matched(path, path.is_dir()).is_whitelist()
    }

    /// Risk classification by extension, content sniff, and location (spec §4.1).
    pub fn classify(&self, path: &Path, home: Option<&Path>) -> RiskClass {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_lowercase();
        if HIGH_RISK_EXTENSIONS.contains(&ext.as_str()) {
            return RiskClass::High;
        }
        if let Ok(sniffed) = sniff_magic(path) {
            if matches!(sniffed, MagicKind::Executable | MagicKind::Archive) {
                return RiskClass::Medium.max(RiskClass::Medium);
            }
        }
        let in_system_dir = SYSTEM_DIRS.iter().any(|d| path.starts_with(d));
        let in_home = home.is_some_and(|h| path.starts_with(h));
        if in_system_dir && !in_home {
            RiskClass::Medium
        } else {
            RiskClass::Low
        }
    }

    /// Admission control before dispatch: oversize files are skipped, never
    /// aborted (spec §4.1 failure model — guard failures are recoverable).
    pub fn check_resource_budget(&self, task: &ScanTask, file_size: u64) -> Decision {
        if file_size > task.policy.max_file_size {
            debug!(size = file_size, max = task.policy.max_file_size, "file exceeds max_file_size");
            return Decision::Skip(crate::result::SkipReason::Oversize);
        }
        Decision::Proceed
    }
}

impl RiskClass {
    fn max(self, other: RiskClass) -> RiskClass {
        use RiskClass::*;
        match (self, other) {
            (High, _) | (_, High) => High,
            (Medium, _) | (_, Medium) => Medium,
            _ => Low,
        }
    }
}

const HIGH_RISK_EXTENSIONS: &[&str] =
    &["exe", "dll", "scr", "bat", "cmd", "com", "vbs", "ps1", "jar", "sh"];

const SYSTEM_DIRS: &[&str] = &["/etc", "/usr", "/bin", "/sbin", "/lib", "/boot"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MagicKind {
    Executable,
    Archive,
    Text,
    Unknown,
}

/// First-4KiB magic-byte sniff, a small static table rather than a new
/// dependency (spec §4.1 "MIME sniffing of first 4 KiB").
fn sniff_magic(path: &Path) -> std::io::Result<MagicKind> {
    use std::io::Read;
    let mut f = fs::File::open(path)?;
    let mut buf = [0u8; 4096];
    let n = f.read(&mut buf)?;
    let head = &buf[..n];

    if head.starts_with(b"\x7fELF") || head.starts_with(b"MZ") {
        return Ok(MagicKind::Executable);
    }
    if head.starts_with(b"PK\x03\x04")
        || head.starts_with(b"\x1f\x8b")
        || head.starts_with(b"Rar!")
        || head.starts_with(b"7z\xbc\xaf\x27\x1c")
    {
        return Ok(MagicKind::Archive);
    }
    if head.iter().all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace()) {
        return Ok(MagicKind::Text);
    }
    Ok(MagicKind::Unknown)
}

/// Enumerate allowed files under `root`, honoring the guard's deny-list.
/// Directory expansion for the scheduler (spec §4.4: directory tasks are
/// expanded lazily while enumerating).
pub fn enumerate_allowed(
    root: &Path,
    guard: &PolicyGuard,
    policy: &ScanPolicy,
) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut builder = ignore::WalkBuilder::new(root);
    builder.hidden(false).git_ignore(false).git_global(false).git_exclude(false);
    if !policy.follow_symlinks {
        builder.follow_links(false);
    }
    for entry in builder.build().flatten() {
        if entry.file_type().is_some_and(|ft| ft.is_file()) {
            let path = entry.path();
            if guard.is_allowed(path, policy) {
                out.push(path.to_path_buf());
            } else {
                warn!(path = %path.display(), "denied by policy guard");
            }
        }
    }
    out
}

#[allow(dead_code)]
pub fn unique_extensions(paths: &[PathBuf]) -> HashSet<String> {
    paths
        .iter()
        .filter_map(|p| p.extension().and_then(|e| e.to_str()).map(|s| s.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn guard() -> PolicyGuard {
        PolicyGuard::new(None, &PolicyGuard::default_denylist()).unwrap()
    }

    #[test]
    fn rejects_device_files() {
        let g = guard();
        let err = g.canonicalize(Path::new("/dev/null"), false).unwrap_err();
        assert!(matches!(err, ScanError::PathInvalid(_)));
    }

    #[test]
    fn denylist_excludes_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let guard = PolicyGuard::new(Some(dir.path().to_path_buf()), &PolicyGuard::default_denylist())
            .unwrap();
        let policy = ScanPolicy::default();
        assert!(!guard.is_allowed(&dir.path().join(".git").join("HEAD"), &policy));
    }

    #[test]
    fn oversize_file_is_skipped_not_aborted() {
        let g = guard();
        let mut policy = ScanPolicy::default();
        policy.max_file_size = 10;
        let task = ScanTask::new(
            crate::task::ScanGroupId::new(),
            crate::task::ScanTarget::Directory(crate::task::DirectorySpec { root: "/".into() }),
            crate::policy::Priority::Interactive,
            Arc::new(policy),
            crate::task::CancelToken::new(),
        );
        assert_eq!(
            g.check_resource_budget(&task, 1000),
            Decision::Skip(crate::result::SkipReason::Oversize)
        );
    }

    #[test]
    fn scope_escape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let guard = PolicyGuard::new(Some(dir.path().to_path_buf()), &[]).unwrap();
        let f = outside.path().join("f.txt");
        std::fs::write(&f, b"x").unwrap();
        let err = guard.canonicalize(&f, true).unwrap_err();
        assert!(matches!(err, ScanError::PathInvalid(_)));
    }
}
