//! Native file synchronization between two directory trees.
//!
//! Each cycle scans both endpoints, compares them against the state they were
//! in after the previous cycle (the ancestor), and propagates changes
//! according to the sync mode. Alpha is the source for one-way modes; reverse
//! modes are expected to arrive with their endpoints already swapped.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::spec::SyncMode;
use crate::error::{DeployError, Result};
use crate::manifest::hash::hash_bytes;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Gitignore-style exclude patterns.
///
/// A pattern without a `/` matches a file or directory of that name at any
/// depth. A pattern with a `/` is anchored at the sync root. Excluding a
/// directory excludes everything under it.
#[derive(Debug, Clone, Default)]
pub struct ExcludeMatcher {
    patterns: Vec<(Pattern, bool)>,
}

impl ExcludeMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|raw| {
                let trimmed = raw.trim_end_matches('/');
                let anchored = trimmed.contains('/');
                let trimmed = trimmed.trim_start_matches('/');
                Pattern::new(trimmed)
                    .map(|p| (p, anchored))
                    .map_err(|e| DeployError::Sync(format!("invalid exclude pattern '{}': {}", raw, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Whether `relative` (a path below the sync root) is excluded.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        relative
            .ancestors()
            .filter(|a| !a.as_os_str().is_empty())
            .any(|ancestor| {
                let text = slash_path(ancestor);
                let name = ancestor
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                self.patterns.iter().any(|(pattern, anchored)| {
                    pattern.matches_with(&text, MATCH_OPTIONS)
                        || (!anchored && pattern.matches_with(&name, MATCH_OPTIONS))
                })
            })
    }
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// What a path looks like on one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    /// Content hash for files.
    pub digest: Option<String>,
    pub executable: bool,
}

pub type Snapshot = BTreeMap<PathBuf, Entry>;

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

/// Scans a directory tree, skipping excluded paths and symlinks.
///
/// A root that does not exist scans as empty.
pub fn scan(root: &Path, excludes: &ExcludeMatcher) -> Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    if !root.exists() {
        return Ok(snapshot);
    }

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.path()
                .strip_prefix(root)
                .map(|rel| !excludes.is_excluded(rel))
                .unwrap_or(true)
        });

    for entry in walker {
        let entry = entry
            .map_err(|e| DeployError::Sync(format!("failed to scan {}: {}", root.display(), e)))?;
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path()).to_path_buf();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            snapshot.insert(
                relative,
                Entry {
                    kind: EntryKind::Directory,
                    digest: None,
                    executable: false,
                },
            );
        } else if file_type.is_file() {
            let content = match fs::read(entry.path()) {
                Ok(content) => content,
                // Removed between listing and reading
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let executable = entry.metadata().map(|m| is_executable(&m)).unwrap_or(false);
            snapshot.insert(
                relative,
                Entry {
                    kind: EntryKind::File,
                    digest: Some(hash_bytes(&content)),
                    executable,
                },
            );
        }
    }
    Ok(snapshot)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Alpha,
    Beta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operation {
    Copy { path: PathBuf, from: Side },
    Delete { path: PathBuf, on: Side },
}

/// Changes made by one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub to_beta: usize,
    pub to_alpha: usize,
    pub deleted: usize,
    pub conflicts: Vec<String>,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.to_beta == 0 && self.to_alpha == 0 && self.deleted == 0 && self.conflicts.is_empty()
    }
}

/// Synchronizes two local directories.
#[derive(Debug)]
pub struct SyncEngine {
    alpha: PathBuf,
    beta: PathBuf,
    mode: SyncMode,
    excludes: ExcludeMatcher,
    file_mode: u32,
    directory_mode: u32,
    ancestor: Snapshot,
}

impl SyncEngine {
    pub fn new(
        alpha: impl Into<PathBuf>,
        beta: impl Into<PathBuf>,
        mode: SyncMode,
        excludes: &[String],
    ) -> Result<Self> {
        Ok(Self {
            alpha: alpha.into(),
            beta: beta.into(),
            mode,
            excludes: ExcludeMatcher::new(excludes)?,
            file_mode: super::spec::DEFAULT_FILE_MODE,
            directory_mode: super::spec::DEFAULT_DIRECTORY_MODE,
            ancestor: Snapshot::new(),
        })
    }

    /// Permission bits for files and directories the engine creates.
    pub fn with_modes(mut self, file_mode: u32, directory_mode: u32) -> Self {
        self.file_mode = file_mode;
        self.directory_mode = directory_mode;
        self
    }

    pub fn alpha(&self) -> &Path {
        &self.alpha
    }

    pub fn beta(&self) -> &Path {
        &self.beta
    }

    /// Runs one scan-compare-propagate cycle.
    pub fn cycle(&mut self) -> Result<CycleReport> {
        let alpha = scan(&self.alpha, &self.excludes)?;
        let beta = scan(&self.beta, &self.excludes)?;
        let (operations, conflicts) = self.plan(&alpha, &beta);

        let mut report = CycleReport {
            conflicts,
            ..Default::default()
        };

        let (mut deletes, mut copies): (Vec<Operation>, Vec<Operation>) = operations
            .into_iter()
            .partition(|op| matches!(op, Operation::Delete { .. }));
        // Children before parents for deletes, parents first for copies
        deletes.sort_by(|a, b| op_path(b).cmp(op_path(a)));
        copies.sort_by(|a, b| op_path(a).cmp(op_path(b)));

        for op in deletes {
            if let Operation::Delete { path, on } = op {
                let (root, snapshot) = match on {
                    Side::Alpha => (&self.alpha, &alpha),
                    Side::Beta => (&self.beta, &beta),
                };
                let kind = snapshot.get(&path).map(|e| e.kind);
                if remove(&root.join(&path), kind)? {
                    report.deleted += 1;
                }
            }
        }

        for op in copies {
            if let Operation::Copy { path, from } = op {
                let (source_root, target_root, entry) = match from {
                    Side::Alpha => (&self.alpha, &self.beta, alpha.get(&path)),
                    Side::Beta => (&self.beta, &self.alpha, beta.get(&path)),
                };
                let Some(entry) = entry else { continue };
                self.copy(&source_root.join(&path), &target_root.join(&path), entry)?;
                match from {
                    Side::Alpha => report.to_beta += 1,
                    Side::Beta => report.to_alpha += 1,
                }
            }
        }

        let alpha = scan(&self.alpha, &self.excludes)?;
        let beta = scan(&self.beta, &self.excludes)?;
        self.ancestor = alpha
            .into_iter()
            .filter(|(path, entry)| beta.get(path) == Some(entry))
            .collect();

        if !report.is_empty() {
            log::debug!(
                "Synced {} -> {}: {} to beta, {} to alpha, {} deleted, {} conflicts",
                self.alpha.display(),
                self.beta.display(),
                report.to_beta,
                report.to_alpha,
                report.deleted,
                report.conflicts.len()
            );
        }
        Ok(report)
    }

    fn plan(&self, alpha: &Snapshot, beta: &Snapshot) -> (Vec<Operation>, Vec<String>) {
        let paths: BTreeSet<&PathBuf> = alpha
            .keys()
            .chain(beta.keys())
            .chain(self.ancestor.keys())
            .collect();

        let mut operations = Vec::new();
        let mut conflicts = Vec::new();

        for path in paths {
            let a = alpha.get(path);
            let b = beta.get(path);
            if a == b {
                continue;
            }
            let o = self.ancestor.get(path);
            let to_beta = || propagate(path, a, Side::Alpha);
            let to_alpha = || propagate(path, b, Side::Beta);

            match self.mode {
                SyncMode::OneWayReplica | SyncMode::OneWayReplicaReverse => operations.push(to_beta()),
                SyncMode::OneWay | SyncMode::OneWayReverse => {
                    if b == o || (o.is_none() && a.is_some()) {
                        operations.push(to_beta());
                    } else if a.is_none() && o.is_none() {
                        // Created on the beta side only
                    } else {
                        conflicts.push(format!(
                            "{}: modified on the beta side since the last sync",
                            path.display()
                        ));
                    }
                }
                SyncMode::TwoWay | SyncMode::TwoWayResolved => {
                    let alpha_changed = a != o;
                    let beta_changed = b != o;
                    match (alpha_changed, beta_changed) {
                        (true, false) => operations.push(to_beta()),
                        (false, true) => operations.push(to_alpha()),
                        _ => {
                            conflicts.push(format!("{}: changed on both sides", path.display()));
                            let keep_beta = self.mode == SyncMode::TwoWay && a.is_none();
                            operations.push(if keep_beta { to_alpha() } else { to_beta() });
                        }
                    }
                }
            }
        }

        (operations, conflicts)
    }

    fn copy(&self, source: &Path, target: &Path, entry: &Entry) -> Result<()> {
        match entry.kind {
            EntryKind::Directory => {
                if target.is_file() {
                    fs::remove_file(target)?;
                }
                fs::create_dir_all(target)?;
                set_mode(target, self.directory_mode)?;
            }
            EntryKind::File => {
                if target.is_dir() {
                    fs::remove_dir_all(target)?;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                match fs::copy(source, target) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound && !source.exists() => {
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
                let mode = if entry.executable {
                    self.file_mode | 0o111
                } else {
                    self.file_mode
                };
                set_mode(target, mode)?;
            }
        }
        Ok(())
    }
}

/// An operation making the other side look like `entry` on `from`.
fn propagate(path: &Path, entry: Option<&Entry>, from: Side) -> Operation {
    match entry {
        Some(_) => Operation::Copy {
            path: path.to_path_buf(),
            from,
        },
        None => Operation::Delete {
            path: path.to_path_buf(),
            on: match from {
                Side::Alpha => Side::Beta,
                Side::Beta => Side::Alpha,
            },
        },
    }
}

fn op_path(op: &Operation) -> &Path {
    match op {
        Operation::Copy { path, .. } | Operation::Delete { path, .. } => path,
    }
}

/// Removes a file or an emptied directory. Returns whether anything was removed.
///
/// Directories that still hold excluded content are left in place.
fn remove(path: &Path, kind: Option<EntryKind>) -> Result<bool> {
    let result = match kind {
        Some(EntryKind::Directory) => fs::remove_dir(path),
        _ => fs::remove_file(path),
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) if kind == Some(EntryKind::Directory) => {
            log::debug!("Keeping directory {}: {}", path.display(), e);
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use assert_fs::TempDir;

    fn listing(root: &Path) -> Vec<String> {
        scan(root, &ExcludeMatcher::default())
            .unwrap()
            .into_iter()
            .filter(|(_, e)| e.kind == EntryKind::File)
            .map(|(p, _)| slash_path(&p))
            .collect()
    }

    #[test]
    fn test_exclude_matching() {
        let matcher = ExcludeMatcher::new(&[
            "somedir".to_string(),
            "nested/prefix-b".to_string(),
            "*.log".to_string(),
        ])
        .unwrap();
        assert!(matcher.is_excluded(Path::new("somedir")));
        assert!(matcher.is_excluded(Path::new("somedir/file.txt")));
        assert!(matcher.is_excluded(Path::new("deep/somedir/file.txt")));
        assert!(matcher.is_excluded(Path::new("nested/prefix-b")));
        assert!(matcher.is_excluded(Path::new("nested/prefix-b/x")));
        assert!(!matcher.is_excluded(Path::new("other/nested/prefix-b")));
        assert!(matcher.is_excluded(Path::new("a/b/debug.log")));
        assert!(!matcher.is_excluded(Path::new("somedir-other")));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(ExcludeMatcher::new(&["[".to_string()]).is_err());
    }

    #[test]
    fn test_one_way_respects_excludes() {
        let alpha = TempDir::new().unwrap();
        let beta = TempDir::new().unwrap();
        alpha.child("keep.txt").write_str("keep").unwrap();
        alpha.child("somedir/skip.txt").write_str("skip").unwrap();
        alpha.child("sub/also.txt").write_str("also").unwrap();

        let mut engine = SyncEngine::new(
            alpha.path(),
            beta.path(),
            SyncMode::OneWay,
            &["somedir".to_string()],
        )
        .unwrap();
        let report = engine.cycle().unwrap();
        assert_eq!(report.to_beta, 3);
        assert_eq!(listing(beta.path()), vec!["keep.txt", "sub/also.txt"]);

        assert!(engine.cycle().unwrap().is_empty());
    }

    #[test]
    fn test_one_way_leaves_beta_only_files() {
        let alpha = TempDir::new().unwrap();
        let beta = TempDir::new().unwrap();
        alpha.child("a.txt").write_str("a").unwrap();
        beta.child("created-in-container.txt").write_str("c").unwrap();

        let mut engine = SyncEngine::new(alpha.path(), beta.path(), SyncMode::OneWay, &[]).unwrap();
        engine.cycle().unwrap();
        assert_eq!(listing(beta.path()), vec!["a.txt", "created-in-container.txt"]);

        fs::remove_file(alpha.path().join("a.txt")).unwrap();
        engine.cycle().unwrap();
        assert_eq!(listing(beta.path()), vec!["created-in-container.txt"]);
    }

    #[test]
    fn test_replica_mirrors() {
        let alpha = TempDir::new().unwrap();
        let beta = TempDir::new().unwrap();
        alpha.child("a.txt").write_str("a").unwrap();
        beta.child("stray.txt").write_str("s").unwrap();

        let mut engine =
            SyncEngine::new(alpha.path(), beta.path(), SyncMode::OneWayReplica, &[]).unwrap();
        engine.cycle().unwrap();
        assert_eq!(listing(beta.path()), vec!["a.txt"]);
    }

    #[test]
    fn test_two_way_propagates_both_directions() {
        let alpha = TempDir::new().unwrap();
        let beta = TempDir::new().unwrap();
        alpha.child("local.txt").write_str("l").unwrap();
        beta.child("remote.txt").write_str("r").unwrap();

        let mut engine = SyncEngine::new(alpha.path(), beta.path(), SyncMode::TwoWay, &[]).unwrap();
        engine.cycle().unwrap();
        assert_eq!(listing(alpha.path()), vec!["local.txt", "remote.txt"]);
        assert_eq!(listing(beta.path()), vec!["local.txt", "remote.txt"]);

        fs::remove_file(beta.path().join("local.txt")).unwrap();
        beta.child("remote.txt").write_str("changed").unwrap();
        engine.cycle().unwrap();
        assert_eq!(listing(alpha.path()), vec!["remote.txt"]);
        assert_eq!(fs::read_to_string(alpha.path().join("remote.txt")).unwrap(), "changed");
    }

    #[test]
    fn test_two_way_deletion_never_beats_modification() {
        let alpha = TempDir::new().unwrap();
        let beta = TempDir::new().unwrap();
        alpha.child("f.txt").write_str("v1").unwrap();

        let mut engine = SyncEngine::new(alpha.path(), beta.path(), SyncMode::TwoWay, &[]).unwrap();
        engine.cycle().unwrap();

        fs::remove_file(alpha.path().join("f.txt")).unwrap();
        beta.child("f.txt").write_str("v2").unwrap();
        let report = engine.cycle().unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(fs::read_to_string(alpha.path().join("f.txt")).unwrap(), "v2");
    }

    #[test]
    fn test_two_way_resolved_alpha_wins() {
        let alpha = TempDir::new().unwrap();
        let beta = TempDir::new().unwrap();
        alpha.child("f.txt").write_str("v1").unwrap();

        let mut engine =
            SyncEngine::new(alpha.path(), beta.path(), SyncMode::TwoWayResolved, &[]).unwrap();
        engine.cycle().unwrap();

        fs::remove_file(alpha.path().join("f.txt")).unwrap();
        beta.child("f.txt").write_str("v2").unwrap();
        engine.cycle().unwrap();
        assert!(!beta.path().join("f.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_applies_modes() {
        use std::os::unix::fs::PermissionsExt;
        let alpha = TempDir::new().unwrap();
        let beta = TempDir::new().unwrap();
        alpha.child("dir/f.txt").write_str("x").unwrap();

        let mut engine = SyncEngine::new(alpha.path(), beta.path(), SyncMode::OneWay, &[])
            .unwrap()
            .with_modes(0o600, 0o700);
        engine.cycle().unwrap();

        let file = fs::metadata(beta.path().join("dir/f.txt")).unwrap();
        assert_eq!(file.permissions().mode() & 0o777, 0o600);
        let dir = fs::metadata(beta.path().join("dir")).unwrap();
        assert_eq!(dir.permissions().mode() & 0o777, 0o700);
    }
}
