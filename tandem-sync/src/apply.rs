//! Apply engine: make the live tree (and shadow) match incoming records.
//!
//! ## Per-record protocol
//!
//! 1. Probe the destination; if it already has the incoming fingerprint the
//!    record is a no-op (only a stale shadow entry is refreshed).
//! 2. Directories and symlinks are created in place.
//! 3. File contents are staged under `.tandem/tmp`, given their mode and
//!    mtime, then renamed over the destination.
//! 4. The shadow entry is updated.
//!
//! Conflicts resolve as last writer wins.

use std::fmt;
use std::fs;
use std::path::Path;

use filetime::{set_file_mtime, FileTime};
use tandem_core::{fingerprint, probe, types, Baseline, Fingerprint, Repository};

use crate::error::{contract, io_err, SyncError};
use crate::record::{parse_stream, ChangeRecord};

/// Aggregate result of one apply call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyStats {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ApplyStats {
    /// Number of records that mutated the live tree.
    pub fn changes(&self) -> usize {
        self.added + self.modified + self.deleted
    }

    pub fn merge(&mut self, other: ApplyStats) {
        self.added += other.added;
        self.modified += other.modified;
        self.deleted += other.deleted;
        self.unchanged += other.unchanged;
    }
}

impl fmt::Display for ApplyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} modified, {} deleted, {} unchanged",
            self.added, self.modified, self.deleted, self.unchanged
        )
    }
}

/// Decode a content-carrying stream and apply it.
pub fn apply_diff(repo: &Repository, stream: &[u8]) -> Result<ApplyStats, SyncError> {
    let records = parse_stream(stream, true)?;
    apply_records(repo, &records)
}

/// Apply already-decoded records, in order.
pub fn apply_records(repo: &Repository, records: &[ChangeRecord]) -> Result<ApplyStats, SyncError> {
    let mut stats = ApplyStats::default();
    for record in records {
        let rel = record.path();
        if repo.exclude().excludes_path(rel) {
            tracing::debug!(path = rel, "ignoring record for excluded path");
            continue;
        }
        let live_path = repo.live_path(rel);
        let live = probe(&live_path).map_err(|e| io_err(&live_path, e))?;

        match record {
            ChangeRecord::Deleted { .. } => {
                if live.is_absent() {
                    stats.unchanged += 1;
                } else {
                    remove_recursive(&live_path)?;
                    stats.deleted += 1;
                }
                repo.remove(rel)?;
            }
            ChangeRecord::Added { fingerprint, .. } | ChangeRecord::Modified { fingerprint, .. } => {
                if &live == fingerprint {
                    stats.unchanged += 1;
                    if &repo.lookup(rel)? != fingerprint {
                        repo.put(rel, fingerprint)?;
                    }
                    continue;
                }
                if let ChangeRecord::Modified { previous, .. } = record {
                    if &live != previous {
                        tracing::debug!(
                            path = rel,
                            expected = %previous,
                            found = %live,
                            "overwriting concurrent local change"
                        );
                    }
                }
                write_entry(repo, rel, &live, fingerprint, record.contents())?;
                repo.put(rel, fingerprint)?;
                if matches!(record, ChangeRecord::Added { .. }) {
                    stats.added += 1;
                } else {
                    stats.modified += 1;
                }
            }
        }
    }
    tracing::debug!(%stats, "diff applied");
    Ok(stats)
}

/// Materialize one entry at `rel`, replacing whatever `live` was there.
fn write_entry(
    repo: &Repository,
    rel: &str,
    live: &Fingerprint,
    target: &Fingerprint,
    contents: Option<&[u8]>,
) -> Result<(), SyncError> {
    let dest = repo.live_path(rel);
    match target {
        Fingerprint::Absent => Err(contract(format!("cannot write absent entry {rel}"))),
        Fingerprint::Dir => {
            ensure_parent(repo, rel)?;
            if !live.is_absent() {
                remove_recursive(&dest)?;
            }
            fs::create_dir_all(&dest).map_err(|e| io_err(&dest, e))
        }
        Fingerprint::Symlink { target: link } => {
            ensure_parent(repo, rel)?;
            if !live.is_absent() {
                remove_recursive(&dest)?;
            }
            make_symlink(link, &dest)
        }
        Fingerprint::File { mode, size, mtime } => {
            let data = contents.ok_or_else(|| contract(format!("missing contents for {rel}")))?;
            if data.len() as u64 != *size {
                return Err(contract(format!(
                    "contents of {rel} are {} bytes, stat says {size}",
                    data.len()
                )));
            }
            ensure_parent(repo, rel)?;
            let staged = repo.staging_path(rel);
            fs::write(&staged, data).map_err(|e| io_err(&staged, e))?;
            install_file(repo, rel, &staged, *mode, *mtime)
        }
    }
}

/// Give a staged file its mode and mtime, then rename it over `rel`.
/// The staged file is removed on failure.
pub(crate) fn install_file(
    repo: &Repository,
    rel: &str,
    staged: &Path,
    mode: u32,
    mtime: i64,
) -> Result<(), SyncError> {
    let dest = repo.live_path(rel);
    let result = (|| {
        set_mode(staged, mode)?;
        set_file_mtime(staged, FileTime::from_unix_time(mtime, 0)).map_err(|e| io_err(staged, e))?;
        if dest.is_dir() && !dest.is_symlink() {
            fs::remove_dir_all(&dest).map_err(|e| io_err(&dest, e))?;
        }
        fs::rename(staged, &dest).map_err(|e| io_err(&dest, e))
    })();
    if result.is_err() {
        let _ = fs::remove_file(staged);
    }
    result
}

/// Create the parent directory of `rel`, replacing a non-directory in the way.
pub(crate) fn ensure_parent(repo: &Repository, rel: &str) -> Result<(), SyncError> {
    let parent = types::parent(rel);
    if parent == types::ROOT {
        return Ok(());
    }
    let dir = repo.live_path(parent);
    let current = probe(&dir).map_err(|e| io_err(&dir, e))?;
    match current {
        Fingerprint::Dir => Ok(()),
        Fingerprint::Absent => {
            ensure_parent(repo, parent)?;
            fs::create_dir(&dir).map_err(|e| io_err(&dir, e))
        }
        _ => {
            remove_recursive(&dir)?;
            fs::create_dir(&dir).map_err(|e| io_err(&dir, e))
        }
    }
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
pub fn remove_recursive(path: &Path) -> Result<(), SyncError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if fingerprint::is_vanished(&e) => return Ok(()),
        Err(e) => return Err(io_err(path, e)),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if fingerprint::is_vanished(&e) => Ok(()),
        Err(e) => Err(io_err(path, e)),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), SyncError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> Result<(), SyncError> {
    let mut perms = fs::metadata(path).map_err(|e| io_err(path, e))?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms).map_err(|e| io_err(path, e))
}

#[cfg(unix)]
fn make_symlink(target: &str, dest: &Path) -> Result<(), SyncError> {
    std::os::unix::fs::symlink(target, dest).map_err(|e| io_err(dest, e))
}

#[cfg(not(unix))]
fn make_symlink(target: &str, dest: &Path) -> Result<(), SyncError> {
    tracing::warn!(dest = %dest.display(), target, "symlinks are not supported here, skipping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DiffStream;
    use tandem_core::ExcludeSet;
    use tempfile::TempDir;

    fn file_record(path: &str, body: &[u8], mtime: i64) -> ChangeRecord {
        ChangeRecord::Added {
            path: path.into(),
            fingerprint: Fingerprint::File {
                mode: 0o640,
                size: body.len() as u64,
                mtime,
            },
            contents: Some(body.to_vec()),
        }
    }

    #[test]
    fn file_lands_with_mode_mtime_and_shadow() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();
        let rec = file_record("nested/dir/f.txt", b"data", 1_650_000_000);

        let stats = apply_records(&repo, std::slice::from_ref(&rec)).unwrap();
        assert_eq!(stats.added, 1);

        let live = probe(&tmp.path().join("nested/dir/f.txt")).unwrap();
        assert_eq!(&live, rec.target());
        assert_eq!(&repo.lookup("nested/dir/f.txt").unwrap(), rec.target());
        assert_eq!(fs::read_dir(repo.tmp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn second_application_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();
        let stream: DiffStream = [file_record("a", b"x", 1_650_000_000)].into_iter().collect();

        let first = apply_diff(&repo, stream.as_bytes()).unwrap();
        let second = apply_diff(&repo, stream.as_bytes()).unwrap();
        assert_eq!(first.changes(), 1);
        assert_eq!(second.changes(), 0);
        assert_eq!(second.unchanged, 1);
    }

    #[test]
    fn file_replaces_directory() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("x/inner")).unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();

        let rec = ChangeRecord::Modified {
            path: "x".into(),
            previous: Fingerprint::Dir,
            fingerprint: Fingerprint::File {
                mode: 0o644,
                size: 2,
                mtime: 1_650_000_000,
            },
            contents: Some(b"hi".to_vec()),
        };
        let stats = apply_records(&repo, &[rec]).unwrap();
        assert_eq!(stats.modified, 1);
        assert_eq!(fs::read(tmp.path().join("x")).unwrap(), b"hi");
    }

    #[test]
    fn missing_contents_is_a_contract_error() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();
        let rec = file_record("a", b"abc", 1).with_contents(None);
        let err = apply_records(&repo, &[rec]).unwrap_err();
        assert!(matches!(err, SyncError::Contract(_)), "{err}");
    }

    #[test]
    fn excluded_paths_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::new(["build"])).unwrap();
        let stats = apply_records(&repo, &[file_record("build/out.o", b"o", 1)]).unwrap();
        assert_eq!(stats, ApplyStats::default());
        assert!(!tmp.path().join("build").exists());
    }

    #[test]
    fn stats_display() {
        let stats = ApplyStats {
            added: 2,
            modified: 1,
            deleted: 0,
            unchanged: 4,
        };
        assert_eq!(stats.to_string(), "2 added, 1 modified, 0 deleted, 4 unchanged");
    }
}
