//! Commit: fold live state into the shadow repository.

use tandem_core::{probe, types, Baseline, Fingerprint, Repository, ROOT};

use crate::diff::list_live;
use crate::error::{io_err, DiffError, SyncError};
use crate::record::{parse_stream, ChangeRecord};

/// Reconcile the shadow under `dir` with the live tree.
///
/// Entries that differ are rewritten, entries that vanished are removed, and
/// new directories are always committed in full. Returns the number of
/// shadow entries touched.
pub fn commit_dir(repo: &Repository, dir: &str, recursive: bool) -> Result<usize, SyncError> {
    types::validate(dir)?;
    let names = match list_live(repo.root(), dir, repo.exclude()) {
        Ok(names) => names,
        Err(DiffError::File(e)) => {
            let vanished = dir != ROOT
                && probe(&repo.live_path(dir))
                    .map(|fp| fp.is_absent())
                    .unwrap_or(false);
            if vanished {
                repo.remove(dir)?;
                return Ok(1);
            }
            tracing::warn!(dir, error = %e, "cannot list directory for commit");
            return Ok(0);
        }
        Err(DiffError::Fatal(e)) => return Err(e),
    };

    let mut touched = 0;
    for name in names {
        let rel = types::join(dir, &name);
        let live_path = repo.live_path(&rel);
        let live = probe(&live_path).map_err(|e| io_err(&live_path, e))?;
        let shadow = repo.lookup(&rel)?;

        if live == shadow {
            if live.is_dir() && recursive {
                touched += commit_dir(repo, &rel, recursive)?;
            }
            continue;
        }

        repo.put(&rel, &live)?;
        touched += 1;
        if live.is_dir() {
            touched += commit_dir(repo, &rel, true)?;
        }
    }

    for name in repo.children(dir)? {
        if repo.exclude().is_excluded(&name) {
            continue;
        }
        let rel = types::join(dir, &name);
        let live_path = repo.live_path(&rel);
        if probe(&live_path).map_err(|e| io_err(&live_path, e))?.is_absent() {
            repo.remove(&rel)?;
            touched += 1;
        }
    }

    Ok(touched)
}

/// Record exactly what a delivered stream described.
///
/// Uses the fingerprints captured when the diff was computed, not a fresh
/// probe, so a change that raced the delivery shows up in the next diff.
pub fn commit_records(repo: &Repository, records: &[ChangeRecord]) -> Result<(), SyncError> {
    for record in records {
        match record.target() {
            Fingerprint::Absent => repo.remove(record.path())?,
            target => repo.put(record.path(), target)?,
        }
    }
    tracing::debug!(records = records.len(), "diff committed");
    Ok(())
}

/// [`commit_records`] over a serialized stream.
pub fn commit_stream(repo: &Repository, stream: &[u8], with_contents: bool) -> Result<(), SyncError> {
    commit_records(repo, &parse_stream(stream, with_contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tandem_core::ExcludeSet;
    use tempfile::TempDir;

    #[test]
    fn commit_dir_tracks_additions_and_removals() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("d/e")).unwrap();
        fs::write(tmp.path().join("d/e/f"), "f").unwrap();
        fs::write(tmp.path().join("top"), "t").unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();

        assert_eq!(commit_dir(&repo, ROOT, true).unwrap(), 4);
        assert_eq!(repo.lookup("d/e").unwrap(), Fingerprint::Dir);
        assert!(matches!(repo.lookup("d/e/f").unwrap(), Fingerprint::File { size: 1, .. }));

        fs::remove_dir_all(tmp.path().join("d")).unwrap();
        assert_eq!(commit_dir(&repo, ROOT, true).unwrap(), 1);
        assert_eq!(repo.lookup("d/e/f").unwrap(), Fingerprint::Absent);
        assert_eq!(commit_dir(&repo, ROOT, true).unwrap(), 0, "second commit is a no-op");
    }

    #[test]
    fn non_recursive_commit_skips_unchanged_subdirectories() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub")).unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();
        commit_dir(&repo, ROOT, true).unwrap();

        fs::write(tmp.path().join("sub/new"), "n").unwrap();
        assert_eq!(commit_dir(&repo, ROOT, false).unwrap(), 0);
        assert_eq!(commit_dir(&repo, "sub", false).unwrap(), 1);
    }

    #[test]
    fn commit_records_uses_recorded_fingerprints() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();
        let fp = Fingerprint::File {
            mode: 0o600,
            size: 9,
            mtime: 7,
        };
        let records = vec![
            ChangeRecord::Added {
                path: "a".into(),
                fingerprint: fp.clone(),
                contents: None,
            },
            ChangeRecord::Deleted {
                path: "b".into(),
                previous: Fingerprint::Dir,
            },
        ];
        repo.put("b", &Fingerprint::Dir).unwrap();
        commit_records(&repo, &records).unwrap();
        assert_eq!(repo.lookup("a").unwrap(), fp);
        assert_eq!(repo.lookup("b").unwrap(), Fingerprint::Absent);
    }
}
