//! Shadow repository: the last-synchronized fingerprint of every path.
//!
//! # On-disk layout
//!
//! ```text
//! <root>/.tandem/
//!   client_config   (INI, client mode only)
//!   files/          (shadow mirror: directories as directories,
//!                    everything else as a small fingerprint text file)
//!   tmp/            (staging area, wiped on open)
//!   lock            (exclusive advisory lock, held while the Repository lives)
//!   pid             (engine pid)
//!   notify_pid      (watcher pid, present while the watcher runs)
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sha2::{Digest, Sha256};

use crate::error::{io_err, CoreError};
use crate::fingerprint::{is_vanished, Fingerprint};
use crate::types::{self, ExcludeSet, ROOT};

/// Name of the private directory at the synchronized root.
pub const REPO_DIR_NAME: &str = ".tandem";

const FILES_DIR: &str = "files";
const TMP_DIR: &str = "tmp";
const LOCK_FILE: &str = "lock";
const PID_FILE: &str = "pid";
const NOTIFY_PID_FILE: &str = "notify_pid";
const CLIENT_CONFIG: &str = "client_config";

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Read side of the shadow state, as seen by the diff engine.
pub trait Baseline {
    /// Last committed fingerprint of `rel`, [`Fingerprint::Absent`] when unknown.
    fn lookup(&self, rel: &str) -> Result<Fingerprint, CoreError>;

    /// Sorted entry names recorded under the directory `rel`.
    fn children(&self, rel: &str) -> Result<Vec<String>, CoreError>;
}

/// Baseline that knows nothing. Diffing against it yields the whole tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyBaseline;

impl Baseline for EmptyBaseline {
    fn lookup(&self, rel: &str) -> Result<Fingerprint, CoreError> {
        if rel == ROOT {
            Ok(Fingerprint::Dir)
        } else {
            Ok(Fingerprint::Absent)
        }
    }

    fn children(&self, _rel: &str) -> Result<Vec<String>, CoreError> {
        Ok(Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// An opened, locked shadow repository.
#[derive(Debug)]
pub struct Repository {
    root: PathBuf,
    meta: PathBuf,
    exclude: ExcludeSet,
    _lock: File,
}

impl Repository {
    /// Open (creating if needed) the repository for the tree at `root`.
    ///
    /// Fails with [`CoreError::Locked`] when another instance holds the lock.
    /// The staging area is emptied and the engine pid marker written.
    pub fn open(root: &Path, exclude: ExcludeSet) -> Result<Self, CoreError> {
        let meta = root.join(REPO_DIR_NAME);
        for dir in [&meta, &meta.join(FILES_DIR)] {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }

        let lock_path = meta.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| io_err(&lock_path, e))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(CoreError::Locked { path: meta });
        }

        let tmp = meta.join(TMP_DIR);
        match fs::remove_dir_all(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&tmp, e)),
        }
        fs::create_dir_all(&tmp).map_err(|e| io_err(&tmp, e))?;

        let pid_path = meta.join(PID_FILE);
        fs::write(&pid_path, std::process::id().to_string()).map_err(|e| io_err(&pid_path, e))?;

        tracing::debug!(root = %root.display(), "repository opened");
        Ok(Self {
            root: root.to_path_buf(),
            meta,
            exclude,
            _lock: lock,
        })
    }

    /// Walk up from `start` to the nearest directory containing `.tandem/`.
    pub fn discover(start: &Path) -> Result<PathBuf, CoreError> {
        start
            .ancestors()
            .find(|dir| dir.join(REPO_DIR_NAME).is_dir())
            .map(Path::to_path_buf)
            .ok_or_else(|| CoreError::RepositoryNotFound {
                start: start.to_path_buf(),
            })
    }

    /// `<root>/.tandem/client_config`. Pure, no I/O.
    pub fn config_path_for(root: &Path) -> PathBuf {
        root.join(REPO_DIR_NAME).join(CLIENT_CONFIG)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exclude(&self) -> &ExcludeSet {
        &self.exclude
    }

    pub fn files_dir(&self) -> PathBuf {
        self.meta.join(FILES_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.meta.join(TMP_DIR)
    }

    pub fn notify_pid_path(&self) -> PathBuf {
        self.meta.join(NOTIFY_PID_FILE)
    }

    /// Live filesystem location of `rel`.
    pub fn live_path(&self, rel: &str) -> PathBuf {
        types::to_fs(&self.root, rel)
    }

    /// Shadow mirror location of `rel`.
    pub fn shadow_path(&self, rel: &str) -> PathBuf {
        types::to_fs(&self.files_dir(), rel)
    }

    /// Deterministic staging file for content destined for `rel`.
    pub fn staging_path(&self, rel: &str) -> PathBuf {
        self.tmp_dir().join(staging_name(rel))
    }

    pub fn write_notify_pid(&self, pid: u32) -> Result<(), CoreError> {
        let path = self.notify_pid_path();
        fs::write(&path, pid.to_string()).map_err(|e| io_err(&path, e))
    }

    pub fn clear_notify_pid(&self) {
        let _ = fs::remove_file(self.notify_pid_path());
    }

    /// True when nothing has ever been committed.
    pub fn is_empty(&self) -> Result<bool, CoreError> {
        Ok(self.children(ROOT)?.is_empty())
    }

    // -----------------------------------------------------------------------
    // Entry mutation
    // -----------------------------------------------------------------------

    /// Record `fingerprint` as the committed state of `rel`.
    ///
    /// Directories become directories in the mirror; everything else is
    /// written to staging and renamed over the entry. [`Fingerprint::Absent`]
    /// removes the entry.
    pub fn put(&self, rel: &str, fingerprint: &Fingerprint) -> Result<(), CoreError> {
        if rel == ROOT {
            return Ok(());
        }
        types::validate(rel)?;

        let path = self.shadow_path(rel);
        match fingerprint {
            Fingerprint::Absent => self.remove(rel),
            Fingerprint::Dir => {
                self.prepare_parent(rel)?;
                if path.is_file() || path.is_symlink() {
                    fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
                }
                fs::create_dir_all(&path).map_err(|e| io_err(&path, e))
            }
            other => {
                self.prepare_parent(rel)?;
                if path.is_dir() {
                    fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?;
                }
                let tmp = self.tmp_dir().join(format!("{}.entry", staging_name(rel)));
                fs::write(&tmp, other.to_string()).map_err(|e| io_err(&tmp, e))?;
                if let Err(e) = fs::rename(&tmp, &path) {
                    let _ = fs::remove_file(&tmp);
                    return Err(io_err(&path, e));
                }
                Ok(())
            }
        }
    }

    /// Forget `rel` and, for directories, everything below it.
    pub fn remove(&self, rel: &str) -> Result<(), CoreError> {
        types::validate(rel)?;
        if rel == ROOT {
            return Err(CoreError::InvalidPath(rel.to_string()));
        }
        let path = self.shadow_path(rel);
        let result = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_vanished(&e) => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Every ancestor of `rel` must be a directory in the mirror.
    fn prepare_parent(&self, rel: &str) -> Result<(), CoreError> {
        let parent = types::parent(rel);
        if parent == ROOT {
            return Ok(());
        }
        let mut prefix = String::new();
        for part in parent.split('/') {
            prefix = types::join(if prefix.is_empty() { ROOT } else { &prefix }, part);
            let path = self.shadow_path(&prefix);
            if path.is_file() {
                fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            }
        }
        let dir = self.shadow_path(parent);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))
    }
}

impl Baseline for Repository {
    fn lookup(&self, rel: &str) -> Result<Fingerprint, CoreError> {
        let path = self.shadow_path(rel);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if is_vanished(&e) => return Ok(Fingerprint::Absent),
            Err(e) => return Err(io_err(&path, e)),
        };
        if meta.is_dir() {
            return Ok(Fingerprint::Dir);
        }
        let text = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        text.parse::<Fingerprint>()
            .map_err(|e| CoreError::CorruptEntry { path, reason: e.0 })
    }

    fn children(&self, rel: &str) -> Result<Vec<String>, CoreError> {
        let path = self.shadow_path(rel);
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if is_vanished(&e) => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&path, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&path, e))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.meta.join(PID_FILE));
        // Lock is released when the handle closes.
    }
}

fn staging_name(rel: &str) -> String {
    let mut h = Sha256::new();
    h.update(rel.as_bytes());
    hex::encode(h.finalize())
}
