//! Diff engine: live tree against a [`Baseline`].
//!
//! The walk threads the growing [`DiffStream`] explicitly through every call.
//! Whenever the next record would push the buffer to the memory ceiling, the
//! buffered part is handed to the [`DiffSink`] (which sends and commits it)
//! and the walk continues with an empty buffer. A single file too large to
//! inline at all goes to [`DiffSink::big_file`] instead.

use std::fs;
use std::path::Path;

use tandem_core::{fingerprint, types, Baseline, ExcludeSet, Fingerprint, ROOT};

use crate::error::{DiffError, FileError, SyncError};
use crate::record::{carries_contents, ChangeRecord, DiffStream, FIELD_WIDTH};

/// Knobs for one diff computation.
#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    /// Upper bound on the buffered stream, in bytes.
    pub ceiling: usize,
    /// Inline file contents after A/M records of regular files.
    pub with_contents: bool,
}

/// Receiver for the parts of a diff that cannot stay in the buffer.
pub trait DiffSink {
    /// Deliver (and commit) a full buffer.
    fn flush(&mut self, stream: DiffStream) -> Result<(), DiffError>;

    /// Transfer one oversized regular file out of band.
    fn big_file(&mut self, rel: &str, fingerprint: &Fingerprint) -> Result<(), DiffError>;
}

/// Sink for callers that must receive the whole diff in one buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferOnly {
    pub ceiling: usize,
}

impl DiffSink for BufferOnly {
    fn flush(&mut self, _stream: DiffStream) -> Result<(), DiffError> {
        Err(SyncError::CeilingExceeded {
            ceiling: self.ceiling,
        }
        .into())
    }

    fn big_file(&mut self, _rel: &str, _fingerprint: &Fingerprint) -> Result<(), DiffError> {
        Err(SyncError::CeilingExceeded {
            ceiling: self.ceiling,
        }
        .into())
    }
}

/// Sink that keeps only the `wanted`-th flushed part and drops the others,
/// so a metadata diff larger than the ceiling is served one page per walk.
/// Pages are numbered from zero; the unflushed remainder is the last page.
#[derive(Debug)]
pub struct Pager {
    ceiling: usize,
    wanted: usize,
    seen: usize,
    page: Option<DiffStream>,
}

impl Pager {
    pub fn new(ceiling: usize, wanted: usize) -> Self {
        Self {
            ceiling,
            wanted,
            seen: 0,
            page: None,
        }
    }

    /// The wanted page given the stream `compute_diff` returned, and
    /// whether further pages follow it.
    pub fn finish(self, rest: DiffStream) -> (DiffStream, bool) {
        match self.page {
            Some(page) => (page, true),
            None if self.seen == self.wanted => (rest, false),
            // The tree shrank between walks; nothing is left to report.
            None => (DiffStream::new(), false),
        }
    }
}

impl DiffSink for Pager {
    fn flush(&mut self, stream: DiffStream) -> Result<(), DiffError> {
        if self.seen == self.wanted {
            self.page = Some(stream);
        }
        self.seen += 1;
        Ok(())
    }

    fn big_file(&mut self, _rel: &str, _fingerprint: &Fingerprint) -> Result<(), DiffError> {
        Err(SyncError::CeilingExceeded {
            ceiling: self.ceiling,
        }
        .into())
    }
}

/// Where a record ended up after the ceiling check.
enum Placement {
    Inline,
    Offloaded,
}

struct Walk<'a> {
    root: &'a Path,
    baseline: &'a dyn Baseline,
    exclude: &'a ExcludeSet,
    options: DiffOptions,
    sink: &'a mut dyn DiffSink,
}

/// Diff the directories `dirs` (relative paths, `"."` for the root).
///
/// Non-recursive mode compares only the direct entries of each directory;
/// unchanged subdirectories are not descended into. New subtrees are always
/// emitted in full. Returns whatever is still buffered after any flushes.
pub fn compute_diff(
    root: &Path,
    baseline: &dyn Baseline,
    exclude: &ExcludeSet,
    dirs: &[String],
    recursive: bool,
    options: DiffOptions,
    sink: &mut dyn DiffSink,
) -> Result<DiffStream, DiffError> {
    let mut walk = Walk {
        root,
        baseline,
        exclude,
        options,
        sink,
    };
    let mut out = DiffStream::new();
    for dir in dirs {
        types::validate(dir)?;
        walk.diff_dir(dir, recursive, &mut out)?;
    }
    Ok(out)
}

impl Walk<'_> {
    fn diff_dir(&mut self, dir: &str, recursive: bool, out: &mut DiffStream) -> Result<(), DiffError> {
        for name in self.live_children(dir)? {
            let rel = types::join(dir, &name);
            let live = self.probe(&rel)?;
            if live.is_absent() {
                return Err(FileError::Vanished { path: rel }.into());
            }
            let shadow = self.baseline.lookup(&rel)?;

            if shadow.is_absent() {
                if live.is_dir() {
                    self.add_subtree(&rel, true, out)?;
                } else {
                    let record = ChangeRecord::Added {
                        path: rel,
                        fingerprint: live,
                        contents: None,
                    };
                    self.emit(record, out)?;
                }
                continue;
            }

            if shadow == live {
                if live.is_dir() && recursive {
                    self.diff_dir(&rel, recursive, out)?;
                }
                continue;
            }

            let became_dir = live.is_dir();
            let record = ChangeRecord::Modified {
                path: rel.clone(),
                previous: shadow,
                fingerprint: live,
                contents: None,
            };
            self.emit(record, out)?;
            if became_dir {
                self.add_subtree(&rel, false, out)?;
            }
        }

        // Second pass: shadow entries with no live counterpart.
        for name in self.baseline.children(dir)? {
            if self.exclude.is_excluded(&name) {
                continue;
            }
            let rel = types::join(dir, &name);
            if !self.probe(&rel)?.is_absent() {
                continue;
            }
            let previous = self.baseline.lookup(&rel)?;
            self.emit(ChangeRecord::Deleted { path: rel, previous }, out)?;
        }
        Ok(())
    }

    /// Emit `A` for a new directory (when `include_self`) and everything below.
    fn add_subtree(&mut self, dir: &str, include_self: bool, out: &mut DiffStream) -> Result<(), DiffError> {
        if include_self {
            let record = ChangeRecord::Added {
                path: dir.to_string(),
                fingerprint: Fingerprint::Dir,
                contents: None,
            };
            self.emit(record, out)?;
        }

        let names = match self.live_children(dir) {
            Ok(names) => names,
            Err(DiffError::File(e)) => {
                tracing::debug!(dir, error = %e, "new directory vanished while listing");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for name in names {
            let rel = types::join(dir, &name);
            let live = self.probe(&rel)?;
            match live {
                Fingerprint::Absent => {
                    tracing::debug!(path = %rel, "cannot lstat new entry, skipping");
                }
                Fingerprint::Dir => self.add_subtree(&rel, true, out)?,
                fingerprint => {
                    let record = ChangeRecord::Added {
                        path: rel,
                        fingerprint,
                        contents: None,
                    };
                    self.emit(record, out)?;
                }
            }
        }
        Ok(())
    }

    /// Append one record (plus contents) subject to the ceiling.
    fn emit(&mut self, record: ChangeRecord, out: &mut DiffStream) -> Result<(), DiffError> {
        let header_len = record.header().len();
        let inline = self.options.with_contents && carries_contents(record.target());
        let content_len = if inline {
            record.target().file_size().unwrap_or(0) as usize + FIELD_WIDTH
        } else {
            0
        };

        if let Placement::Offloaded = self.reserve(&record, header_len + content_len, out)? {
            return Ok(());
        }

        let record = if inline {
            let data = self.read_contents(record.path(), record.target())?;
            record.with_contents(Some(data))
        } else {
            record
        };
        out.push(&record);
        Ok(())
    }

    fn reserve(&mut self, record: &ChangeRecord, needed: usize, out: &mut DiffStream) -> Result<Placement, DiffError> {
        let ceiling = self.options.ceiling;
        if needed >= ceiling {
            if carries_contents(record.target()) && self.options.with_contents {
                self.sink.big_file(record.path(), record.target())?;
                return Ok(Placement::Offloaded);
            }
            return Err(SyncError::CeilingExceeded { ceiling }.into());
        }
        if out.len() + needed >= ceiling {
            tracing::debug!(buffered = out.len(), "diff buffer full, flushing");
            self.sink.flush(out.take())?;
        }
        Ok(Placement::Inline)
    }

    fn read_contents(&self, rel: &str, fingerprint: &Fingerprint) -> Result<Vec<u8>, DiffError> {
        let path = types::to_fs(self.root, rel);
        let data = fs::read(&path).map_err(|e| {
            if fingerprint::is_vanished(&e) {
                FileError::Vanished {
                    path: rel.to_string(),
                }
            } else {
                FileError::Unreadable {
                    path: rel.to_string(),
                    source: e,
                }
            }
        })?;
        let expected = fingerprint.file_size().unwrap_or(0);
        if data.len() as u64 != expected {
            return Err(FileError::SizeMismatch {
                path: rel.to_string(),
                expected,
                actual: data.len() as u64,
            }
            .into());
        }
        Ok(data)
    }

    fn probe(&self, rel: &str) -> Result<Fingerprint, DiffError> {
        fingerprint::probe(&types::to_fs(self.root, rel)).map_err(|e| {
            FileError::Unreadable {
                path: rel.to_string(),
                source: e,
            }
            .into()
        })
    }

    /// Sorted, synchronizable entry names of a live directory.
    fn live_children(&self, dir: &str) -> Result<Vec<String>, DiffError> {
        list_live(self.root, dir, self.exclude)
    }
}

/// Entry names under the live directory `dir`, sorted, with excluded names,
/// special files, and names that cannot travel on the wire filtered out.
pub fn list_live(root: &Path, dir: &str, exclude: &ExcludeSet) -> Result<Vec<String>, DiffError> {
    let path = types::to_fs(root, dir);
    let entries = fs::read_dir(&path).map_err(|e| {
        if fingerprint::is_vanished(&e) {
            FileError::Vanished {
                path: dir.to_string(),
            }
        } else {
            FileError::Unreadable {
                path: dir.to_string(),
                source: e,
            }
        }
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| FileError::Unreadable {
            path: dir.to_string(),
            source: e,
        })?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            tracing::warn!(dir, name = ?entry.file_name(), "skipping non UTF-8 name");
            continue;
        };
        if exclude.is_excluded(&name) {
            continue;
        }
        if name.contains('\n') || name.contains('\\') {
            tracing::warn!(dir, name = %name.escape_debug(), "skipping name that cannot be synchronized");
            continue;
        }
        match entry.file_type() {
            Ok(ty) if ty.is_file() || ty.is_dir() || ty.is_symlink() => names.push(name),
            Ok(_) => tracing::debug!(dir, name = %name, "skipping special file"),
            // Raced with a removal: the probe reports it as vanished.
            Err(_) => names.push(name),
        }
    }
    names.sort();
    Ok(names)
}

/// Whether `dir` exists live and has no synchronizable entries.
pub fn live_is_empty(root: &Path, exclude: &ExcludeSet) -> Result<bool, DiffError> {
    Ok(list_live(root, ROOT, exclude)?.is_empty())
}
