//! Filesystem prober and the canonical metadata fingerprint.
//!
//! The textual form doubles as the shadow entry file contents and as the
//! metadata block of a diff record:
//!
//! ```text
//! dir
//! symlink=<target>
//! mode=644
//! size=5
//! mtime=1700000000
//! ```
//!
//! An absent entry encodes as the empty string.

use std::fmt;
use std::fs::{self, Metadata};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::str::FromStr;

/// Permission bits that survive normalization.
pub const MODE_MASK: u32 = 0o777;

/// Canonical modes used where the platform has no POSIX bit granularity.
pub const MODE_FULLY_OPEN: u32 = 0o777;
pub const MODE_OWNER_GROUP_READ: u32 = 0o440;

/// Metadata signature of one filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    Absent,
    Dir,
    Symlink { target: String },
    File { mode: u32, size: u64, mtime: i64 },
}

impl Fingerprint {
    pub fn is_absent(&self) -> bool {
        matches!(self, Fingerprint::Absent)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Fingerprint::Dir)
    }

    /// Byte size of a regular file, `None` for every other kind.
    pub fn file_size(&self) -> Option<u64> {
        match self {
            Fingerprint::File { size, .. } => Some(*size),
            _ => None,
        }
    }

    /// Build a fingerprint from `lstat` metadata. Special files (fifos,
    /// sockets, devices) are not synchronized and map to [`Fingerprint::Absent`].
    pub fn from_metadata(meta: &Metadata, link_target: Option<String>) -> Self {
        let ty = meta.file_type();
        if ty.is_symlink() {
            return Fingerprint::Symlink {
                target: link_target.unwrap_or_default(),
            };
        }
        if ty.is_dir() {
            return Fingerprint::Dir;
        }
        if !ty.is_file() {
            return Fingerprint::Absent;
        }
        Fingerprint::File {
            mode: normalized_mode(meta),
            size: meta.len(),
            mtime: mtime_seconds(meta),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::Absent => Ok(()),
            Fingerprint::Dir => f.write_str("dir"),
            Fingerprint::Symlink { target } => write!(f, "symlink={target}"),
            Fingerprint::File { mode, size, mtime } => {
                write!(f, "mode={mode:o}\nsize={size}\nmtime={mtime}")
            }
        }
    }
}

/// Failure to decode the textual fingerprint form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintParseError(pub String);

impl fmt::Display for FingerprintParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed fingerprint: {}", self.0)
    }
}

impl std::error::Error for FingerprintParseError {}

impl FromStr for Fingerprint {
    type Err = FingerprintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Fingerprint::Absent);
        }
        if s == "dir" {
            return Ok(Fingerprint::Dir);
        }
        if let Some(target) = s.strip_prefix("symlink=") {
            return Ok(Fingerprint::Symlink {
                target: target.to_string(),
            });
        }

        let mut mode = None;
        let mut size = None;
        let mut mtime = None;
        for line in s.lines() {
            let Some((key, value)) = line.split_once('=') else {
                return Err(FingerprintParseError(format!("line without '=': {line:?}")));
            };
            let bad = |_| FingerprintParseError(format!("bad value for {key}: {value:?}"));
            match key {
                "mode" => mode = Some(u32::from_str_radix(value, 8).map_err(bad)?),
                "size" => size = Some(value.parse::<u64>().map_err(bad)?),
                "mtime" => mtime = Some(value.parse::<i64>().map_err(bad)?),
                other => return Err(FingerprintParseError(format!("unknown field {other:?}"))),
            }
        }

        match (mode, size, mtime) {
            (Some(mode), Some(size), Some(mtime)) => Ok(Fingerprint::File { mode, size, mtime }),
            _ => Err(FingerprintParseError(format!("incomplete file stat: {s:?}"))),
        }
    }
}

/// Compute the fingerprint of `path` without following a final symlink.
///
/// A vanished path (or one whose parent stopped being a directory) yields
/// [`Fingerprint::Absent`] rather than an error.
pub fn probe(path: &Path) -> io::Result<Fingerprint> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if is_vanished(&err) => return Ok(Fingerprint::Absent),
        Err(err) => return Err(err),
    };

    let target = if meta.file_type().is_symlink() {
        match fs::read_link(path) {
            Ok(target) => Some(target.to_string_lossy().into_owned()),
            Err(err) if is_vanished(&err) => return Ok(Fingerprint::Absent),
            Err(err) => return Err(err),
        }
    } else {
        None
    };

    Ok(Fingerprint::from_metadata(&meta, target))
}

/// `NotFound`, or `NotADirectory` when an ancestor was replaced by a file.
pub fn is_vanished(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

#[cfg(unix)]
fn normalized_mode(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & MODE_MASK
}

#[cfg(not(unix))]
fn normalized_mode(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        MODE_OWNER_GROUP_READ
    } else {
        MODE_FULLY_OPEN
    }
}

#[cfg(unix)]
fn mtime_seconds(meta: &Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime()
}

#[cfg(not(unix))]
fn mtime_seconds(meta: &Metadata) -> i64 {
    use std::time::UNIX_EPOCH;
    match meta.modified().map(|t| t.duration_since(UNIX_EPOCH)) {
        Ok(Ok(after)) => after.as_secs() as i64,
        Ok(Err(before)) => -(before.duration().as_secs() as i64),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use tempfile::TempDir;

    #[test]
    fn text_form_round_trips_for_every_kind() {
        let cases = [
            Fingerprint::Absent,
            Fingerprint::Dir,
            Fingerprint::Symlink {
                target: "../shared/lib.so".to_string(),
            },
            Fingerprint::File {
                mode: 0o644,
                size: 5,
                mtime: 1_700_000_000,
            },
        ];
        for fp in cases {
            let text = fp.to_string();
            assert_eq!(text.parse::<Fingerprint>().unwrap(), fp, "text: {text:?}");
        }
    }

    #[test]
    fn file_text_uses_octal_mode() {
        let fp = Fingerprint::File {
            mode: 0o755,
            size: 12,
            mtime: 42,
        };
        assert_eq!(fp.to_string(), "mode=755\nsize=12\nmtime=42");
    }

    #[test]
    fn parse_rejects_incomplete_stat() {
        assert!("mode=644\nsize=5".parse::<Fingerprint>().is_err());
        assert!("garbage".parse::<Fingerprint>().is_err());
        assert!("mode=9z\nsize=1\nmtime=1".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn probe_missing_path_is_absent() {
        let tmp = TempDir::new().unwrap();
        let fp = probe(&tmp.path().join("nope")).unwrap();
        assert_eq!(fp, Fingerprint::Absent);
    }

    #[test]
    fn probe_below_a_file_is_absent() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plain");
        fs::write(&file, "x").unwrap();
        assert_eq!(probe(&file.join("child")).unwrap(), Fingerprint::Absent);
    }

    #[test]
    fn unchanged_file_probes_equal_and_touch_changes_it() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.txt");
        fs::write(&file, "hello").unwrap();
        set_file_mtime(&file, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

        let first = probe(&file).unwrap();
        let second = probe(&file).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.file_size(), Some(5));

        set_file_mtime(&file, FileTime::from_unix_time(1_600_000_100, 0)).unwrap();
        assert_ne!(probe(&file).unwrap(), first, "touch must change fingerprint");
    }

    #[test]
    fn truncate_changes_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.txt");
        fs::write(&file, "hello").unwrap();
        let mtime = FileTime::from_unix_time(1_600_000_000, 0);
        set_file_mtime(&file, mtime).unwrap();
        let before = probe(&file).unwrap();

        fs::write(&file, "hel").unwrap();
        set_file_mtime(&file, mtime).unwrap();
        assert_ne!(probe(&file).unwrap(), before, "size change must be visible");
    }

    #[test]
    #[cfg(unix)]
    fn chmod_changes_fingerprint() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("script.sh");
        fs::write(&file, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();
        let before = probe(&file).unwrap();

        fs::set_permissions(&file, fs::Permissions::from_mode(0o755)).unwrap();
        let after = probe(&file).unwrap();
        assert_ne!(before, after);
        assert!(matches!(after, Fingerprint::File { mode: 0o755, .. }));
    }

    #[test]
    #[cfg(unix)]
    fn probe_does_not_follow_symlinks() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink("target-that-does-not-exist", &link).unwrap();
        assert_eq!(
            probe(&link).unwrap(),
            Fingerprint::Symlink {
                target: "target-that-does-not-exist".to_string()
            }
        );
    }

    #[test]
    fn path_below_a_file_probes_as_absent() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("plain"), "x").unwrap();
        let err = std::fs::metadata(tmp.path().join("plain/child")).unwrap_err();
        assert!(is_vanished(&err), "{err:?}");
        assert_eq!(probe(&tmp.path().join("plain/child")).unwrap(), Fingerprint::Absent);
    }
}
