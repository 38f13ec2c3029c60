//! Diff Stream wire format.
//!
//! A stream is a concatenation of records, each terminated by [`SEPARATOR`]:
//!
//! ```text
//! A <path>\n<new fingerprint>SEP[<10-byte len><contents>]
//! M <path>\n<old fingerprint>\n\n<new fingerprint>SEP[<10-byte len><contents>]
//! D <path>\n<old fingerprint>SEP
//! ```
//!
//! The bracketed content block is present only for regular files in a
//! content-carrying stream.

use std::fmt;

use tandem_core::{types, Fingerprint};

use crate::error::{contract, SyncError};

/// Literal record terminator.
pub const SEPARATOR: &[u8] = b"\n------------\n";

/// Width of every length and command-name field on the wire.
pub const FIELD_WIDTH: usize = 10;

/// Prefix of the "nothing here yet" reply to the `diff` command.
pub const EMPTY_HEADER: &str = "EMPTY:";
const EMPTY_LOCAL: &str = "local\n";
const EMPTY_REPO: &str = "repo\n";

/// Prefix of a `diff` reply page that is not the last one.
pub const MORE_HEADER: &str = "MORE:";

/// Right-aligned, space-padded 10-byte decimal.
pub fn length_field(len: usize) -> String {
    format!("{len:>width$}", width = FIELD_WIDTH)
}

/// Decode a 10-byte length field.
pub fn parse_length_field(field: &[u8]) -> Result<usize, SyncError> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or_else(|| contract(format!("bad length field {:?}", String::from_utf8_lossy(field))))
}

// ---------------------------------------------------------------------------
// Change records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    Added {
        path: String,
        fingerprint: Fingerprint,
        contents: Option<Vec<u8>>,
    },
    Modified {
        path: String,
        previous: Fingerprint,
        fingerprint: Fingerprint,
        contents: Option<Vec<u8>>,
    },
    Deleted {
        path: String,
        previous: Fingerprint,
    },
}

impl ChangeRecord {
    pub fn path(&self) -> &str {
        match self {
            ChangeRecord::Added { path, .. }
            | ChangeRecord::Modified { path, .. }
            | ChangeRecord::Deleted { path, .. } => path,
        }
    }

    /// Fingerprint the path has after this record; `Absent` for deletions.
    pub fn target(&self) -> &Fingerprint {
        const ABSENT: &Fingerprint = &Fingerprint::Absent;
        match self {
            ChangeRecord::Added { fingerprint, .. } | ChangeRecord::Modified { fingerprint, .. } => {
                fingerprint
            }
            ChangeRecord::Deleted { .. } => ABSENT,
        }
    }

    pub fn contents(&self) -> Option<&[u8]> {
        match self {
            ChangeRecord::Added { contents, .. } | ChangeRecord::Modified { contents, .. } => {
                contents.as_deref()
            }
            ChangeRecord::Deleted { .. } => None,
        }
    }

    /// Same record with `contents` attached (ignored for deletions).
    pub fn with_contents(self, data: Option<Vec<u8>>) -> Self {
        match self {
            ChangeRecord::Added {
                path, fingerprint, ..
            } => ChangeRecord::Added {
                path,
                fingerprint,
                contents: data,
            },
            ChangeRecord::Modified {
                path,
                previous,
                fingerprint,
                ..
            } => ChangeRecord::Modified {
                path,
                previous,
                fingerprint,
                contents: data,
            },
            deleted => deleted,
        }
    }

    pub fn tag(&self) -> char {
        match self {
            ChangeRecord::Added { .. } => 'A',
            ChangeRecord::Modified { .. } => 'M',
            ChangeRecord::Deleted { .. } => 'D',
        }
    }

    /// Tag, path, metadata and separator, without any content block.
    pub fn header(&self) -> Vec<u8> {
        let meta = match self {
            ChangeRecord::Added { fingerprint, .. } => fingerprint.to_string(),
            ChangeRecord::Modified {
                previous,
                fingerprint,
                ..
            } => format!("{previous}\n\n{fingerprint}"),
            ChangeRecord::Deleted { previous, .. } => previous.to_string(),
        };
        let mut out = format!("{} {}\n{meta}", self.tag(), self.path()).into_bytes();
        out.extend_from_slice(SEPARATOR);
        out
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.tag(), self.path())
    }
}

/// True when a record for `fingerprint` carries a content block in a
/// content-carrying stream.
pub fn carries_contents(fingerprint: &Fingerprint) -> bool {
    matches!(fingerprint, Fingerprint::File { .. })
}

// ---------------------------------------------------------------------------
// Diff stream
// ---------------------------------------------------------------------------

/// Growing serialized diff. Owned by whoever drives the walk; never shared.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiffStream {
    buf: Vec<u8>,
    records: usize,
}

impl DiffStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Append a record; its content block is written only if present.
    pub fn push(&mut self, record: &ChangeRecord) {
        self.buf.extend_from_slice(&record.header());
        if let Some(data) = record.contents() {
            self.buf.extend_from_slice(length_field(data.len()).as_bytes());
            self.buf.extend_from_slice(data);
        }
        self.records += 1;
    }

    /// Hand the accumulated bytes out, leaving an empty stream behind.
    pub fn take(&mut self) -> DiffStream {
        std::mem::take(self)
    }
}

impl FromIterator<ChangeRecord> for DiffStream {
    fn from_iter<I: IntoIterator<Item = ChangeRecord>>(iter: I) -> Self {
        let mut stream = DiffStream::new();
        for record in iter {
            stream.push(&record);
        }
        stream
    }
}

/// Decode a stream. With `with_contents`, every A/M record for a regular file
/// must be followed by its content block.
pub fn parse_stream(bytes: &[u8], with_contents: bool) -> Result<Vec<ChangeRecord>, SyncError> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let Some(end) = find(&bytes[offset..], SEPARATOR).map(|p| p + offset) else {
            return Err(contract(format!("trailing bytes without separator at {offset}")));
        };
        let chunk = std::str::from_utf8(&bytes[offset..end])
            .map_err(|_| contract(format!("record at {offset} is not UTF-8")))?;
        offset = end + SEPARATOR.len();

        let (first, meta) = chunk
            .split_once('\n')
            .ok_or_else(|| contract(format!("no newline in diff record {chunk:?}")))?;
        let (tag, path) = first
            .split_once(' ')
            .ok_or_else(|| contract(format!("no path in diff record {chunk:?}")))?;
        if path.is_empty() {
            return Err(contract(format!("empty path in diff record {chunk:?}")));
        }
        types::validate(path).map_err(|e| contract(e.to_string()))?;
        let path = path.to_string();

        let record = match tag {
            "A" => ChangeRecord::Added {
                path,
                fingerprint: parse_fingerprint(meta)?,
                contents: None,
            },
            "M" => {
                let (old, new) = meta
                    .split_once("\n\n")
                    .ok_or_else(|| contract(format!("M record without two stats: {chunk:?}")))?;
                ChangeRecord::Modified {
                    path,
                    previous: parse_fingerprint(old)?,
                    fingerprint: parse_fingerprint(new)?,
                    contents: None,
                }
            }
            "D" => ChangeRecord::Deleted {
                path,
                previous: parse_fingerprint(meta)?,
            },
            other => return Err(contract(format!("unknown diff op {other:?}"))),
        };

        let record = if with_contents && carries_contents(record.target()) {
            let header_end = offset + FIELD_WIDTH;
            if header_end > bytes.len() {
                return Err(contract(format!("truncated content header for {record}")));
            }
            let len = parse_length_field(&bytes[offset..header_end])?;
            let data_end = header_end + len;
            if data_end > bytes.len() {
                return Err(contract(format!("truncated contents for {record}")));
            }
            if Some(len as u64) != record.target().file_size() {
                return Err(contract(format!("content length {len} disagrees with stat for {record}")));
            }
            let data = bytes[header_end..data_end].to_vec();
            offset = data_end;
            record.with_contents(Some(data))
        } else {
            record
        };
        records.push(record);
    }

    Ok(records)
}

fn parse_fingerprint(text: &str) -> Result<Fingerprint, SyncError> {
    text.parse::<Fingerprint>().map_err(|e| contract(e.to_string()))
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Reply to the `diff` command
// ---------------------------------------------------------------------------

/// What a peer answers when asked for its diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffReply {
    /// Live tree and/or shadow are empty; a full bootstrap push is needed.
    Empty { local: bool, repo: bool },
    /// One page of a metadata-only stream; further pages follow.
    Partial(Vec<u8>),
    /// The last (or only) page of a metadata-only stream, possibly empty.
    Stream(Vec<u8>),
}

impl DiffReply {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DiffReply::Empty { local, repo } => {
                let mut s = EMPTY_HEADER.to_string();
                if *local {
                    s.push_str(EMPTY_LOCAL);
                }
                if *repo {
                    s.push_str(EMPTY_REPO);
                }
                s.into_bytes()
            }
            DiffReply::Partial(bytes) => {
                let mut out = Vec::with_capacity(MORE_HEADER.len() + bytes.len());
                out.extend_from_slice(MORE_HEADER.as_bytes());
                out.extend_from_slice(bytes);
                out
            }
            DiffReply::Stream(bytes) => bytes.clone(),
        }
    }

    pub fn decode(bytes: Vec<u8>) -> Self {
        if let Some(rest) = bytes.strip_prefix(EMPTY_HEADER.as_bytes()) {
            let rest = String::from_utf8_lossy(rest);
            return DiffReply::Empty {
                local: rest.contains(EMPTY_LOCAL),
                repo: rest.contains(EMPTY_REPO),
            };
        }
        match bytes.strip_prefix(MORE_HEADER.as_bytes()) {
            Some(rest) => DiffReply::Partial(rest.to_vec()),
            None => DiffReply::Stream(bytes),
        }
    }
}

/// Which tree a `diff` request compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffScope {
    /// Live tree against the peer's shadow: its offline changes.
    Shadow,
    /// Live tree against nothing: a listing of everything the peer has.
    Live,
}

/// Payload of the `diff` command. An empty payload is the first page of
/// the shadow diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffRequest {
    pub scope: DiffScope,
    pub page: usize,
}

impl DiffRequest {
    pub fn new(scope: DiffScope, page: usize) -> Self {
        Self { scope, page }
    }

    pub fn encode(&self) -> Vec<u8> {
        let scope = match self.scope {
            DiffScope::Shadow => "shadow",
            DiffScope::Live => "live",
        };
        format!("{scope} {}", self.page).into_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, SyncError> {
        if payload.is_empty() {
            return Ok(Self::new(DiffScope::Shadow, 0));
        }
        let text = std::str::from_utf8(payload).map_err(|_| contract("diff request is not UTF-8"))?;
        let (scope, page) = text
            .split_once(' ')
            .ok_or_else(|| contract(format!("malformed diff request '{text}'")))?;
        let scope = match scope {
            "shadow" => DiffScope::Shadow,
            "live" => DiffScope::Live,
            other => return Err(contract(format!("unknown diff scope '{other}'"))),
        };
        let page = page
            .parse()
            .map_err(|_| contract(format!("diff page is not a number: '{page}'")))?;
        Ok(Self::new(scope, page))
    }
}
