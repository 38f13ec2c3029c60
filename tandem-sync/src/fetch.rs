//! `getfiles` payloads: batch fetch of current file state.
//!
//! Request: newline-terminated relative paths. Response, per path:
//!
//! ```text
//! <10-byte len><path><10-byte len><fingerprint>[<10-byte len><contents>]
//! ```
//!
//! The content block is present only for regular files.

use std::fs;
use std::path::Path;

use tandem_core::{fingerprint, probe, types, Fingerprint};

use crate::error::{contract, DiffError, FileError, SyncError};
use crate::record::{length_field, parse_length_field, ChangeRecord, FIELD_WIDTH};

/// One entry of a `getfiles` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: String,
    pub fingerprint: Fingerprint,
    pub contents: Option<Vec<u8>>,
}

pub fn encode_request<S: AsRef<str>>(paths: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for path in paths {
        out.extend_from_slice(path.as_ref().as_bytes());
        out.push(b'\n');
    }
    out
}

pub fn parse_request(payload: &[u8]) -> Result<Vec<String>, SyncError> {
    let text = std::str::from_utf8(payload).map_err(|_| contract("getfiles list is not UTF-8"))?;
    let mut paths = Vec::new();
    for line in text.split_terminator('\n') {
        types::validate(line).map_err(|e| contract(e.to_string()))?;
        paths.push(line.to_string());
    }
    Ok(paths)
}

/// Probe and read every requested path under `root`.
pub fn build_response(root: &Path, paths: &[String]) -> Result<Vec<u8>, DiffError> {
    let mut out = Vec::new();
    for rel in paths {
        let path = types::to_fs(root, rel);
        let fp = probe(&path).map_err(|e| FileError::Unreadable {
            path: rel.clone(),
            source: e,
        })?;
        let stat = fp.to_string();
        out.extend_from_slice(length_field(rel.len()).as_bytes());
        out.extend_from_slice(rel.as_bytes());
        out.extend_from_slice(length_field(stat.len()).as_bytes());
        out.extend_from_slice(stat.as_bytes());
        if let Some(size) = fp.file_size() {
            let data = fs::read(&path).map_err(|e| {
                if fingerprint::is_vanished(&e) {
                    FileError::Vanished { path: rel.clone() }
                } else {
                    FileError::Unreadable {
                        path: rel.clone(),
                        source: e,
                    }
                }
            })?;
            if data.len() as u64 != size {
                return Err(FileError::SizeMismatch {
                    path: rel.clone(),
                    expected: size,
                    actual: data.len() as u64,
                }
                .into());
            }
            out.extend_from_slice(length_field(data.len()).as_bytes());
            out.extend_from_slice(&data);
        }
    }
    Ok(out)
}

pub fn parse_response(payload: &[u8]) -> Result<Vec<FetchedFile>, SyncError> {
    let mut cursor = Cursor { buf: payload, pos: 0 };
    let mut files = Vec::new();
    while !cursor.done() {
        let path = cursor.utf8_field("path")?;
        types::validate(&path).map_err(|e| contract(e.to_string()))?;
        let fingerprint: Fingerprint = cursor
            .utf8_field("stat")?
            .parse()
            .map_err(|e: fingerprint::FingerprintParseError| contract(e.to_string()))?;
        let contents = match fingerprint.file_size() {
            Some(size) => {
                let data = cursor.field("contents")?;
                if data.len() as u64 != size {
                    return Err(contract(format!("getfiles: {path} has {} bytes, stat says {size}", data.len())));
                }
                Some(data.to_vec())
            }
            None => None,
        };
        files.push(FetchedFile {
            path,
            fingerprint,
            contents,
        });
    }
    Ok(files)
}

/// Group the regular-file paths among `records` into request batches whose
/// contents stay below `ceiling`. Files that could never fit are returned
/// separately.
pub fn plan_batches(records: &[ChangeRecord], ceiling: usize) -> (Vec<Vec<String>>, Vec<String>) {
    let mut batches = Vec::new();
    let mut oversized = Vec::new();
    let mut current = Vec::new();
    let mut used = 0usize;

    for record in records {
        let Some(size) = record.target().file_size() else {
            continue;
        };
        let cost = size as usize + 3 * FIELD_WIDTH + record.path().len() + 64;
        if cost >= ceiling {
            oversized.push(record.path().to_string());
            continue;
        }
        if used + cost >= ceiling && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            used = 0;
        }
        used += cost;
        current.push(record.path().to_string());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    (batches, oversized)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn field(&mut self, what: &str) -> Result<&'a [u8], SyncError> {
        let header_end = self.pos + FIELD_WIDTH;
        if header_end > self.buf.len() {
            return Err(contract(format!("getfiles: truncated {what} length")));
        }
        let len = parse_length_field(&self.buf[self.pos..header_end])?;
        let end = header_end + len;
        if end > self.buf.len() {
            return Err(contract(format!("getfiles: truncated {what}")));
        }
        self.pos = end;
        Ok(&self.buf[header_end..end])
    }

    fn utf8_field(&mut self, what: &str) -> Result<String, SyncError> {
        let bytes = self.field(what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| contract(format!("getfiles: {what} is not UTF-8")))
    }
}
