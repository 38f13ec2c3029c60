//! Sending side of the chunked big-file transfer.
//!
//! The source is re-probed before every chunk and once more before the
//! final commit. Any change since the diff saw the file aborts the transfer
//! on every peer; the file is picked up again by the next diff cycle.

use std::fs::File;
use std::io::{ErrorKind, Read};

use tandem_core::{fingerprint, probe, Fingerprint, Repository};
use tandem_sync::FileError;

use crate::error::DaemonError;
use crate::peer::{Audience, PeerSet};
use crate::protocol::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every peer renamed the file into place.
    Committed,
    /// The source changed mid-transfer; peers discarded their staging files.
    Aborted,
}

/// Stream `rel` to `audience` in chunks of at most `chunk_size` bytes.
///
/// `expected` is the fingerprint the diff recorded; it is what peers store
/// on commit.
pub fn send_big_file(
    peers: &mut PeerSet,
    audience: Audience<'_>,
    repo: &Repository,
    rel: &str,
    expected: &Fingerprint,
    chunk_size: usize,
) -> Result<TransferOutcome, DaemonError> {
    let Some(size) = expected.file_size() else {
        return Err(DaemonError::Protocol(format!("{rel} is not a regular file")));
    };
    let path = repo.live_path(rel);
    let mut file = File::open(&path).map_err(|e| {
        if fingerprint::is_vanished(&e) {
            FileError::Vanished { path: rel.to_string() }
        } else {
            FileError::Unreadable {
                path: rel.to_string(),
                source: e,
            }
        }
    })?;

    tracing::info!(path = rel, bytes = size, "sending big file");
    peers.execute(audience, Command::BigInit, rel.as_bytes())?;

    let mut chunk = vec![0u8; chunk_size.max(1)];
    let mut sent: u64 = 0;
    loop {
        if !unchanged(&path, expected) {
            return abort(peers, audience, rel, "source changed");
        }
        let n = match file.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                abort(peers, audience, rel, "read failed")?;
                return Err(FileError::Unreadable {
                    path: rel.to_string(),
                    source: e,
                }
                .into());
            }
        };
        if n == 0 {
            break;
        }
        sent += n as u64;
        if sent > size {
            return abort(peers, audience, rel, "source grew");
        }
        peers.execute(audience, Command::ChunkRcv, &chunk[..n])?;
    }

    if sent != size || !unchanged(&path, expected) {
        return abort(peers, audience, rel, "source changed");
    }
    peers.execute(audience, Command::BigCommit, expected.to_string().as_bytes())?;
    tracing::info!(path = rel, bytes = sent, "big file committed on peers");
    Ok(TransferOutcome::Committed)
}

fn unchanged(path: &std::path::Path, expected: &Fingerprint) -> bool {
    matches!(probe(path), Ok(current) if current == *expected)
}

fn abort(
    peers: &mut PeerSet,
    audience: Audience<'_>,
    rel: &str,
    reason: &str,
) -> Result<TransferOutcome, DaemonError> {
    tracing::info!(path = rel, reason, "aborting big file transfer");
    peers.execute(audience, Command::BigAbort, b"")?;
    Ok(TransferOutcome::Aborted)
}
