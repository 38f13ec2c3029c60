//! Receiving side of the chunked big-file transfer.
//!
//! `biginit` opens a staging file, `chunkrcv` appends to it, and `bigcommit`
//! checks the final size against the sender's fingerprint before renaming
//! the file into place. `bigabort` discards the staging file.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use tandem_core::{types, Fingerprint, Repository};

use crate::apply::{ensure_parent, install_file};
use crate::error::{contract, io_err, SyncError};

#[derive(Debug)]
struct Pending {
    rel: String,
    staged: PathBuf,
    file: File,
    written: u64,
}

/// At most one transfer is in progress per connection.
#[derive(Debug, Default)]
pub struct ChunkReceiver {
    pending: Option<Pending>,
}

impl ChunkReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Start receiving `rel`. An unfinished earlier transfer is discarded.
    pub fn begin(&mut self, repo: &Repository, rel: &str) -> Result<(), SyncError> {
        types::validate(rel)?;
        if let Some(old) = self.pending.take() {
            tracing::warn!(path = %old.rel, "discarding unfinished transfer");
            discard(old);
        }
        let mut staged = repo.staging_path(rel).into_os_string();
        staged.push(".big");
        let staged = PathBuf::from(staged);
        let file = File::create(&staged).map_err(|e| io_err(&staged, e))?;
        tracing::debug!(path = rel, "big file transfer started");
        self.pending = Some(Pending {
            rel: rel.to_string(),
            staged,
            file,
            written: 0,
        });
        Ok(())
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), SyncError> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| contract("chunk received without biginit"))?;
        pending
            .file
            .write_all(chunk)
            .map_err(|e| io_err(&pending.staged, e))?;
        pending.written += chunk.len() as u64;
        Ok(())
    }

    /// Finish the transfer: verify size, apply `fingerprint`, rename into place
    /// and update the shadow entry.
    pub fn commit(&mut self, repo: &Repository, fingerprint: &Fingerprint) -> Result<(), SyncError> {
        let mut pending = self
            .pending
            .take()
            .ok_or_else(|| contract("bigcommit without biginit"))?;

        let Fingerprint::File { mode, size, mtime } = *fingerprint else {
            discard(pending);
            return Err(contract(format!("bigcommit with non-file stat {fingerprint:?}")));
        };
        if size != pending.written {
            let rel = pending.rel.clone();
            let written = pending.written;
            discard(pending);
            return Err(contract(format!(
                "big file {rel}: received {written} bytes, stat says {size}"
            )));
        }
        if let Err(e) = pending.file.flush() {
            let staged = pending.staged.clone();
            discard(pending);
            return Err(io_err(staged, e));
        }

        let Pending { rel, staged, file, .. } = pending;
        drop(file);
        if let Err(e) = ensure_parent(repo, &rel) {
            let _ = fs::remove_file(&staged);
            return Err(e);
        }
        install_file(repo, &rel, &staged, mode, mtime)?;
        repo.put(&rel, fingerprint)?;
        tracing::info!(path = %rel, bytes = size, "big file received");
        Ok(())
    }

    /// Drop the in-progress transfer. Aborting with nothing pending is allowed.
    pub fn abort(&mut self) {
        match self.pending.take() {
            Some(pending) => {
                tracing::info!(path = %pending.rel, "big file transfer aborted");
                discard(pending);
            }
            None => tracing::debug!("bigabort with no transfer in progress"),
        }
    }
}

impl Drop for ChunkReceiver {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            discard(pending);
        }
    }
}

fn discard(pending: Pending) {
    let Pending { staged, file, .. } = pending;
    drop(file);
    let _ = fs::remove_file(staged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{probe, Baseline, ExcludeSet};
    use tempfile::TempDir;

    fn fp(size: u64) -> Fingerprint {
        Fingerprint::File {
            mode: 0o600,
            size,
            mtime: 1_600_000_000,
        }
    }

    #[test]
    fn chunks_are_assembled_and_committed() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();
        let mut rx = ChunkReceiver::new();

        rx.begin(&repo, "media/clip.bin").unwrap();
        rx.write_chunk(b"abc").unwrap();
        rx.write_chunk(b"def").unwrap();
        rx.commit(&repo, &fp(6)).unwrap();

        assert!(!rx.is_pending());
        let dest = tmp.path().join("media/clip.bin");
        assert_eq!(fs::read(&dest).unwrap(), b"abcdef");
        assert_eq!(probe(&dest).unwrap(), fp(6));
        assert_eq!(repo.lookup("media/clip.bin").unwrap(), fp(6));
    }

    #[test]
    fn abort_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();
        let mut rx = ChunkReceiver::new();

        rx.begin(&repo, "big").unwrap();
        rx.write_chunk(b"partial").unwrap();
        rx.abort();

        assert!(!tmp.path().join("big").exists());
        assert_eq!(fs::read_dir(repo.tmp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn size_mismatch_refuses_commit() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();
        let mut rx = ChunkReceiver::new();

        rx.begin(&repo, "big").unwrap();
        rx.write_chunk(b"1234").unwrap();
        let err = rx.commit(&repo, &fp(10)).unwrap_err();
        assert!(matches!(err, SyncError::Contract(_)), "{err}");
        assert!(!tmp.path().join("big").exists());
    }

    #[test]
    fn chunk_without_init_is_a_contract_error() {
        let mut rx = ChunkReceiver::new();
        assert!(matches!(rx.write_chunk(b"x"), Err(SyncError::Contract(_))));
    }
}
