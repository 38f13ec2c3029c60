//! Client-side propagation: diff local changes, deliver them to peers,
//! commit what was delivered. Also the startup reconciliation that brings
//! peers and the local tree together before the watch loop starts.

use std::collections::{HashMap, HashSet};
use std::process::{Command as Process, Stdio};
use std::time::Duration;

use tandem_core::{probe, types, Baseline, Config, EmptyBaseline, Fingerprint, Repository, ROOT};
use tandem_sync::fetch::{self, FetchedFile};
use tandem_sync::record::FIELD_WIDTH;
use tandem_sync::{
    apply_records, commit_dir, commit_stream, compute_diff, parse_stream, ChangeRecord, DiffError,
    DiffOptions, DiffReply, DiffRequest, DiffScope, DiffSink, DiffStream, SEPARATOR,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{RETRY_ATTEMPTS, RETRY_DELAY};
use crate::peer::{Audience, PeerSet};
use crate::protocol::Command;
use crate::retry::retry_recoverable;
use crate::transfer::{send_big_file, TransferOutcome};

// ---------------------------------------------------------------------------
// 1. Delivery sink
// ---------------------------------------------------------------------------

/// Sends every flushed part of a diff to `audience` and, when the diff was
/// taken against the local shadow, commits it locally right after.
struct Propagation<'a> {
    peers: &'a mut PeerSet,
    repo: &'a Repository,
    audience: Audience<'a>,
    commit_locally: bool,
    chunk_size: usize,
    sent: usize,
}

impl Propagation<'_> {
    fn deliver(&mut self, stream: DiffStream) -> Result<(), DaemonError> {
        if stream.is_empty() {
            return Ok(());
        }
        let replies = self
            .peers
            .execute(self.audience, Command::ApplyDiff, stream.as_bytes())?;
        for (peer, stats) in replies {
            tracing::info!(peer = %peer, stats = %String::from_utf8_lossy(&stats), "diff delivered");
        }
        if self.commit_locally {
            commit_stream(self.repo, stream.as_bytes(), true)?;
        }
        self.sent += stream.len();
        Ok(())
    }

    fn transfer(&mut self, rel: &str, fingerprint: &Fingerprint) -> Result<(), DaemonError> {
        let outcome = send_big_file(
            self.peers,
            self.audience,
            self.repo,
            rel,
            fingerprint,
            self.chunk_size,
        )?;
        if outcome == TransferOutcome::Committed {
            if self.commit_locally {
                self.repo.put(rel, fingerprint)?;
            }
            self.sent += fingerprint.file_size().unwrap_or(0) as usize;
        }
        Ok(())
    }
}

impl DiffSink for Propagation<'_> {
    fn flush(&mut self, stream: DiffStream) -> Result<(), DiffError> {
        self.deliver(stream).map_err(DiffError::from)
    }

    fn big_file(&mut self, rel: &str, fingerprint: &Fingerprint) -> Result<(), DiffError> {
        self.transfer(rel, fingerprint).map_err(DiffError::from)
    }
}

// ---------------------------------------------------------------------------
// 2. Engine
// ---------------------------------------------------------------------------

/// Everything the client needs to propagate: the locked repository, the
/// active peers and the tunables from the config file.
pub struct Engine {
    repo: Repository,
    peers: PeerSet,
    ceiling: usize,
    onsync: Option<String>,
    retry_delay: Duration,
}

impl Engine {
    pub fn new(repo: Repository, peers: PeerSet, config: &Config) -> Self {
        Self {
            repo,
            peers,
            ceiling: config.memory_ceiling,
            onsync: config.onsync.clone(),
            retry_delay: RETRY_DELAY,
        }
    }

    /// Shorten the pause between recoverable retries.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Propagate changes in exactly `dirs` (non-recursive). Recoverable file
    /// errors are retried; when retries run out the batch is dropped and the
    /// next change picks it up. Returns the number of bytes delivered.
    pub fn sync_dirs(&mut self, dirs: &[String]) -> Result<usize, DaemonError> {
        let dirs = drop_covered(&self.repo, dirs)?;
        self.sync(&dirs, false)
    }

    /// Propagate every difference between the whole tree and the shadow.
    pub fn push_full(&mut self) -> Result<usize, DaemonError> {
        self.sync(&[ROOT.to_string()], true)
    }

    fn sync(&mut self, dirs: &[String], recursive: bool) -> Result<usize, DaemonError> {
        let delay = self.retry_delay;
        let sent = retry_recoverable("sync", RETRY_ATTEMPTS, delay, || {
            self.propagate(dirs, recursive)
        })?
        .unwrap_or(0);
        if sent > 0 {
            tracing::info!(dirs = dirs.len(), bytes = sent, "changes propagated");
            self.run_onsync();
        }
        Ok(sent)
    }

    fn propagate(&mut self, dirs: &[String], recursive: bool) -> Result<usize, DaemonError> {
        let repo = &self.repo;
        let mut sink = Propagation {
            peers: &mut self.peers,
            repo,
            audience: Audience::All,
            commit_locally: true,
            chunk_size: self.ceiling / 2,
            sent: 0,
        };
        diff_into(repo, dirs, recursive, self.ceiling, &mut sink)?;
        Ok(sink.sent)
    }

    fn run_onsync(&self) {
        let Some(cmd) = self.onsync.as_deref() else {
            return;
        };
        let spawned = Process::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(self.repo.root())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => tracing::debug!(pid = child.id(), "onsync started"),
            Err(err) => tracing::warn!(error = %err, "cannot run onsync command"),
        }
    }

    // -----------------------------------------------------------------------
    // 3. Startup reconciliation
    // -----------------------------------------------------------------------

    /// Bring every peer in line with the local tree. Empty peers get a full
    /// push; peers with offline changes have them pulled, applied locally and
    /// forwarded. Finally local offline changes go out to everyone.
    pub fn reconcile(&mut self) -> Result<(), DaemonError> {
        let names = self.peers.names();
        let mut bootstrapped = 0;

        for name in &names {
            let Some(reply) = self.request_diff(name, DiffRequest::new(DiffScope::Shadow, 0))? else {
                continue;
            };
            match reply {
                DiffReply::Empty { local, repo } => {
                    tracing::info!(peer = %name, local, repo, "peer is empty, sending full tree");
                    if self.bootstrap(name, local)? {
                        bootstrapped += 1;
                    }
                }
                first => self.pull(name, first)?,
            }
        }

        if bootstrapped > 0 && bootstrapped == names.len() {
            let touched = commit_dir(&self.repo, ROOT, true)?;
            tracing::debug!(entries = touched, "local tree committed after bootstrap");
        }
        self.push_full()?;
        tracing::info!(peers = self.peers.len(), "reconciliation finished");
        Ok(())
    }

    /// Ask one peer for a page of its metadata diff. `None` when the peer
    /// dropped out.
    fn request_diff(&mut self, name: &str, request: DiffRequest) -> Result<Option<DiffReply>, DaemonError> {
        let replies = self
            .peers
            .execute(Audience::Only(name), Command::Diff, &request.encode())?;
        Ok(replies
            .into_iter()
            .next()
            .map(|(_, reply)| DiffReply::decode(reply)))
    }

    /// Make one peer identical to the local tree: remove whatever it has that
    /// the local tree lacks, push the whole tree against an empty baseline,
    /// then have it commit. Returns whether the peer was committed.
    fn bootstrap(&mut self, name: &str, peer_is_empty: bool) -> Result<bool, DaemonError> {
        if !peer_is_empty && !self.prune_peer(name)? {
            return Ok(false);
        }

        let delay = self.retry_delay;
        let pushed = retry_recoverable("bootstrap", RETRY_ATTEMPTS, delay, || {
            let mut sink = Propagation {
                peers: &mut self.peers,
                repo: &self.repo,
                audience: Audience::Only(name),
                commit_locally: false,
                chunk_size: self.ceiling / 2,
                sent: 0,
            };
            diff_into(&EmptyBaseline, &[ROOT.to_string()], true, self.ceiling, &mut sink)?;
            Ok(sink.sent)
        })?;
        if pushed.is_none() {
            tracing::warn!(peer = %name, "full push kept failing, peer left uncommitted");
            return Ok(false);
        }
        let replies = self.peers.execute(Audience::Only(name), Command::Commit, b"")?;
        Ok(!replies.is_empty())
    }

    /// Delete on `name` every path its live tree has and the local tree
    /// lacks. Returns false when the peer dropped out.
    fn prune_peer(&mut self, name: &str) -> Result<bool, DaemonError> {
        let mut page = 0;
        let mut removed_dir: Option<String> = None;
        let mut removed = 0;
        loop {
            let Some(reply) = self.request_diff(name, DiffRequest::new(DiffScope::Live, page))? else {
                return Ok(false);
            };
            let (bytes, more) = page_of(name, reply)?;

            let mut doomed = Vec::new();
            for record in parse_stream(&bytes, false)? {
                // Listings are depth first, so a removed directory's
                // descendants follow it directly.
                if removed_dir
                    .as_deref()
                    .is_some_and(|dir| is_within(record.path(), dir))
                {
                    continue;
                }
                let path = self.repo.live_path(record.path());
                if !probe(&path).map_err(|e| io_err(&path, e))?.is_absent() {
                    continue;
                }
                if record.target().is_dir() {
                    removed_dir = Some(record.path().to_string());
                }
                doomed.push(ChangeRecord::Deleted {
                    path: record.path().to_string(),
                    previous: record.target().clone(),
                });
            }

            removed += doomed.len();
            for stream in bounded_streams(&doomed, self.ceiling) {
                let replies = self
                    .peers
                    .execute(Audience::Only(name), Command::ApplyDiff, stream.as_bytes())?;
                if replies.is_empty() {
                    return Ok(false);
                }
            }
            if !more {
                break;
            }
            page += 1;
        }
        if removed > 0 {
            tracing::info!(peer = %name, entries = removed, "removed entries missing locally");
        }
        Ok(true)
    }

    /// Pull a peer's offline changes page by page, starting from the reply
    /// already in hand, then have it commit.
    fn pull(&mut self, name: &str, first: DiffReply) -> Result<(), DaemonError> {
        let mut reply = first;
        let mut page = 0;
        let mut pulled = 0;
        loop {
            let (bytes, more) = page_of(name, reply)?;
            match self.pull_page(name, &bytes)? {
                Some(count) => pulled += count,
                None => return Ok(()),
            }
            if !more {
                break;
            }
            page += 1;
            reply = match self.request_diff(name, DiffRequest::new(DiffScope::Shadow, page))? {
                Some(next) => next,
                None => return Ok(()),
            };
        }

        if pulled == 0 && page == 0 {
            tracing::info!(peer = %name, "peer has no offline changes");
            return Ok(());
        }
        self.peers.execute(Audience::Only(name), Command::Commit, b"")?;
        Ok(())
    }

    /// Fetch the files behind one page of a peer's metadata diff, apply them
    /// here and forward them to the other peers. Returns the number of
    /// records pulled, or `None` when the peer dropped out.
    fn pull_page(&mut self, name: &str, metadata: &[u8]) -> Result<Option<usize>, DaemonError> {
        let records = parse_stream(metadata, false)?;
        if records.is_empty() {
            return Ok(Some(0));
        }
        let (batches, oversized) = fetch::plan_batches(&records, self.ceiling);
        for path in &oversized {
            tracing::warn!(peer = %name, path = %path, "file too large to pull at startup, skipped until it changes");
        }

        let mut fetched: HashMap<String, FetchedFile> = HashMap::new();
        for batch in batches {
            let request = fetch::encode_request(batch.as_slice());
            let replies = self.peers.execute(Audience::Only(name), Command::GetFiles, &request)?;
            let Some((_, reply)) = replies.into_iter().next() else {
                return Ok(None);
            };
            for file in fetch::parse_response(&reply)? {
                fetched.insert(file.path.clone(), file);
            }
        }

        let mut pulled = Vec::with_capacity(records.len());
        for record in records {
            if record.target().file_size().is_none() {
                pulled.push(record);
                continue;
            }
            match fetched.remove(record.path()) {
                Some(file) if !file.fingerprint.is_absent() => pulled.push(retarget(record, file)),
                Some(_) => tracing::debug!(path = record.path(), "file vanished on peer before fetch"),
                None => {}
            }
        }

        let stats = apply_records(&self.repo, &pulled)?;
        tracing::info!(peer = %name, %stats, "offline changes pulled");

        if self.peers.len() > 1 {
            for stream in bounded_streams(&pulled, self.ceiling) {
                self.peers
                    .execute(Audience::AllExcept(name), Command::ApplyDiff, stream.as_bytes())?;
            }
        }
        Ok(Some(pulled.len()))
    }

    /// Say goodbye to every peer and drop the watcher marker.
    pub fn shutdown(mut self) {
        self.peers.shutdown_all();
        self.repo.clear_notify_pid();
        tracing::info!("engine stopped");
    }
}

fn diff_into(
    baseline: &dyn Baseline,
    dirs: &[String],
    recursive: bool,
    ceiling: usize,
    sink: &mut Propagation<'_>,
) -> Result<(), DaemonError> {
    let repo = sink.repo;
    let rest = compute_diff(
        repo.root(),
        baseline,
        repo.exclude(),
        dirs,
        recursive,
        DiffOptions {
            ceiling,
            with_contents: true,
        },
        sink,
    )?;
    sink.deliver(rest)
}

/// Replace the peer's recorded target with what `getfiles` actually returned.
fn retarget(record: ChangeRecord, file: FetchedFile) -> ChangeRecord {
    let FetchedFile {
        path,
        fingerprint,
        contents,
    } = file;
    match record {
        ChangeRecord::Modified { previous, .. } => ChangeRecord::Modified {
            path,
            previous,
            fingerprint,
            contents,
        },
        _ => ChangeRecord::Added {
            path,
            fingerprint,
            contents,
        },
    }
}

/// Serialize `records` into streams that each stay below `ceiling`.
fn bounded_streams(records: &[ChangeRecord], ceiling: usize) -> Vec<DiffStream> {
    let mut streams = Vec::new();
    let mut current = DiffStream::new();
    for record in records {
        let cost = record.path().len()
            + 3 * SEPARATOR.len()
            + FIELD_WIDTH
            + 128
            + record.contents().map_or(0, <[u8]>::len);
        if !current.is_empty() && current.len() + cost >= ceiling {
            streams.push(current.take());
        }
        current.push(record);
    }
    if !current.is_empty() {
        streams.push(current);
    }
    streams
}

/// Body of one `diff` reply page and whether more pages follow.
fn page_of(name: &str, reply: DiffReply) -> Result<(Vec<u8>, bool), DaemonError> {
    match reply {
        DiffReply::Partial(bytes) => Ok((bytes, true)),
        DiffReply::Stream(bytes) => Ok((bytes, false)),
        DiffReply::Empty { .. } => Err(DaemonError::Protocol(format!(
            "{name} reported an empty tree in the middle of a diff"
        ))),
    }
}

/// Whether `path` lies strictly below the directory `dir`.
fn is_within(path: &str, dir: &str) -> bool {
    dir == ROOT || path.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'))
}

/// Drop directories whose changes a shallower directory of the same batch
/// already reports: a directory below an ancestor in the batch is covered
/// when the ancestor's child on the way down is new, since the ancestor's
/// diff then emits that whole subtree.
fn drop_covered(baseline: &dyn Baseline, dirs: &[String]) -> Result<Vec<String>, DaemonError> {
    let batch: HashSet<&str> = dirs.iter().map(String::as_str).collect();
    let mut kept = Vec::with_capacity(dirs.len());
    'dirs: for dir in dirs {
        let mut child = dir.as_str();
        while child != ROOT {
            let parent = types::parent(child);
            if batch.contains(parent) && baseline.lookup(child)?.is_absent() {
                tracing::debug!(dir = %dir, covered_by = parent, "directory already covered");
                continue 'dirs;
            }
            child = parent;
        }
        kept.push(dir.clone());
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::CoreError;

    fn file_record(path: &str, body: &[u8]) -> ChangeRecord {
        ChangeRecord::Added {
            path: path.into(),
            fingerprint: Fingerprint::File {
                mode: 0o644,
                size: body.len() as u64,
                mtime: 0,
            },
            contents: Some(body.to_vec()),
        }
    }

    #[test]
    fn bounded_streams_split_before_the_ceiling() {
        let records = vec![
            file_record("a", &[1; 300]),
            file_record("b", &[2; 300]),
            file_record("c", &[3; 300]),
        ];
        let streams = bounded_streams(&records, 1000);
        assert_eq!(streams.len(), 2);
        assert!(streams.iter().all(|s| s.len() < 1000));
        let total: usize = streams.iter().map(DiffStream::record_count).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn retarget_keeps_record_kind_and_takes_fetched_state() {
        let previous = Fingerprint::File {
            mode: 0o600,
            size: 1,
            mtime: 1,
        };
        let record = ChangeRecord::Modified {
            path: "f".into(),
            previous: previous.clone(),
            fingerprint: Fingerprint::File {
                mode: 0o600,
                size: 2,
                mtime: 2,
            },
            contents: None,
        };
        let fetched = FetchedFile {
            path: "f".into(),
            fingerprint: Fingerprint::File {
                mode: 0o644,
                size: 3,
                mtime: 3,
            },
            contents: Some(b"new".to_vec()),
        };
        match retarget(record, fetched.clone()) {
            ChangeRecord::Modified {
                previous: p,
                fingerprint,
                contents,
                ..
            } => {
                assert_eq!(p, previous);
                assert_eq!(fingerprint, fetched.fingerprint);
                assert_eq!(contents.as_deref(), Some(b"new".as_slice()));
            }
            other => panic!("expected Modified, got {other:?}"),
        }
    }

    /// Shadow that knows exactly the listed directories.
    struct Known(&'static [&'static str]);

    impl Baseline for Known {
        fn lookup(&self, rel: &str) -> Result<Fingerprint, CoreError> {
            Ok(if rel == ROOT || self.0.contains(&rel) {
                Fingerprint::Dir
            } else {
                Fingerprint::Absent
            })
        }

        fn children(&self, _rel: &str) -> Result<Vec<String>, CoreError> {
            Ok(Vec::new())
        }
    }

    fn batch(dirs: &[&str]) -> Vec<String> {
        dirs.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn new_directories_under_a_batch_ancestor_are_dropped() {
        let known = Known(&["src"]);
        assert_eq!(drop_covered(&known, &batch(&[".", "foo"])).unwrap(), ["."]);
        assert_eq!(drop_covered(&known, &batch(&[".", "foo/bar"])).unwrap(), ["."]);
        assert_eq!(drop_covered(&known, &batch(&["src", "src/new"])).unwrap(), ["src"]);
    }

    #[test]
    fn known_directories_stay_in_the_batch() {
        let known = Known(&["src", "src/deep"]);
        assert_eq!(
            drop_covered(&known, &batch(&[".", "src"])).unwrap(),
            [".", "src"]
        );
        assert_eq!(
            drop_covered(&known, &batch(&[".", "src/new"])).unwrap(),
            [".", "src/new"],
            "root diff does not descend into an unchanged src"
        );
        assert_eq!(
            drop_covered(&known, &batch(&["src/deep"])).unwrap(),
            ["src/deep"]
        );
    }

    #[test]
    fn within_means_strictly_below() {
        assert!(is_within("a/b", "a"));
        assert!(is_within("a", ROOT));
        assert!(!is_within("ab", "a"));
        assert!(!is_within("a", "a"));
    }
}
