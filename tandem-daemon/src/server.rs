//! Peer-side dispatcher: one request, one handler, one response, repeat.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use tandem_core::{Baseline, EmptyBaseline, ExcludeSet, Fingerprint, Repository, ROOT};
use tandem_sync::record::MORE_HEADER;
use tandem_sync::{
    apply_diff, commit_dir, compute_diff, diff, fetch, ChunkReceiver, DiffOptions, DiffReply,
    DiffRequest, DiffScope, Pager, SyncError,
};

use crate::error::{io_err, DaemonError};
use crate::frame::{FrameReader, FrameWriter};
use crate::paths::{RETRY_ATTEMPTS, RETRY_DELAY};
use crate::protocol::{Command, PONG};
use crate::retry::retry_recoverable;

type Handler = fn(&mut Server, &[u8]) -> Result<Vec<u8>, DaemonError>;

const DISPATCH: &[(Command, Handler)] = &[
    (Command::Ping, Server::ping),
    (Command::Diff, Server::diff),
    (Command::ApplyDiff, Server::apply_diff),
    (Command::Commit, Server::commit),
    (Command::GetFiles, Server::get_files),
    (Command::BigInit, Server::big_init),
    (Command::ChunkRcv, Server::chunk_rcv),
    (Command::BigCommit, Server::big_commit),
    (Command::BigAbort, Server::big_abort),
    (Command::Shutdown, Server::shutdown),
];

/// Every [`Command`] has exactly one handler.
pub fn verify_dispatch_table() -> Result<(), DaemonError> {
    for cmd in Command::ALL {
        let count = DISPATCH.iter().filter(|(c, _)| *c == cmd).count();
        if count != 1 {
            return Err(DaemonError::Protocol(format!(
                "dispatch table has {count} handlers for '{cmd}'"
            )));
        }
    }
    Ok(())
}

fn handler_for(cmd: Command) -> Option<Handler> {
    DISPATCH.iter().find(|(c, _)| *c == cmd).map(|(_, h)| *h)
}

pub struct Server {
    repo: Repository,
    ceiling: usize,
    receiver: ChunkReceiver,
}

impl Server {
    pub fn new(repo: Repository, ceiling: usize) -> Result<Self, DaemonError> {
        verify_dispatch_table()?;
        Ok(Self {
            repo,
            ceiling,
            receiver: ChunkReceiver::new(),
        })
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Serve requests until `shutdown` or a clean EOF. Any other failure is
    /// fatal to the connection.
    pub fn serve<R: Read, W: Write>(&mut self, input: R, output: W) -> Result<(), DaemonError> {
        let mut reader = FrameReader::new(input, self.ceiling);
        let mut writer = FrameWriter::new(output, self.ceiling);

        loop {
            let Some((name, payload)) = reader.read_request()? else {
                tracing::info!("client closed the connection");
                return Ok(());
            };
            let cmd = Command::from_name(&name)
                .ok_or_else(|| DaemonError::Protocol(format!("unknown command '{name}'")))?;
            let handler = handler_for(cmd)
                .ok_or_else(|| DaemonError::Protocol(format!("no handler for '{cmd}'")))?;

            tracing::debug!(command = %cmd, bytes = payload.len(), "request");
            let reply = handler(self, &payload)?;
            writer.write_response(&reply)?;

            if cmd == Command::Shutdown {
                tracing::info!("shutdown requested");
                return Ok(());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn ping(&mut self, _payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        Ok(PONG.to_vec())
    }

    /// One page of a metadata-only diff of the whole tree. Against the
    /// shadow, the first page is replaced by the bootstrap signal when
    /// either side is empty; against nothing, it lists the live tree.
    fn diff(&mut self, payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        let request = DiffRequest::decode(payload)?;
        if request.scope == DiffScope::Shadow && request.page == 0 {
            let local = diff::live_is_empty(self.repo.root(), self.repo.exclude())
                .map_err(DaemonError::from)?;
            let repo = self.repo.is_empty()?;
            if local || repo {
                tracing::info!(local, repo, "reporting empty side");
                return Ok(DiffReply::Empty { local, repo }.encode());
            }
        }

        // Leave room for the continuation marker inside the frame.
        let ceiling = self.ceiling.saturating_sub(MORE_HEADER.len());
        let options = DiffOptions {
            ceiling,
            with_contents: false,
        };
        let (page, more) = retry_recoverable("diff", RETRY_ATTEMPTS, RETRY_DELAY, || {
            let baseline: &dyn Baseline = match request.scope {
                DiffScope::Shadow => &self.repo,
                DiffScope::Live => &EmptyBaseline,
            };
            let mut pager = Pager::new(ceiling, request.page);
            let rest = compute_diff(
                self.repo.root(),
                baseline,
                self.repo.exclude(),
                &[ROOT.to_string()],
                true,
                options,
                &mut pager,
            )
            .map_err(DaemonError::from)?;
            Ok(pager.finish(rest))
        })?
        .ok_or_else(|| DaemonError::Protocol("tree kept changing during diff".into()))?;

        tracing::debug!(
            scope = ?request.scope,
            page = request.page,
            records = page.record_count(),
            bytes = page.len(),
            more,
            "diff page computed"
        );
        let bytes = page.into_bytes();
        Ok(if more {
            DiffReply::Partial(bytes)
        } else {
            DiffReply::Stream(bytes)
        }
        .encode())
    }

    fn apply_diff(&mut self, payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        let stats = apply_diff(&self.repo, payload)?;
        tracing::info!(%stats, "diff applied");
        Ok(stats.to_string().into_bytes())
    }

    fn commit(&mut self, _payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        let touched = commit_dir(&self.repo, ROOT, true)?;
        tracing::info!(entries = touched, "tree committed");
        Ok(Vec::new())
    }

    fn get_files(&mut self, payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        let paths = fetch::parse_request(payload)?;
        let reply = retry_recoverable("getfiles", RETRY_ATTEMPTS, RETRY_DELAY, || {
            fetch::build_response(self.repo.root(), &paths).map_err(DaemonError::from)
        })?
        .ok_or_else(|| DaemonError::Protocol("files kept changing during getfiles".into()))?;
        tracing::debug!(files = paths.len(), bytes = reply.len(), "files sent");
        Ok(reply)
    }

    fn big_init(&mut self, payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        let rel = std::str::from_utf8(payload)
            .map_err(|_| SyncError::Contract("biginit path is not UTF-8".into()))?;
        if rel.is_empty() {
            return Err(SyncError::Contract("biginit without a file name".into()).into());
        }
        self.receiver.begin(&self.repo, rel)?;
        Ok(Vec::new())
    }

    fn chunk_rcv(&mut self, payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        self.receiver.write_chunk(payload)?;
        Ok(Vec::new())
    }

    fn big_commit(&mut self, payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| SyncError::Contract("bigcommit stat is not UTF-8".into()))?;
        let fingerprint: Fingerprint = text
            .parse()
            .map_err(|e: tandem_core::fingerprint::FingerprintParseError| {
                SyncError::Contract(e.to_string())
            })?;
        self.receiver.commit(&self.repo, &fingerprint)?;
        Ok(Vec::new())
    }

    fn big_abort(&mut self, _payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        self.receiver.abort();
        Ok(Vec::new())
    }

    fn shutdown(&mut self, _payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        Ok(Vec::new())
    }
}

/// `--server` entry point: serve the tree at `dir` over stdin/stdout.
pub fn serve_stdio(
    dir: &Path,
    host: &str,
    exclude: ExcludeSet,
    ceiling: usize,
) -> Result<(), DaemonError> {
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let span = tracing::info_span!("server", host = %host);
    let _entered = span.enter();

    let repo = Repository::open(dir, exclude)?;
    tracing::info!(root = %repo.root().display(), ceiling, "serving");
    let mut server = Server::new(repo, ceiling)?;

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    server.serve(stdin.lock(), stdout.lock())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_sync::record::length_field;
    use tempfile::TempDir;

    fn request(cmd: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = format!("{cmd:>10}{}", length_field(payload.len())).into_bytes();
        out.extend_from_slice(payload);
        out
    }

    fn responses(mut bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let len: usize = std::str::from_utf8(&bytes[..10]).unwrap().trim().parse().unwrap();
            out.push(bytes[10..10 + len].to_vec());
            bytes = &bytes[10 + len..];
        }
        out
    }

    fn server(dir: &TempDir) -> Server {
        let repo = Repository::open(dir.path(), ExcludeSet::default()).unwrap();
        Server::new(repo, 1 << 20).unwrap()
    }

    #[test]
    fn dispatch_table_is_complete() {
        verify_dispatch_table().unwrap();
        assert_eq!(DISPATCH.len(), Command::ALL.len());
    }

    #[test]
    fn ping_then_shutdown_stops_the_loop() {
        let tmp = TempDir::new().unwrap();
        let mut input = request("ping", b"");
        input.extend(request("shutdown", b""));
        input.extend(request("ping", b""));

        let mut output = Vec::new();
        server(&tmp).serve(input.as_slice(), &mut output).unwrap();

        assert_eq!(responses(&output), vec![b"pong".to_vec(), Vec::new()]);
    }

    #[test]
    fn unknown_command_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let input = request("frobnicate", b"");
        let mut output = Vec::new();
        let err = server(&tmp).serve(input.as_slice(), &mut output).unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(_)), "{err}");
        assert!(output.is_empty());
    }

    #[test]
    fn diff_on_empty_tree_reports_both_sides_empty() {
        let tmp = TempDir::new().unwrap();
        let mut output = Vec::new();
        server(&tmp)
            .serve(request("diff", b"").as_slice(), &mut output)
            .unwrap();
        let reply = DiffReply::decode(responses(&output).remove(0));
        assert_eq!(
            reply,
            DiffReply::Empty {
                local: true,
                repo: true
            }
        );
    }

    #[test]
    fn diff_after_commit_lists_only_new_changes() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("old"), "o").unwrap();
        let mut srv = server(&tmp);
        commit_dir(srv.repository(), ROOT, true).unwrap();
        fs::write(tmp.path().join("new"), "n").unwrap();

        let mut output = Vec::new();
        srv.serve(request("diff", b"").as_slice(), &mut output).unwrap();
        let DiffReply::Stream(bytes) = DiffReply::decode(responses(&output).remove(0)) else {
            panic!("expected a stream");
        };
        let records = tandem_sync::parse_stream(&bytes, false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path(), "new");
        assert_eq!(records[0].contents(), None);
    }

    #[test]
    fn live_scope_lists_the_tree_regardless_of_shadow() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("dir")).unwrap();
        fs::write(tmp.path().join("dir/kept"), "k").unwrap();
        let mut srv = server(&tmp);
        commit_dir(srv.repository(), ROOT, true).unwrap();

        let payload = DiffRequest::new(DiffScope::Live, 0).encode();
        let mut output = Vec::new();
        srv.serve(request("diff", &payload).as_slice(), &mut output).unwrap();
        let DiffReply::Stream(bytes) = DiffReply::decode(responses(&output).remove(0)) else {
            panic!("expected the last page");
        };
        let paths: Vec<_> = tandem_sync::parse_stream(&bytes, false)
            .unwrap()
            .into_iter()
            .map(|r| r.path().to_string())
            .collect();
        assert_eq!(paths, ["dir", "dir/kept"]);
    }

    #[test]
    fn long_diff_is_split_into_pages_below_the_ceiling() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("seed"), "s").unwrap();
        let repo = Repository::open(tmp.path(), ExcludeSet::default()).unwrap();
        commit_dir(&repo, ROOT, true).unwrap();
        for i in 0..200 {
            fs::write(tmp.path().join(format!("offline-{i:03}")), "x").unwrap();
        }
        let ceiling = 4096;
        let mut srv = Server::new(repo, ceiling).unwrap();

        let mut seen = 0;
        let mut page = 0;
        loop {
            let payload = DiffRequest::new(DiffScope::Shadow, page).encode();
            let mut output = Vec::new();
            srv.serve(request("diff", &payload).as_slice(), &mut output).unwrap();
            let reply = responses(&output).remove(0);
            assert!(reply.len() <= ceiling, "reply of {} bytes", reply.len());
            let (bytes, more) = match DiffReply::decode(reply) {
                DiffReply::Partial(bytes) => (bytes, true),
                DiffReply::Stream(bytes) => (bytes, false),
                other => panic!("unexpected reply {other:?}"),
            };
            seen += tandem_sync::parse_stream(&bytes, false).unwrap().len();
            if !more {
                break;
            }
            page += 1;
        }
        assert!(page > 0);
        assert_eq!(seen, 200);
    }
}
