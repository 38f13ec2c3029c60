//! Client side of the transport: one connection per configured peer.

use std::io::{Read, Write};
use std::process::{Child, Command as Process, Stdio};

use tandem_core::{ExcludeSet, PeerSettings};

use crate::error::{io_err, DaemonError};
use crate::frame::{FrameReader, FrameWriter};
use crate::paths::SSH_BINARY;
use crate::protocol::{Command, PONG};

type BoxedRead = Box<dyn Read + Send>;
type BoxedWrite = Box<dyn Write + Send>;

/// A live request/response channel to one peer. Requests are strictly
/// sequential; there is never more than one in flight.
pub struct PeerConnection {
    name: String,
    reader: FrameReader<BoxedRead>,
    writer: FrameWriter<BoxedWrite>,
    child: Option<Child>,
}

impl PeerConnection {
    pub fn new(name: impl Into<String>, input: BoxedRead, output: BoxedWrite, ceiling: usize) -> Self {
        Self {
            name: name.into(),
            reader: FrameReader::new(input, ceiling),
            writer: FrameWriter::new(output, ceiling),
            child: None,
        }
    }

    /// Start `process` with piped stdin/stdout and talk to it. Its stderr is
    /// inherited so remote diagnostics reach the operator.
    pub fn spawn(name: impl Into<String>, mut process: Process, ceiling: usize) -> Result<Self, DaemonError> {
        let name = name.into();
        let program = process.get_program().to_os_string();
        let mut child = process
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| io_err(&program, e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or(DaemonError::ChannelClosed("peer stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(DaemonError::ChannelClosed("peer stdout"))?;

        let mut conn = Self::new(name, Box::new(stdout), Box::new(stdin), ceiling);
        conn.child = Some(child);
        Ok(conn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execute(&mut self, cmd: Command, payload: &[u8]) -> Result<Vec<u8>, DaemonError> {
        self.writer.write_request(cmd.name(), payload)?;
        let reply = self.reader.read_response()?;
        tracing::debug!(peer = %self.name, command = %cmd, sent = payload.len(), received = reply.len(), "round trip");
        Ok(reply)
    }

    pub fn ping(&mut self) -> Result<(), DaemonError> {
        let reply = self.execute(Command::Ping, b"")?;
        if reply != PONG {
            return Err(DaemonError::Protocol(format!(
                "peer {} answered ping with {:?}",
                self.name,
                String::from_utf8_lossy(&reply)
            )));
        }
        Ok(())
    }

    /// Ask the peer to exit, close the channel and reap the child process.
    pub fn shutdown(mut self) {
        if let Err(err) = self.execute(Command::Shutdown, b"") {
            tracing::debug!(peer = %self.name, error = %err, "shutdown request failed");
        }
        self.close();
    }

    /// Drop the channel without a goodbye; used for peers that failed.
    fn close(self) {
        let Self {
            name,
            reader,
            writer,
            child,
        } = self;
        drop(writer);
        drop(reader);
        if let Some(mut child) = child {
            match child.wait() {
                Ok(status) => tracing::debug!(peer = %name, %status, "peer process exited"),
                Err(err) => tracing::warn!(peer = %name, error = %err, "failed to reap peer process"),
            }
        }
    }
}

/// Remote shell invocation that starts the peer in server mode.
pub fn ssh_command(settings: &PeerSettings, debug: bool, exclude: &ExcludeSet, ceiling: usize) -> Process {
    let mut remote = vec![
        settings.binary.clone(),
        "--server".to_string(),
        "--hostname".to_string(),
        settings.name.clone(),
    ];
    if debug {
        remote.push("--debug".to_string());
    }
    for name in exclude.names() {
        remote.push("--exclude".to_string());
        remote.push(name.to_string());
    }
    remote.push("--max-memory".to_string());
    remote.push(ceiling.to_string());
    remote.push(settings.dir.clone());

    let mut cmd = Process::new(SSH_BINARY);
    if let Some(port) = settings.port {
        cmd.arg("-p").arg(port.to_string());
    }
    if let Some(user) = &settings.username {
        cmd.arg("-l").arg(user);
    }
    cmd.arg("-o").arg("BatchMode=yes").arg(&settings.host);
    cmd.arg(
        remote
            .iter()
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" "),
    );
    cmd
}

/// Single-quote `word` for a POSIX shell unless it is plainly safe.
fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

// ---------------------------------------------------------------------------
// Peer set
// ---------------------------------------------------------------------------

/// Which peers a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience<'a> {
    All,
    Only(&'a str),
    AllExcept(&'a str),
}

impl Audience<'_> {
    fn includes(&self, name: &str) -> bool {
        match self {
            Audience::All => true,
            Audience::Only(only) => *only == name,
            Audience::AllExcept(except) => *except != name,
        }
    }
}

/// Active peers in configuration order. A peer whose round trip fails is
/// dropped; the set is only an error once it is empty.
#[derive(Default)]
pub struct PeerSet {
    peers: Vec<PeerConnection>,
}

impl PeerSet {
    pub fn new(peers: Vec<PeerConnection>) -> Self {
        Self { peers }
    }

    /// Start and ping every configured peer. Peers that fail to come up are
    /// logged and left out.
    pub fn connect(
        settings: &[PeerSettings],
        debug: bool,
        exclude: &ExcludeSet,
        ceiling: usize,
    ) -> Result<Self, DaemonError> {
        let mut peers = Vec::new();
        for peer in settings {
            tracing::info!(peer = %peer.name, host = %peer.host, dir = %peer.dir, os = ?peer.os, "connecting");
            let process = ssh_command(peer, debug, exclude, ceiling);
            let mut conn = match PeerConnection::spawn(&peer.name, process, ceiling) {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!(peer = %peer.name, error = %err, "cannot start peer");
                    continue;
                }
            };
            match conn.ping() {
                Ok(()) => peers.push(conn),
                Err(err) => {
                    tracing::error!(peer = %peer.name, error = %err, "peer did not answer ping");
                    conn.close();
                }
            }
        }
        if peers.is_empty() {
            return Err(DaemonError::NoPeers);
        }
        Ok(Self { peers })
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.name.clone()).collect()
    }

    /// Send one request to each peer in `audience`, one after another.
    /// Returns the replies of the peers that answered.
    pub fn execute(
        &mut self,
        audience: Audience<'_>,
        cmd: Command,
        payload: &[u8],
    ) -> Result<Vec<(String, Vec<u8>)>, DaemonError> {
        let mut replies = Vec::new();
        let mut failed = Vec::new();
        for (idx, peer) in self.peers.iter_mut().enumerate() {
            if !audience.includes(&peer.name) {
                continue;
            }
            match peer.execute(cmd, payload) {
                Ok(reply) => replies.push((peer.name.clone(), reply)),
                Err(err) => {
                    tracing::error!(peer = %peer.name, command = %cmd, error = %err, "peer failed, dropping it");
                    failed.push(idx);
                }
            }
        }
        for idx in failed.into_iter().rev() {
            self.peers.remove(idx).close();
        }
        if self.peers.is_empty() {
            return Err(DaemonError::NoPeers);
        }
        Ok(replies)
    }

    pub fn shutdown_all(&mut self) {
        for peer in self.peers.drain(..) {
            tracing::info!(peer = %peer.name, "disconnecting");
            peer.shutdown();
        }
    }
}
