use std::fmt;

/// Commands a server understands. Wire names are at most ten ASCII bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    Diff,
    ApplyDiff,
    Commit,
    GetFiles,
    BigInit,
    ChunkRcv,
    BigCommit,
    BigAbort,
    Shutdown,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Ping,
        Command::Diff,
        Command::ApplyDiff,
        Command::Commit,
        Command::GetFiles,
        Command::BigInit,
        Command::ChunkRcv,
        Command::BigCommit,
        Command::BigAbort,
        Command::Shutdown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Diff => "diff",
            Command::ApplyDiff => "applydiff",
            Command::Commit => "commit",
            Command::GetFiles => "getfiles",
            Command::BigInit => "biginit",
            Command::ChunkRcv => "chunkrcv",
            Command::BigCommit => "bigcommit",
            Command::BigAbort => "bigabort",
            Command::Shutdown => "shutdown",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reply body of `ping`.
pub const PONG: &[u8] = b"pong";
