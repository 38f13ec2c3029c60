//! Tandem daemon: framed transport, command protocol, peers, big-file
//! sender, propagation engine and the watch-driven sync loop.

mod error;
pub mod frame;
pub mod paths;
pub mod peer;
pub mod propagate;
pub mod protocol;
mod retry;
mod runtime;
pub mod server;
pub mod transfer;

pub use error::DaemonError;
pub use frame::{FrameReader, FrameWriter};
pub use peer::{ssh_command, Audience, PeerConnection, PeerSet};
pub use propagate::Engine;
pub use protocol::Command;
pub use runtime::{debug_from_env, init_tracing, run, start_blocking, Coalescer};
pub use server::{serve_stdio, verify_dispatch_table, Server};
pub use transfer::{send_big_file, TransferOutcome};
