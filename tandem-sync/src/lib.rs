//! # tandem-sync
//!
//! Diff computation, the Diff Stream wire format, and the apply/commit
//! engine that makes a tree converge on a stream.
//!
//! Call [`compute_diff`] to produce a stream against a [`tandem_core::Baseline`],
//! [`apply_diff`] to replay it on another tree, and [`commit_records`] /
//! [`commit_dir`] to fold delivered or live state into the shadow.

pub mod apply;
pub mod bigfile;
pub mod commit;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod record;

pub use apply::{apply_diff, apply_records, ApplyStats};
pub use bigfile::ChunkReceiver;
pub use commit::{commit_dir, commit_records, commit_stream};
pub use diff::{compute_diff, BufferOnly, DiffOptions, DiffSink, Pager};
pub use error::{DiffError, FileError, SyncError};
pub use record::{
    parse_stream, ChangeRecord, DiffReply, DiffRequest, DiffScope, DiffStream, SEPARATOR,
};
