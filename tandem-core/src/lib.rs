//! Tandem core library: fingerprints, shadow repository, config, errors.
//!
//! - [`fingerprint`]: the filesystem prober and [`Fingerprint`]
//! - [`types`]: relative path helpers and [`ExcludeSet`]
//! - [`repository`]: the locked shadow [`Repository`]
//! - [`config`]: `client_config` parsing
//! - [`error`]: [`CoreError`]

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod repository;
pub mod types;

pub use config::{Config, PeerSettings, RemoteOs, DEFAULT_MEMORY_CEILING};
pub use error::CoreError;
pub use fingerprint::{probe, Fingerprint};
pub use repository::{Baseline, EmptyBaseline, Repository, REPO_DIR_NAME};
pub use types::{ExcludeSet, ROOT};
