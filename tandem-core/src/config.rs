//! Client configuration: `.tandem/client_config`.
//!
//! ```ini
//! [general_settings]
//! exclude[] = .git
//! exclude[] = node_modules
//! onsync = make reload
//! max_memory = 2097152
//! username = deploy
//!
//! [build-box]
//! host = build.example.org
//! dir = /srv/work/project
//! port = 2222
//! os = linux
//! ```
//!
//! Every section other than `general_settings` describes one peer; peers keep
//! file order. Peer keys left unset inherit from `general_settings`.

use std::path::{Path, PathBuf};

use ini::{Ini, Properties};

use crate::error::{config_err, io_err, CoreError};
use crate::types::ExcludeSet;

pub const GENERAL_SECTION: &str = "general_settings";

/// Default memory ceiling in bytes (2 MiB).
pub const DEFAULT_MEMORY_CEILING: usize = 2_097_152;

/// Smallest ceiling that still leaves room for frame headers and metadata.
pub const MIN_MEMORY_CEILING: usize = 4096;

/// Executable launched on the remote side unless `binary` overrides it.
pub const DEFAULT_BINARY: &str = "tandem";

/// Remote operating systems the peer binary is known to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOs {
    Linux,
    Darwin,
}

impl std::str::FromStr for RemoteOs {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(RemoteOs::Linux),
            "darwin" | "macos" => Ok(RemoteOs::Darwin),
            other => Err(format!("unsupported remote os '{other}'")),
        }
    }
}

/// Connection settings for one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSettings {
    /// Section name; used as the log label.
    pub name: String,
    pub host: String,
    pub dir: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub binary: String,
    pub os: RemoteOs,
}

/// Parsed client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub exclude: ExcludeSet,
    pub onsync: Option<String>,
    pub memory_ceiling: usize,
    pub peers: Vec<PeerSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exclude: ExcludeSet::default(),
            onsync: None,
            memory_ceiling: DEFAULT_MEMORY_CEILING,
            peers: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Err(config_err(path, "config file not found"));
        }
        let text = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        Self::parse(path, &text)
    }

    /// Parse config text; `path` is only used for error messages.
    pub fn parse(path: &Path, text: &str) -> Result<Self, CoreError> {
        let ini = Ini::load_from_str(text).map_err(|e| config_err(path, format!("malformed ini: {e}")))?;

        if ini
            .section(None::<String>)
            .is_some_and(|props| props.iter().next().is_some())
        {
            return Err(config_err(path, "keys outside of any section"));
        }

        let empty = Properties::new();
        let general = ini.section(Some(GENERAL_SECTION)).unwrap_or(&empty);

        let mut exclude: Vec<String> = general.get_all("exclude[]").map(str::to_string).collect();
        for list in general.get_all("exclude") {
            exclude.extend(list.split('|').map(|s| s.trim().to_string()));
        }

        let onsync = get(general, "onsync").map(str::to_string);
        let memory_ceiling = match get(general, "max_memory") {
            None => DEFAULT_MEMORY_CEILING,
            Some(raw) => {
                let value: usize = raw
                    .parse()
                    .map_err(|_| config_err(path, format!("max_memory is not a number: '{raw}'")))?;
                if value < MIN_MEMORY_CEILING {
                    return Err(config_err(
                        path,
                        format!("max_memory must be at least {MIN_MEMORY_CEILING}"),
                    ));
                }
                value
            }
        };

        let mut peers = Vec::new();
        for (name, props) in ini.iter() {
            let Some(name) = name.filter(|n| *n != GENERAL_SECTION) else {
                continue;
            };
            if get(props, "disabled").map(is_truthy).unwrap_or(false) {
                tracing::debug!(peer = %name, "peer disabled in config");
                continue;
            }
            peers.push(peer_settings(path, name, props, general)?);
        }

        Ok(Self {
            exclude: ExcludeSet::new(exclude),
            onsync,
            memory_ceiling,
            peers,
        })
    }

    /// Same as [`Config::load`] for the conventional location under `root`.
    pub fn load_for_root(root: &Path) -> Result<Self, CoreError> {
        let path: PathBuf = crate::repository::Repository::config_path_for(root);
        Self::load(&path)
    }
}

fn peer_settings(
    path: &Path,
    name: &str,
    props: &Properties,
    general: &Properties,
) -> Result<PeerSettings, CoreError> {
    let lookup = |key: &str| get(props, key).or_else(|| get(general, key));

    let dir = lookup("dir")
        .ok_or_else(|| config_err(path, format!("[{name}] is missing required key 'dir'")))?
        .to_string();

    let port = match lookup("port") {
        None => None,
        Some(raw) => Some(
            raw.parse::<u16>()
                .map_err(|_| config_err(path, format!("[{name}] port is not valid: '{raw}'")))?,
        ),
    };

    let os = match lookup("os") {
        None => RemoteOs::Linux,
        Some(raw) => raw
            .parse::<RemoteOs>()
            .map_err(|msg| config_err(path, format!("[{name}] {msg}")))?,
    };

    Ok(PeerSettings {
        name: name.to_string(),
        host: get(props, "host").unwrap_or(name).to_string(),
        dir,
        port,
        username: lookup("username").map(str::to_string),
        binary: lookup("binary").unwrap_or(DEFAULT_BINARY).to_string(),
        os,
    })
}

/// Last non-empty value for `key`.
fn get<'a>(props: &'a Properties, key: &str) -> Option<&'a str> {
    props.get_all(key).filter(|v| !v.is_empty()).last()
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}
