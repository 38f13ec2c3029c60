use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use tandem_core::{types, Config, ExcludeSet, Repository};

use crate::error::{io_err, DaemonError};
use crate::paths::{DEBOUNCE_WINDOW, DEBUG_ENV};
use crate::peer::PeerSet;
use crate::propagate::Engine;

/// Start the client and block the current thread until it exits.
pub fn start_blocking(start: &Path, debug: bool) -> Result<(), DaemonError> {
    init_tracing(debug);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(start.to_path_buf(), debug))
}

/// Connect, reconcile, then propagate watcher-reported changes until ctrl-c.
pub async fn run(start: PathBuf, debug: bool) -> Result<(), DaemonError> {
    let root = Repository::discover(&start)?;
    let config = Config::load_for_root(&root)?;
    let repo = Repository::open(&root, config.exclude.clone())?;
    tracing::info!(root = %root.display(), peers = config.peers.len(), "starting");

    let engine = tokio::task::spawn_blocking(move || -> Result<Engine, DaemonError> {
        let peers = PeerSet::connect(&config.peers, debug, repo.exclude(), config.memory_ceiling)?;
        let mut engine = Engine::new(repo, peers, &config);
        if let Err(err) = engine.reconcile() {
            engine.shutdown();
            return Err(err);
        }
        Ok(engine)
    })
    .await
    .map_err(|e| DaemonError::Protocol(format!("startup task join failure: {e}")))??;

    engine.repository().write_notify_pid(std::process::id())?;
    let exclude = engine.repository().exclude().clone();
    // Watcher paths arrive canonicalized (e.g. /private/var on macOS).
    let root = fs::canonicalize(&root).unwrap_or(root);

    let (path_tx, path_rx) = mpsc::unbounded_channel::<PathBuf>();
    let (batch_tx, batch_rx) = mpsc::channel::<Vec<String>>(16);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let root = root.clone();
        tokio::spawn(async move {
            let result = watcher_task(root, path_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let coalesce_handle = {
        let shutdown = shutdown_tx.clone();
        let coalescer = Coalescer::new(root.clone(), exclude);
        tokio::spawn(async move {
            let result =
                coalesce_events(path_rx, batch_tx, coalescer, DEBOUNCE_WINDOW, shutdown.subscribe())
                    .await;
            let _ = shutdown.send(());
            result
        })
    };

    let sync_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = sync_task(engine, batch_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (watcher_result, coalesce_result, sync_result, signal_result) =
        tokio::join!(watcher_handle, coalesce_handle, sync_handle, signal_handle);

    handle_join("sync", sync_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("coalescer", coalesce_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn watcher_task(
    root: PathBuf,
    path_tx: mpsc::UnboundedSender<PathBuf>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    tracing::info!(root = %root.display(), "watching for changes");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in event.paths {
                    if path_tx.send(path).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

/// Collect paths into directories and emit the set once no event has
/// arrived for `window`.
async fn coalesce_events(
    mut path_rx: mpsc::UnboundedReceiver<PathBuf>,
    batch_tx: mpsc::Sender<Vec<String>>,
    mut coalescer: Coalescer,
    window: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut deadline: Option<Instant> = None;
    loop {
        let quiet = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            path = path_rx.recv() => {
                let Some(path) = path else { break };
                if coalescer.note(&path) {
                    deadline = Some(Instant::now() + window);
                }
            }
            _ = quiet => {
                deadline = None;
                let dirs = coalescer.take();
                if dirs.is_empty() {
                    continue;
                }
                tracing::debug!(dirs = dirs.len(), "changes settled");
                if batch_tx.send(dirs).await.is_err() {
                    return Err(DaemonError::ChannelClosed("sync batches"));
                }
            }
        }
    }
    Ok(())
}

/// Owns the engine. Each batch runs on the blocking pool; the engine moves
/// there and back so no lock is needed.
async fn sync_task(
    mut engine: Engine,
    mut batch_rx: mpsc::Receiver<Vec<String>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut outcome = Ok(());
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            batch = batch_rx.recv() => {
                let Some(batch) = batch else { break };
                let mut dirs: BTreeSet<String> = batch.into_iter().collect();
                while let Ok(more) = batch_rx.try_recv() {
                    dirs.extend(more);
                }
                let dirs: Vec<String> = dirs.into_iter().collect();

                let (returned, result) = tokio::task::spawn_blocking(move || {
                    let result = engine.sync_dirs(&dirs);
                    (engine, result)
                })
                .await
                .map_err(|e| DaemonError::Protocol(format!("sync job join failure: {e}")))?;
                engine = returned;

                if let Err(err) = result {
                    tracing::error!(error = %err, "sync failed");
                    outcome = Err(err);
                    break;
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || engine.shutdown())
        .await
        .map_err(|e| DaemonError::Protocol(format!("shutdown join failure: {e}")))?;
    outcome
}

// ---------------------------------------------------------------------------
// Event coalescing
// ---------------------------------------------------------------------------

/// Pending set of changed directories, relative to the root.
#[derive(Debug)]
pub struct Coalescer {
    root: PathBuf,
    exclude: ExcludeSet,
    pending: BTreeSet<String>,
}

impl Coalescer {
    pub fn new(root: PathBuf, exclude: ExcludeSet) -> Self {
        Self {
            root,
            exclude,
            pending: BTreeSet::new(),
        }
    }

    /// Record the directory containing `path`. Returns false when the path
    /// is outside the root or excluded.
    pub fn note(&mut self, path: &Path) -> bool {
        let Some(rel) = types::from_fs(&self.root, path) else {
            return false;
        };
        if self.exclude.excludes_path(&rel) {
            return false;
        }
        self.pending.insert(types::parent(&rel).to_string());
        true
    }

    /// Drain the pending set, dropping directories that no longer exist.
    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|dir| !self.exclude.excludes_path(dir))
            .filter(|dir| types::to_fs(&self.root, dir).is_dir())
            .collect()
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// True when `--debug` is implied by the environment.
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false)
}

/// Diagnostics always go to stderr; stdout carries protocol frames in
/// server mode.
pub fn init_tracing(debug: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
