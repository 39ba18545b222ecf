//! Recursive folder watch that yields a path once its file is fully written.

mod stability;

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::WatchSection;

pub use stability::StabilityTracker;

const READY_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch root {0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        source: notify::Error,
    },
}

pub type WatchResult<T> = Result<T, WatchError>;

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub file_name: String,
    pub stability: Duration,
    pub poll_interval: Duration,
    pub notify_poll_interval: Duration,
}

impl WatchSettings {
    pub fn from_config(config: &WatchSection) -> Self {
        Self {
            file_name: config.file_name.clone(),
            stability: config.stability(),
            poll_interval: config.poll_interval(),
            notify_poll_interval: config.notify_poll_interval(),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| name == self.file_name.as_str())
            .unwrap_or(false)
    }
}

/// Stream of settled files under one root.
///
/// Files already present when the watch starts are never emitted. The
/// stream ends when the watch is cancelled and cannot be restarted;
/// dropping it tears the watch down.
pub struct ReadyFiles {
    root: PathBuf,
    inner: ReceiverStream<PathBuf>,
    _watcher: RecommendedWatcher,
    _teardown: DropGuard,
}

impl std::fmt::Debug for ReadyFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyFiles")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ReadyFiles {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn next_ready(&mut self) -> Option<PathBuf> {
        futures::StreamExt::next(self).await
    }
}

impl Stream for ReadyFiles {
    type Item = PathBuf;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Starts watching `root` recursively. Must be called inside a Tokio runtime.
pub fn watch_folder(
    root: &Path,
    settings: &WatchSettings,
    cancel: &CancellationToken,
) -> WatchResult<ReadyFiles> {
    if !root.is_dir() {
        return Err(WatchError::NotADirectory(root.to_path_buf()));
    }
    let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<PathBuf>();
    let (ready_tx, ready_rx) = mpsc::channel(READY_CHANNEL_CAPACITY);

    let filter = settings.clone();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if !is_arrival(&event.kind) {
                    return;
                }
                for path in event.paths {
                    if filter.matches(&path) {
                        let _ = raw_tx.send(path);
                    }
                }
            }
            // Unreadable subtrees surface here; the rest of the tree keeps being watched.
            Err(err) => warn!(error = %err, paths = ?err.paths, "watch error"),
        },
        NotifyConfig::default().with_poll_interval(settings.notify_poll_interval),
    )
    .map_err(|source| WatchError::Notify {
        path: root.clone(),
        source,
    })?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|source| WatchError::Notify {
            path: root.clone(),
            source,
        })?;
    info!(root = %root.display(), file_name = %settings.file_name, "watching folder");

    let token = cancel.child_token();
    tokio::spawn(settle_loop(
        root.clone(),
        StabilityTracker::new(settings.stability),
        settings.poll_interval,
        raw_rx,
        ready_tx,
        token.clone(),
    ));

    Ok(ReadyFiles {
        root,
        inner: ReceiverStream::new(ready_rx),
        _watcher: watcher,
        _teardown: token.drop_guard(),
    })
}

/// Files created under the root or renamed into it. Writes to files that
/// already existed are not arrivals.
fn is_arrival(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any
            ))
    )
}

async fn settle_loop(
    root: PathBuf,
    mut tracker: StabilityTracker,
    poll_interval: Duration,
    mut raw_rx: mpsc::UnboundedReceiver<PathBuf>,
    ready_tx: mpsc::Sender<PathBuf>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            raw = raw_rx.recv() => match raw {
                Some(path) => {
                    let path = std::path::absolute(&path).unwrap_or(path);
                    tracker.observe(path, Instant::now());
                }
                None => break,
            },
            _ = ticker.tick() => {
                for path in tracker.poll(Instant::now()) {
                    debug!(path = %path.display(), "file settled");
                    if ready_tx.send(path).await.is_err() {
                        tracker.clear();
                        return;
                    }
                }
            }
        }
    }
    tracker.clear();
    debug!(root = %root.display(), "watch torn down");
}

/// Every file named like `settings.file_name` below `root`.
///
/// Unreadable directories are skipped; the scan carries on with the rest.
pub fn find_candidates(root: &Path, settings: &WatchSettings) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry during scan");
                continue;
            }
        };
        if entry.file_type().is_file() && settings.matches(entry.path()) {
            let path = std::path::absolute(entry.path()).unwrap_or_else(|_| entry.into_path());
            found.push(path);
        }
    }
    found.sort();
    found
}
