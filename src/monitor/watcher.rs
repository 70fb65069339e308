//! Directory watcher
//!
//! Every monitored directory gets its own non-recursive watch, so the set of
//! watched directories follows the filters exactly. The worker task collects
//! change notifications per directory and synchronizes a directory once no new
//! notification arrived for the change delay.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::{
    subdirs_changed, MonitorCallbacks, MonitorContext, MonitorError, SynchronizeHandler,
    SynchronizeLogEntry,
};
use crate::session::SessionError;

/// Directories to watch below `root`, `root` included.
///
/// Directories the filter rejects are skipped with everything below them.
pub(crate) fn scan_directories(
    root: &Path,
    recurse: bool,
    accepts: impl Fn(&Path) -> bool,
    max_directories: usize,
    callbacks: &dyn MonitorCallbacks,
) -> Result<Vec<PathBuf>, MonitorError> {
    if !root.is_dir() {
        return Err(MonitorError::InvalidDirectory {
            path: root.display().to_string(),
            reason: "not a directory".to_string(),
        });
    }

    let mut directories = vec![root.to_path_buf()];
    if recurse {
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !entry.file_type().is_dir() || accepts(entry.path()));
        for entry in walker {
            let entry = entry.map_err(|e| MonitorError::InvalidDirectory {
                path: e
                    .path()
                    .unwrap_or(root)
                    .display()
                    .to_string(),
                reason: e.to_string(),
            })?;
            if entry.file_type().is_dir() {
                directories.push(entry.into_path());
            }
        }
    }

    let mut max = max_directories;
    if max != 0 && directories.len() > max {
        callbacks.too_many_directories(&mut max);
        if max != 0 && directories.len() > max {
            return Err(MonitorError::TooManyDirectories {
                count: directories.len(),
                max,
            });
        }
    }
    Ok(directories)
}

/// Synchronize a batch of changed directories.
///
/// Returns whether the subdirectories of any of them changed.
pub(crate) async fn synchronize_batch<H>(
    context: &MonitorContext,
    handler: &Mutex<H>,
    batch: &BTreeSet<PathBuf>,
) -> Result<bool, SessionError>
where
    H: SynchronizeHandler,
{
    let mut changed = false;
    for directory in batch {
        let Some(request) = context.change_request(directory) else {
            warn!("Ignoring change outside of the monitored tree: {}", directory.display());
            continue;
        };
        context.log(
            SynchronizeLogEntry::Change,
            &format!("Change in '{}' detected", directory.display()),
        );
        let checklist = handler.lock().await.synchronize(&request).await?;
        context.log_operations(&checklist);
        changed |= subdirs_changed(&checklist, context.params.recurse);
    }
    Ok(changed)
}

pub(crate) struct Worker<H> {
    context: MonitorContext,
    root: PathBuf,
    handler: Arc<Mutex<H>>,
    watcher: RecommendedWatcher,
    watched: BTreeSet<PathBuf>,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    stop_rx: mpsc::Receiver<()>,
}

impl<H> Worker<H>
where
    H: SynchronizeHandler + 'static,
{
    /// Scan and watch the directories of `root`
    pub fn start(
        context: MonitorContext,
        root: PathBuf,
        handler: Arc<Mutex<H>>,
        stop_rx: mpsc::Receiver<()>,
    ) -> Result<Self, MonitorError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            // the worker is gone once monitoring ended
            let _ = events_tx.send(event);
        })?;

        let mut worker = Self {
            context,
            root,
            handler,
            watcher,
            watched: BTreeSet::new(),
            events,
            stop_rx,
        };
        let count = worker.rescan()?;
        worker.context.log(
            SynchronizeLogEntry::Start,
            &format!("Watching for changes, {} directories", count),
        );
        Ok(worker)
    }

    /// Bring the watches in line with the directory tree; returns the count
    fn rescan(&mut self) -> Result<usize, MonitorError> {
        let context = &self.context;
        let directories = scan_directories(
            &self.root,
            context.params.recurse,
            |path| context.accepts_directory(path),
            context.max_directories,
            context.callbacks.as_ref(),
        )?;
        let current: BTreeSet<PathBuf> = directories.into_iter().collect();

        for gone in self.watched.difference(&current) {
            // removed directories lose their watch on their own
            if let Err(e) = self.watcher.unwatch(gone) {
                debug!("Unwatching '{}': {}", gone.display(), e);
            }
        }
        for added in current.difference(&self.watched) {
            self.watcher
                .watch(added, RecursiveMode::NonRecursive)
                .map_err(|e| MonitorError::InvalidDirectory {
                    path: added.display().to_string(),
                    reason: e.to_string(),
                })?;
            debug!("Watching '{}'", added.display());
        }
        self.watched = current;
        Ok(self.watched.len())
    }

    /// Directory to synchronize for a changed path
    fn changed_directory(&self, path: &Path) -> Option<PathBuf> {
        match path.parent() {
            Some(parent) if self.watched.contains(parent) => Some(parent.to_path_buf()),
            _ if self.watched.contains(path) => Some(path.to_path_buf()),
            _ => None,
        }
    }

    fn invalidate(&self, directory: &str, error: &str) {
        error!("Monitoring of '{}' failed: {}", directory, error);
        self.context.callbacks.invalid(directory, error);
        self.context.callbacks.abort(false);
    }

    pub async fn run(mut self) {
        let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
        let delay = self.context.change_delay;
        loop {
            tokio::select! {
                _ = self.stop_rx.recv() => break,
                event = self.events.recv() => match event {
                    Some(Ok(event)) => {
                        if matches!(event.kind, EventKind::Access(_)) {
                            continue;
                        }
                        for path in &event.paths {
                            if self.context.excludes_file(path) {
                                continue;
                            }
                            if let Some(directory) = self.changed_directory(path) {
                                pending.insert(directory);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let directory = e
                            .paths
                            .first()
                            .unwrap_or(&self.root)
                            .display()
                            .to_string();
                        self.invalidate(&directory, &e.to_string());
                        break;
                    }
                    None => break,
                },
                _ = tokio::time::sleep(delay), if !pending.is_empty() => {
                    let batch = std::mem::take(&mut pending);
                    match synchronize_batch(&self.context, &self.handler, &batch).await {
                        Ok(false) => {}
                        Ok(true) => match self.rescan() {
                            Ok(count) => self.context.log(
                                SynchronizeLogEntry::DirChange,
                                &format!("Watching for changes, {} directories", count),
                            ),
                            Err(e) => {
                                let directory = self.root.display().to_string();
                                self.invalidate(&directory, &e.to_string());
                                break;
                            }
                        },
                        Err(e) => {
                            warn!("Synchronization failed, monitoring stopped: {}", e);
                            self.context.callbacks.abort(e.is_fatal());
                            break;
                        }
                    }
                }
            }
        }
        info!("Monitoring of '{}' ended", self.root.display());
    }
}
