//! Keep a remote directory up to date
//!
//! Watches a local directory tree and, after each batch of changes settles,
//! synchronizes just the changed directory to the remote side.
//!
//! # Lifecycle
//! - `start`: optional full synchronization, scan and watch the directories
//! - changes: debounced per directory, each one synchronized on its own
//! - `stop` (or any synchronization error): the watcher is torn down
//!
//! Monitoring never retries. A failed synchronization ends it through
//! [`MonitorCallbacks::abort`].

mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{CopyParams, EngineConfig};
use crate::path_utils::{include_trailing_separator, relative_unix_path, unix_include_trailing_slash};
use crate::session::{OperationSide, Session, SessionError};
use crate::sync::{
    ChecklistAction, SynchronizeChecklist, SynchronizeMode, SynchronizeOptions, SynchronizeParams,
    SynchronizeRequest,
};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitoring is already running")]
    AlreadyStarted,

    #[error("Too many directories to watch ({count}, limit {max})")]
    TooManyDirectories { count: usize, max: usize },

    #[error("Cannot watch directory '{path}': {reason}")]
    InvalidDirectory { path: String, reason: String },

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl Serialize for MonitorError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Kind of a monitoring log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SynchronizeLogEntry {
    Scan,
    Start,
    Change,
    DirChange,
    Upload,
    Delete,
}

/// What the user sees of the monitoring
pub trait MonitorCallbacks: Send + Sync {
    /// More directories than `max_directories`; raise it (0 = unlimited) to go on
    fn too_many_directories(&self, max_directories: &mut usize);

    /// A watched directory became unusable; monitoring stops afterwards
    fn invalid(&self, directory: &str, error: &str);

    /// Monitoring ended on an error; `close` when the session is gone too
    fn abort(&self, close: bool);

    fn log(&self, entry: SynchronizeLogEntry, message: &str);
}

/// Runs one synchronization on behalf of the monitor
#[async_trait]
pub trait SynchronizeHandler: Send {
    /// Collect and apply; returns the applied checklist
    async fn synchronize(
        &mut self,
        request: &SynchronizeRequest,
    ) -> Result<SynchronizeChecklist, SessionError>;
}

#[async_trait]
impl SynchronizeHandler for Session {
    async fn synchronize(
        &mut self,
        request: &SynchronizeRequest,
    ) -> Result<SynchronizeChecklist, SessionError> {
        let checklist = self.synchronize_collect(request, None).await?;
        self.synchronize_apply(&checklist, &request.copy_param, request.params, None)
            .await?;
        Ok(checklist)
    }
}

/// What to keep up to date
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorParams {
    pub local_directory: String,
    pub remote_directory: String,
    pub params: SynchronizeParams,
    /// Watch subdirectories too
    pub recurse: bool,
    /// Run a full synchronization before watching
    pub synchronize_on_start: bool,
}

/// Settings shared by the monitor and its worker
#[derive(Clone)]
pub(crate) struct MonitorContext {
    pub params: MonitorParams,
    pub copy_param: CopyParams,
    pub options: Option<SynchronizeOptions>,
    pub callbacks: Arc<dyn MonitorCallbacks>,
    pub change_delay: Duration,
    pub max_directories: usize,
}

impl MonitorContext {
    pub fn log(&self, entry: SynchronizeLogEntry, message: &str) {
        info!("{:?}: {}", entry, message);
        self.callbacks.log(entry, message);
    }

    /// Full synchronization of the root
    pub fn full_request(&self) -> SynchronizeRequest {
        let mut params = self.params.params;
        params.no_recurse = !self.params.recurse;
        SynchronizeRequest {
            local_directory: self.params.local_directory.clone(),
            remote_directory: self.params.remote_directory.clone(),
            mode: SynchronizeMode::Remote,
            params,
            copy_param: self.copy_param.clone(),
            options: self.options.clone(),
        }
    }

    /// Synchronization of one changed directory; `None` when it is outside the root
    pub fn change_request(&self, directory: &Path) -> Option<SynchronizeRequest> {
        let root = Path::new(&self.params.local_directory);
        let relative = relative_unix_path(root, directory)?;
        let remote = remote_directory_for(&self.params.remote_directory, &relative);
        let is_root = relative.is_empty();

        let mut params = self.params.params;
        params.no_recurse = true;
        params.use_cache = true;
        params.delay_progress = true;
        params.sub_dirs = true;
        Some(SynchronizeRequest {
            local_directory: include_trailing_separator(&directory.to_string_lossy()),
            remote_directory: remote,
            mode: SynchronizeMode::Remote,
            params,
            copy_param: self.copy_param.clone(),
            // only meaningful for the root
            options: if is_root { self.options.clone() } else { None },
        })
    }

    /// Should the directory be watched
    pub fn accepts_directory(&self, directory: &Path) -> bool {
        let root = Path::new(&self.params.local_directory);
        if let (Some(options), Some(parent)) = (self.options.as_ref(), directory.parent()) {
            if parent == root {
                let name = directory
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if !options.matches_filter(&name) {
                    return false;
                }
            }
        }
        self.copy_param
            .allow_transfer(&directory.to_string_lossy(), OperationSide::Local, true)
    }

    /// A file the copy mask leaves out; its changes need no synchronization
    pub fn excludes_file(&self, path: &Path) -> bool {
        path.is_file()
            && !self
                .copy_param
                .allow_transfer(&path.to_string_lossy(), OperationSide::Local, false)
    }

    /// Log the applied uploads and deletions of a checklist
    pub fn log_operations(&self, checklist: &SynchronizeChecklist) {
        for item in checklist.iter().filter(|item| item.checked) {
            match item.action {
                ChecklistAction::UploadNew | ChecklistAction::UploadUpdate => self.log(
                    SynchronizeLogEntry::Upload,
                    &format!("Uploaded '{}'", item.local.full_path()),
                ),
                ChecklistAction::DeleteRemote => self.log(
                    SynchronizeLogEntry::Delete,
                    &format!("Deleted '{}'", item.remote.full_path()),
                ),
                _ => {}
            }
        }
    }
}

/// Remote counterpart of a directory `relative` to the monitored root
pub fn remote_directory_for(remote_root: &str, relative: &str) -> String {
    let root = unix_include_trailing_slash(remote_root);
    if relative.is_empty() {
        root
    } else {
        format!("{}{}/", root, relative)
    }
}

/// Did the subdirectory set of a synchronized directory change
pub fn subdirs_changed(checklist: &SynchronizeChecklist, recurse: bool) -> bool {
    recurse
        && checklist.iter().any(|item| {
            item.is_directory
                && matches!(
                    item.action,
                    ChecklistAction::UploadNew | ChecklistAction::DeleteRemote
                )
        })
}

pub struct ChangeMonitor {
    config: Arc<EngineConfig>,
    callbacks: Arc<dyn MonitorCallbacks>,
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ChangeMonitor {
    pub fn new(config: Arc<EngineConfig>, callbacks: Arc<dyn MonitorCallbacks>) -> Self {
        Self {
            config,
            callbacks,
            stop_tx: None,
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    pub async fn start<H>(
        &mut self,
        params: MonitorParams,
        copy_param: CopyParams,
        options: Option<SynchronizeOptions>,
        handler: Arc<Mutex<H>>,
    ) -> Result<(), MonitorError>
    where
        H: SynchronizeHandler + 'static,
    {
        if self.is_running() {
            return Err(MonitorError::AlreadyStarted);
        }
        let context = MonitorContext {
            params,
            copy_param,
            options,
            callbacks: self.callbacks.clone(),
            change_delay: self.config.monitor_change_delay(),
            max_directories: self.config.monitor_max_directories,
        };

        if context.params.synchronize_on_start {
            let checklist = handler.lock().await.synchronize(&context.full_request()).await?;
            context.log_operations(&checklist);
        }

        let root = PathBuf::from(&context.params.local_directory);
        if context.params.recurse {
            context.log(
                SynchronizeLogEntry::Scan,
                &format!("Scanning '{}' for subdirectories", root.display()),
            );
        }
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let worker = watcher::Worker::start(context, root, handler, stop_rx)?;
        self.worker = Some(tokio::spawn(worker.run()));
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// Tear the watcher down
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(()).await;
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!("Monitor worker ended abnormally: {}", e);
            }
            info!("Monitoring stopped");
        }
    }
}

impl Drop for ChangeMonitor {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}
