//! Secondary command session
//!
//! Backends without arbitrary command support run shell commands and remote
//! copies on a second, SCP-only connection opened with the same credentials.
//! The child session reports cache invalidations back to its parent through a
//! notice queue that the parent drains after every delegated call.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{ActionId, RememberingCallbacks, Session, SessionError, SessionStatus};
use crate::backend::{BackendError, Capability, FileSystemBackend, RemoteFileList};
use crate::config::{LookupMode, Protocol};

/// Cache event raised by the command session for its parent
#[derive(Debug, Clone)]
pub enum ParentNotice {
    DirectoryModified { path: String, sub_dirs: bool },
    DirectoryLoaded(RemoteFileList),
}

/// Child end of the parent/command session link
#[derive(Clone)]
pub struct SecondaryLink {
    notices: Arc<Mutex<Vec<ParentNotice>>>,
}

impl SecondaryLink {
    fn new(notices: Arc<Mutex<Vec<ParentNotice>>>) -> Self {
        Self { notices }
    }

    pub fn notify(&self, notice: ParentNotice) {
        self.notices.lock().push(notice);
    }
}

/// A dead command session does not take the main connection down with it
fn from_command_session(error: SessionError) -> SessionError {
    if error.is_fatal() {
        SessionError::Command(format!("Command session failed: {}", error))
    } else {
        error
    }
}

impl Session {
    /// Is the command session connected and ready
    pub fn command_session_opened(&self) -> bool {
        self.command_session
            .as_ref()
            .map(|c| c.status() == SessionStatus::Opened)
            .unwrap_or(false)
    }

    fn create_command_session(&mut self) -> Session {
        let mut data = self.data.clone();
        // the child is driven with real paths
        data.remote_directory = self.remote_current_directory();
        data.lock_in_home = false;
        data.protocol = Protocol::ScpOnly;
        data.lookup_user_groups = LookupMode::On;
        data.user_name = self.user_name();

        let callbacks = Arc::new(RememberingCallbacks::secondary(
            self.callbacks.inner(),
            self.remembered_password(),
        ));
        let link = SecondaryLink::new(self.command_notices.clone());
        let mut child = Session::with_callbacks(
            data,
            self.config.clone(),
            callbacks,
            self.factory.clone(),
            Some(link),
        );
        child.auto_read_directory = false;
        child.exception_on_fail = self.exception_on_fail;
        child
    }

    /// The command session, created and connected on first use
    pub(crate) async fn command_session(&mut self) -> Result<&mut Session, SessionError> {
        if self.command_session.as_ref().is_some_and(|c| !c.is_active()) {
            debug!("Dropping inactive command session");
            self.command_session = None;
        }

        if self.command_session.is_none() {
            info!("Opening command session for {}", self.session_name());
            let mut child = Box::new(self.create_command_session());
            Box::pin(child.open()).await.map_err(from_command_session)?;
            // keep transaction levels matched with ours
            for _ in 0..self.transaction_depth {
                child.begin_transaction();
            }
            self.command_session = Some(child);
        }

        self.drain_command_notices();
        self.command_session
            .as_deref_mut()
            .ok_or_else(|| SessionError::InvalidState("Command session not available".to_string()))
    }

    /// Apply the cache events queued by the command session
    pub(crate) fn drain_command_notices(&mut self) {
        let notices = std::mem::take(&mut *self.command_notices.lock());
        for notice in notices {
            match notice {
                ParentNotice::DirectoryModified { path, sub_dirs } => {
                    self.directory_modified(&path, sub_dirs)
                }
                ParentNotice::DirectoryLoaded(list) => {
                    if self.data.cache_directories {
                        self.directory_loaded(&list);
                    }
                }
            }
        }
    }

    /// Run `op` on the command session's backend, from our current directory
    pub(crate) async fn on_command_session<T, F>(&mut self, op: &mut F) -> Result<T, SessionError>
    where
        T: Send,
        F: for<'b> FnMut(&'b mut (dyn FileSystemBackend + 'static)) -> BoxFuture<'b, Result<T, BackendError>>
            + Send,
    {
        let current = self.working_directory().await?;
        let result = async {
            let command = self.command_session().await?;
            if !current.is_empty() && command.remote_current_directory() != current {
                command.set_exception_on_fail(true);
                let changed = Box::pin(command.change_directory(&current)).await;
                command.set_exception_on_fail(false);
                changed?;
            }
            let backend = command.backend_mut()?;
            match op(backend).await {
                Ok(value) => Ok(value),
                Err(e) => Err(Box::pin(command.backend_error(e)).await),
            }
        }
        .await;
        self.drain_command_notices();
        result.map_err(from_command_session)
    }

    /// Working directory of the command session's shell, read from the server
    pub(crate) async fn command_session_directory(&mut self) -> Result<String, SessionError> {
        let Some(command) = self.command_session.as_deref_mut() else {
            return Ok(String::new());
        };
        let result = Box::pin(command.read_current_directory()).await;
        let directory = command.remote_current_directory();
        self.drain_command_notices();
        result.map_err(from_command_session)?;
        Ok(directory)
    }

    /// `retry_backend` on the command session
    pub(crate) async fn retry_command_session<T, F>(
        &mut self,
        message: &str,
        action: Option<ActionId>,
        mut op: F,
    ) -> Result<T, SessionError>
    where
        T: Send,
        F: for<'b> FnMut(&'b mut (dyn FileSystemBackend + 'static)) -> BoxFuture<'b, Result<T, BackendError>>
            + Send,
    {
        loop {
            match self.on_command_session(&mut op).await {
                Ok(value) => {
                    self.action_log.commit(action);
                    return Ok(value);
                }
                Err(e) => self.retry_query(e, message, action).await?,
            }
        }
    }

    /// Run `op` on our backend when it has `capability`, else on the command session
    pub(crate) async fn retry_capable<T, F>(
        &mut self,
        capability: Capability,
        message: &str,
        action: Option<ActionId>,
        op: F,
    ) -> Result<T, SessionError>
    where
        T: Send,
        F: for<'b> FnMut(&'b mut (dyn FileSystemBackend + 'static)) -> BoxFuture<'b, Result<T, BackendError>>
            + Send,
    {
        if self.is_capable(capability) {
            self.retry_backend(message, action, op).await
        } else {
            debug!("Using command session for {:?}", capability);
            self.retry_command_session(message, action, op).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{limited_memory_session, ScriptedCallbacks};
    use crate::backend::{FaultKind, MemoryFs};
    use crate::session::QueryAnswers;
    use chrono::Utc;
    use futures_util::FutureExt;

    #[tokio::test]
    async fn test_command_session_is_created_on_demand() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_directory("/home/user/docs");
        let ui = ScriptedCallbacks::new();
        let mut session = limited_memory_session(&fs, ui.clone(), vec![]);
        session.open().await.unwrap();
        session.change_directory("docs").await.unwrap();
        assert!(!session.command_session_opened());

        let cwd = session
            .on_command_session(&mut |b| async move { Ok(b.current_directory()) }.boxed())
            .await
            .unwrap();
        assert_eq!(cwd, "/home/user/docs");
        assert!(session.command_session_opened());
        // the child never reports directory changes to the UI
        assert_eq!(
            ui.change_directories(),
            vec!["/home/user".to_string(), "/home/user/docs".to_string()]
        );
        assert!(!session.command_session.as_ref().unwrap().action_log().is_enabled());
    }

    #[tokio::test]
    async fn test_command_session_notices_reach_parent() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/home/user/a.txt", b"a", Utc::now());
        let ui = ScriptedCallbacks::new();
        let mut session = limited_memory_session(&fs, ui, vec![]);
        session.data.cache_directories = true;
        session.open().await.unwrap();
        assert!(session.directory_cache().has_file_list("/home/user"));

        let child = session.command_session().await.unwrap();
        child.directory_modified("/home/user", false);
        session.drain_command_notices();
        assert!(!session.directory_cache().has_file_list("/home/user"));
    }

    #[tokio::test]
    async fn test_command_session_failure_is_not_fatal_for_parent() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let mut session = limited_memory_session(&fs, ui.clone(), vec![]);
        session.open().await.unwrap();
        fs.lock().inject_fault("open", None, FaultKind::ConnectionLost, 1);
        // the reopen query of the child is declined
        ui.push_answers(&[QueryAnswers::ABORT]);

        let err = session
            .on_command_session(&mut |b| async move { Ok(b.current_directory()) }.boxed())
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
        assert!(session.is_active());
        assert!(!session.command_session_opened());
    }

    #[tokio::test]
    async fn test_command_session_follows_transactions() {
        let fs = MemoryFs::new().shared();
        let mut session = limited_memory_session(&fs, ScriptedCallbacks::new(), vec![]);
        session.open().await.unwrap();
        session.begin_transaction();
        session.command_session().await.unwrap();
        assert_eq!(session.command_session.as_ref().unwrap().transaction_depth(), 1);
        session.end_transaction().await.unwrap();
        assert_eq!(session.command_session.as_ref().unwrap().transaction_depth(), 0);
    }
}
