//! Session Module
//!
//! A [`Session`] owns one remote file system connection and drives every file
//! operation through it.
//!
//! # Features
//! - Open/close state machine with optional tunnel and reconnect policy
//! - Transactions that defer directory refreshes until the outermost end
//! - Uniform retry/skip/abort handling of failed operations
//! - Listing cache and `cd` shortcut cache
//! - Lazily created secondary command session for shell-only operations
//!
//! A session is driven by one task through `&mut self`; nothing inside it runs in
//! parallel. Concurrency comes from running several sessions.

pub mod action_log;
pub mod cache;
pub mod callbacks;
pub mod command;
mod directory;
mod error;
pub mod operations;
pub mod progress;
pub mod reconnect;
pub mod registry;
#[cfg(test)]
pub(crate) mod testing;
pub mod transfer;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendError, BackendFactory, Capability, FileSystemBackend, FileSystemInfo, RemoteFileList,
    SessionInfo, PARTIAL_EXT,
};
use crate::config::{EngineConfig, LookupMode, SessionData};
use crate::tunnel::Tunnel;

pub use action_log::{ActionId, ActionKind, ActionLog, ActionState, SessionAction};
pub use cache::{DirectoryCache, DirectoryChangesCache};
pub use callbacks::{
    NullCallbacks, Prompt, PromptKind, QueryAnswers, QueryButtonAlias, QueryParams,
    RememberingCallbacks, SessionCallbacks,
};
pub use command::{ParentNotice, SecondaryLink};
pub use error::SessionError;
pub use operations::{
    CalculateSizeParams, CalculateSizeStats, CustomCommandParams, DeleteParams, FileListItem,
};
pub use progress::{
    BatchOverwrite, CancelStatus, FileOperation, FinishedEvent, OnceDoneOperation,
    OperationProgress, OperationSide,
};
pub use reconnect::ReopenParams;
pub use registry::{RegistryError, TerminalList};
pub use transfer::{OverwriteFileParams, TransferParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Closed,
    Opening,
    Opened,
    Closing,
}

/// Backend command kinds, used to decide what to refresh afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsCommand {
    ChangeDirectory,
    HomeDirectory,
    ListDirectory,
    LookupUsersGroups,
    CopyToRemote,
    CopyToLocal,
    DeleteFile,
    RenameFile,
    MoveFile,
    CopyFile,
    CreateDirectory,
    ChangeMode,
    ChangeGroup,
    ChangeOwner,
    ChangeProperties,
    AnyCommand,
}

impl FsCommand {
    fn changes_directory(self) -> bool {
        matches!(
            self,
            FsCommand::ChangeDirectory | FsCommand::HomeDirectory | FsCommand::AnyCommand
        )
    }

    fn modifies_files(self) -> bool {
        matches!(
            self,
            FsCommand::CopyToRemote
                | FsCommand::DeleteFile
                | FsCommand::RenameFile
                | FsCommand::MoveFile
                | FsCommand::CopyFile
                | FsCommand::CreateDirectory
                | FsCommand::ChangeMode
                | FsCommand::ChangeGroup
                | FsCommand::ChangeOwner
                | FsCommand::ChangeProperties
                | FsCommand::AnyCommand
        )
    }
}

/// Decision taken after a failed file operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperationOutcome {
    Retry,
    /// Retry the alternative way offered by the query
    SpecialRetry,
    Skip,
    Abort,
}

impl FileOperationOutcome {
    pub fn from_answer(answer: QueryAnswers) -> Self {
        if answer == QueryAnswers::RETRY {
            FileOperationOutcome::Retry
        } else if answer == QueryAnswers::YES {
            FileOperationOutcome::SpecialRetry
        } else if answer == QueryAnswers::SKIP {
            FileOperationOutcome::Skip
        } else {
            FileOperationOutcome::Abort
        }
    }
}

/// Error text with its context
fn compose_message(message: &str, error: &SessionError) -> String {
    if message.is_empty() {
        error.to_string()
    } else {
        format!("{}: {}", message, error)
    }
}

/// One remote file system session
pub struct Session {
    id: String,
    data: SessionData,
    config: Arc<EngineConfig>,
    callbacks: Arc<RememberingCallbacks>,
    factory: Arc<dyn BackendFactory>,
    backend: Option<Box<dyn FileSystemBackend>>,
    status: SessionStatus,
    files: RemoteFileList,
    /// Last known current directory, kept when the backend is gone
    current_directory: String,
    directory_cache: DirectoryCache,
    directory_changes_cache: Option<DirectoryChangesCache>,
    last_directory_change: String,
    lock_directory: String,
    transaction_depth: u32,
    suspend_transaction: bool,
    pending_read_current_directory: bool,
    pending_read_directory: bool,
    auto_read_directory: bool,
    exception_on_fail: u32,
    confirm_overwriting: bool,
    users_groups_looked_up: bool,
    reopen_retries: u32,
    guard_depth: u32,
    guard_error: Option<SessionError>,
    progress: Option<OperationProgress>,
    action_log: ActionLog,
    tunnel: Option<Tunnel>,
    command_session: Option<Box<Session>>,
    command_notices: Arc<Mutex<Vec<ParentNotice>>>,
    secondary: Option<SecondaryLink>,
}

impl Session {
    pub fn new(
        data: SessionData,
        config: Arc<EngineConfig>,
        callbacks: Arc<dyn SessionCallbacks>,
        factory: Arc<dyn BackendFactory>,
    ) -> Self {
        let callbacks = Arc::new(RememberingCallbacks::new(callbacks));
        Self::with_callbacks(data, config, callbacks, factory, None)
    }

    fn with_callbacks(
        data: SessionData,
        config: Arc<EngineConfig>,
        callbacks: Arc<RememberingCallbacks>,
        factory: Arc<dyn BackendFactory>,
        secondary: Option<SecondaryLink>,
    ) -> Self {
        let session_name = data.session_name();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            confirm_overwriting: config.confirm_overwriting,
            action_log: ActionLog::new(&session_name, secondary.is_none()),
            data,
            config,
            callbacks,
            factory,
            backend: None,
            status: SessionStatus::Closed,
            files: RemoteFileList::default(),
            current_directory: String::new(),
            directory_cache: DirectoryCache::new(),
            directory_changes_cache: None,
            last_directory_change: String::new(),
            lock_directory: String::new(),
            transaction_depth: 0,
            suspend_transaction: false,
            pending_read_current_directory: false,
            pending_read_directory: false,
            auto_read_directory: true,
            exception_on_fail: 0,
            users_groups_looked_up: false,
            reopen_retries: 0,
            guard_depth: 0,
            guard_error: None,
            progress: None,
            tunnel: None,
            command_session: None,
            command_notices: Arc::new(Mutex::new(Vec::new())),
            secondary,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_data(&self) -> &SessionData {
        &self.data
    }

    pub fn session_name(&self) -> String {
        self.data.session_name()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.backend.as_ref().map(|b| b.is_active()).unwrap_or(false)
    }

    pub fn is_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    /// Listing of the current directory
    pub fn files(&self) -> &RemoteFileList {
        &self.files
    }

    pub fn directory_cache(&self) -> &DirectoryCache {
        &self.directory_cache
    }

    pub fn action_log(&self) -> &ActionLog {
        &self.action_log
    }

    pub fn progress(&self) -> Option<&OperationProgress> {
        self.progress.as_ref()
    }

    pub fn transaction_depth(&self) -> u32 {
        self.transaction_depth
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_depth > 0 && !self.suspend_transaction
    }

    pub fn auto_read_directory(&self) -> bool {
        self.auto_read_directory
    }

    pub fn set_auto_read_directory(&mut self, value: bool) {
        self.auto_read_directory = value;
    }

    pub fn exception_on_fail(&self) -> bool {
        self.exception_on_fail > 0
    }

    /// Nested switch: failures raise `Command` errors instead of asking the user
    pub fn set_exception_on_fail(&mut self, value: bool) {
        if value {
            self.exception_on_fail += 1;
        } else {
            self.exception_on_fail = self.exception_on_fail.saturating_sub(1);
        }
        if let Some(command) = self.command_session.as_mut() {
            command.set_exception_on_fail(value);
        }
    }

    pub fn confirm_overwriting(&self) -> bool {
        self.confirm_overwriting
    }

    pub fn is_capable(&self, capability: Capability) -> bool {
        self.backend
            .as_ref()
            .map(|b| b.is_capable(capability))
            .unwrap_or(false)
    }

    /// Is `name` a partial file left behind by an interrupted transfer
    pub fn temporary_transfer_file(&self, name: &str) -> bool {
        match self.backend.as_ref() {
            Some(backend) => backend.temporary_transfer_file(name),
            None => name.ends_with(PARTIAL_EXT),
        }
    }

    pub fn file_system_info(&self) -> FileSystemInfo {
        self.backend
            .as_ref()
            .map(|b| b.file_system_info())
            .unwrap_or_default()
    }

    pub fn session_info(&self) -> SessionInfo {
        self.backend
            .as_ref()
            .map(|b| b.session_info())
            .unwrap_or_default()
    }

    pub fn user_name(&self) -> String {
        match self.backend.as_ref().map(|b| b.user_name()) {
            Some(name) if !name.is_empty() => name,
            _ => self.data.user_name.clone(),
        }
    }

    /// Password that opened this session, typed or configured
    pub fn remembered_password(&self) -> Option<String> {
        self.callbacks
            .remembered_password()
            .or_else(|| self.data.password().map(str::to_string))
    }

    /// Port of the local tunnel listener while a tunnel is open
    pub fn tunnel_local_port(&self) -> Option<u16> {
        self.tunnel.as_ref().map(|t| t.local_port())
    }

    fn backend_mut(&mut self) -> Result<&mut (dyn FileSystemBackend + 'static), SessionError> {
        self.backend
            .as_deref_mut()
            .ok_or(SessionError::Backend(BackendError::NotConnected))
    }

    // ---- open / close ----

    /// Connect, reconnecting on fatal errors while the user agrees
    pub async fn open(&mut self) -> Result<(), SessionError> {
        loop {
            self.do_information("", true).await?;
            match self.try_open().await {
                Ok(()) => break,
                Err(mut e) if e.is_fatal() => {
                    if self.do_query_reopen(&mut e).await? {
                        self.backend = None;
                        self.close_tunnel();
                        self.status = SessionStatus::Closed;
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        self.reopen_retries = 0;
        Ok(())
    }

    /// Every failure while opening is fatal
    async fn try_open(&mut self) -> Result<(), SessionError> {
        match self.do_try_open().await {
            Ok(()) => Ok(()),
            Err(e @ SessionError::Fatal { .. }) => Err(e),
            Err(e) => Err(self.fatal_error(e, "").await),
        }
    }

    async fn do_try_open(&mut self) -> Result<(), SessionError> {
        if self.backend.is_none() {
            self.status = SessionStatus::Opening;
            self.reset_connection();

            let mut target = self.data.clone();
            if self.data.tunnel.enabled {
                self.do_information("Opening tunnel", true).await?;
                let tunnel =
                    Tunnel::open(&self.data, &self.config, self.callbacks.clone()).await?;
                target.host_name = "127.0.0.1".to_string();
                target.port_number = tunnel.local_port();
                info!(
                    "Connecting to {}:{} through tunnel port {}",
                    self.data.host_name, self.data.port_number, target.port_number
                );
                self.tunnel = Some(tunnel);
            }

            let backend = self
                .factory
                .create(target.protocol, &target, self.callbacks.clone())?;
            self.backend = Some(backend);
        }

        self.status = SessionStatus::Opening;
        self.backend_mut()?.open().await?;
        self.users_groups_looked_up = false;

        if self.data.cache_directory_changes {
            self.directory_changes_cache = Some(DirectoryChangesCache::new(
                self.config.cache_directory_changes_max_size,
            ));
        }

        self.do_startup().await?;
        self.do_information("Ready", true).await?;
        self.status = SessionStatus::Opened;
        info!("Session {} opened", self.session_name());
        Ok(())
    }

    fn reset_connection(&mut self) {
        self.directory_changes_cache = None;
        self.current_directory.clear();
        self.files.set_directory("");
    }

    async fn do_startup(&mut self) -> Result<(), SessionError> {
        debug!("Doing startup conversation with host");
        self.begin_transaction();
        let result = self.startup_conversation().await;
        let ended = self.end_transaction().await;
        result?;
        ended?;
        debug!("Startup conversation with host finished");
        Ok(())
    }

    async fn startup_conversation(&mut self) -> Result<(), SessionError> {
        self.do_information("Starting session", true).await?;
        // the listing is loaded last, when the transaction ends
        self.pending_read_current_directory = true;
        self.pending_read_directory = self.auto_read_directory;

        if let Err(e) = self.backend_mut()?.do_startup().await {
            return Err(self.backend_error(e).await);
        }

        if let Err(e) = self.lookup_users_groups().await {
            if !self.is_active() || self.data.lookup_user_groups == LookupMode::On {
                self.command_error(e, "Error looking up user groups", QueryAnswers::NONE)
                    .await?;
            } else {
                debug!("Ignoring user group lookup failure: {}", e);
            }
        }

        if !self.data.remote_directory.is_empty() {
            let directory = self.data.remote_directory.clone();
            self.change_directory(&directory).await?;
        }
        Ok(())
    }

    /// Load users and groups once per connection
    pub async fn lookup_users_groups(&mut self) -> Result<(), SessionError> {
        if self.users_groups_looked_up
            || self.data.lookup_user_groups == LookupMode::Off
            || !self.is_capable(Capability::UserGroupListing)
        {
            return Ok(());
        }
        self.do_information("Looking up groups and users", true).await?;
        debug!("Looking up groups and users");
        self.users_groups_looked_up = true;
        self.backend_mut()?.lookup_users_groups().await?;
        self.react_on_command(FsCommand::LookupUsersGroups).await
    }

    /// Disconnect the backend and the command session
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.status == SessionStatus::Closed && self.backend.is_none() {
            return Ok(());
        }
        self.status = SessionStatus::Closing;
        if let Some(backend) = self.backend.as_deref_mut() {
            if let Err(e) = backend.close().await {
                warn!("Error closing backend: {}", e);
            }
        }
        self.backend = None;
        if let Some(command) = self.command_session.as_mut() {
            if command.status() != SessionStatus::Closed {
                if let Err(e) = Box::pin(command.close()).await {
                    warn!("Error closing command session: {}", e);
                }
            }
        }
        self.notify_closed();
        info!("Session {} closed", self.session_name());
        Ok(())
    }

    /// Connection is gone: drop the tunnel, tell the UI
    fn notify_closed(&mut self) {
        self.close_tunnel();
        if let Err(e) = self.callbacks.closed() {
            if e.is_fatal() && self.guard_depth > 0 {
                if self.guard_error.is_none() {
                    self.guard_error = Some(e);
                }
            } else {
                warn!("Closed callback failed: {}", e);
            }
        }
        self.status = SessionStatus::Closed;
    }

    fn close_tunnel(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.close();
        }
    }

    /// Keep the connection alive
    pub async fn idle(&mut self) -> Result<(), SessionError> {
        if !self.is_active() {
            return Ok(());
        }
        if self.tunnel.as_ref().is_some_and(|t| !t.is_open()) {
            return Err(self
                .fatal_error(SessionError::fatal("Tunnel connection lost"), "")
                .await);
        }
        if let Err(e) = self.backend_mut()?.idle().await {
            return Err(self.backend_error(e).await);
        }
        if let Some(command) = self.command_session.as_mut() {
            if command.status() == SessionStatus::Opened {
                if let Err(e) = Box::pin(command.idle()).await {
                    // a dropped command session is reopened when needed
                    if command.is_active() {
                        self.handle_extended_exception(&e).await?;
                    } else {
                        debug!("Command session dropped while idle: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    // ---- transactions ----

    pub fn begin_transaction(&mut self) {
        if self.transaction_depth == 0 {
            self.pending_read_current_directory = false;
            self.pending_read_directory = false;
        }
        self.transaction_depth += 1;
        if let Some(command) = self.command_session.as_mut() {
            if command.status() == SessionStatus::Opened {
                command.begin_transaction();
            }
        }
    }

    /// Leave a transaction; the outermost end performs the deferred reads
    pub async fn end_transaction(&mut self) -> Result<(), SessionError> {
        if self.transaction_depth == 0 {
            return Err(SessionError::InvalidState(
                "Can't end transaction, not in transaction".to_string(),
            ));
        }
        self.transaction_depth -= 1;

        let mut result = Ok(());
        // a fatal error inside the transaction has closed the session already
        if self.is_active() && self.transaction_depth == 0 {
            result = self.flush_pending_reads().await;
            self.pending_read_current_directory = false;
            self.pending_read_directory = false;
        }

        if let Some(command) = self.command_session.as_mut() {
            if command.is_active() && command.transaction_depth() > 0 {
                if let Err(e) = Box::pin(command.end_transaction()).await {
                    warn!("Command session transaction end failed: {}", e);
                }
            }
        }
        result
    }

    async fn flush_pending_reads(&mut self) -> Result<(), SessionError> {
        let current_pending = self.pending_read_current_directory;
        if current_pending {
            self.read_current_directory().await?;
        }
        if self.pending_read_directory {
            self.read_directory(!current_pending, false).await?;
        }
        Ok(())
    }

    /// Refresh after a backend command, or defer the refresh inside a transaction
    pub(crate) async fn react_on_command(&mut self, command: FsCommand) -> Result<(), SessionError> {
        if command.changes_directory() {
            if !self.in_transaction() {
                self.read_current_directory().await?;
                if self.auto_read_directory {
                    self.read_directory(false, false).await?;
                }
            } else {
                self.pending_read_current_directory = true;
                if self.auto_read_directory {
                    self.pending_read_directory = true;
                }
            }
        } else if command.modifies_files()
            && self.auto_read_directory
            && self.config.auto_read_directory_after_op
        {
            if !self.in_transaction() {
                self.read_directory(true, false).await?;
            } else {
                self.pending_read_directory = true;
            }
        }
        Ok(())
    }

    // ---- callbacks ----

    fn guard_enter(&mut self) -> bool {
        self.guard_depth += 1;
        self.guard_depth == 1
    }

    async fn guard_leave<T: Send>(
        &mut self,
        outermost: bool,
        result: Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let result = match result {
            Err(e) if e.is_fatal() => Err(self.fatal_error(e, "").await),
            other => other,
        };
        self.guard_depth -= 1;
        if outermost {
            if let Some(stored) = self.guard_error.take() {
                return Err(stored.into_fatal());
            }
        }
        result
    }

    /// Run a UI callback; a fatal error it raises surfaces once, as `Fatal`
    async fn guarded<T, F>(&mut self, callback: F) -> Result<T, SessionError>
    where
        T: Send,
        F: FnOnce(&dyn SessionCallbacks) -> Result<T, SessionError> + Send,
    {
        let outermost = self.guard_enter();
        let callbacks = self.callbacks.clone();
        let result = callback(callbacks.as_ref());
        self.guard_leave(outermost, result).await
    }

    pub(crate) async fn do_information(&mut self, text: &str, status: bool) -> Result<(), SessionError> {
        self.guarded(|cb| cb.information(text, status)).await
    }

    pub(crate) async fn do_progress(&mut self) -> Result<(), SessionError> {
        let Some(mut progress) = self.progress.take() else {
            return Ok(());
        };
        let result = self.guarded(|cb| cb.progress(&mut progress)).await;
        self.progress = Some(progress);
        result
    }

    pub(crate) async fn do_finished(
        &mut self,
        file_name: &str,
        success: bool,
        once_done: &mut OnceDoneOperation,
    ) -> Result<(), SessionError> {
        let Some(progress) = self.progress.as_ref() else {
            return Ok(());
        };
        let mut event = FinishedEvent {
            operation: progress.operation,
            side: progress.side,
            temp: progress.temp,
            file_name: file_name.to_string(),
            success,
            once_done: *once_done,
        };
        let result = self.guarded(|cb| cb.finished(&mut event)).await;
        *once_done = event.once_done;
        result
    }

    /// Ask the user, with progress time accounting paused
    pub(crate) async fn query_user(
        &mut self,
        query: &str,
        more_messages: &[String],
        answers: QueryAnswers,
        params: &QueryParams,
    ) -> Result<QueryAnswers, SessionError> {
        if let Some(progress) = self.progress.as_mut() {
            progress.suspend();
        }
        let result = self
            .guarded(|cb| cb.query_user(query, more_messages, answers, params))
            .await;
        if let Some(progress) = self.progress.as_mut() {
            progress.resume();
        }
        result
    }

    pub(crate) async fn handle_extended_exception(
        &mut self,
        error: &SessionError,
    ) -> Result<(), SessionError> {
        warn!("{}", error);
        self.guarded(|cb| cb.show_extended_exception(error)).await
    }

    // ---- errors ----

    /// Close the session and turn `error` into `Fatal`.
    ///
    /// Inside a guarded callback the error is kept by the guard and the silent
    /// `GuardAbort` is returned instead.
    pub(crate) async fn fatal_error(&mut self, error: SessionError, message: &str) -> SessionError {
        let reopen_queried = error.reopen_queried();
        let fatal = if message.is_empty() {
            error.into_fatal()
        } else {
            SessionError::Fatal {
                message: compose_message(message, &error),
                reopen_queried,
            }
        };
        error!("{}", fatal);

        if self.is_active() {
            if let Err(e) = self.close().await {
                warn!("Error closing session after fatal error: {}", e);
            }
        } else if self.backend.is_some() {
            self.backend = None;
            self.notify_closed();
        }

        if self.guard_depth > 0 {
            if self.guard_error.is_none() {
                self.guard_error = Some(fatal);
            }
            return SessionError::GuardAbort;
        }
        fatal
    }

    /// Map a backend failure, closing the session on connection loss
    pub(crate) async fn backend_error(&mut self, error: BackendError) -> SessionError {
        if error.is_fatal() {
            self.fatal_error(SessionError::Backend(error), "").await
        } else {
            SessionError::Backend(error)
        }
    }

    /// Report a failed command and get the user's decision.
    ///
    /// With no `answers` the error is only shown and `NONE` is returned.
    pub(crate) async fn command_error(
        &mut self,
        error: SessionError,
        message: &str,
        answers: QueryAnswers,
    ) -> Result<QueryAnswers, SessionError> {
        if error.is_fatal() {
            return Err(self.fatal_error(error, message).await);
        }
        if error.is_abort() || error.is_skip() {
            return Err(error);
        }
        if self.exception_on_fail > 0 {
            return Err(SessionError::Command(compose_message(message, &error)));
        }
        if answers.is_empty() {
            let command = SessionError::Command(compose_message(message, &error));
            self.handle_extended_exception(&command).await?;
            return Ok(QueryAnswers::NONE);
        }

        let can_skip = answers.contains(QueryAnswers::SKIP) && self.progress.is_some();
        if can_skip && self.progress.as_ref().map(|p| p.skip_to_all).unwrap_or(false) {
            return Ok(QueryAnswers::SKIP);
        }
        let mut answers = answers;
        let mut params = QueryParams {
            allow_continue_on_error: true,
            ..Default::default()
        };
        if can_skip {
            answers |= QueryAnswers::ALL;
            params = params.with_alias(QueryAnswers::ALL, "Skip all");
        }
        let answer = self
            .query_user(message, &[error.to_string()], answers, &params)
            .await?;
        if answer == QueryAnswers::ALL {
            if let Some(progress) = self.progress.as_mut() {
                progress.skip_to_all = true;
            }
            return Ok(QueryAnswers::SKIP);
        }
        Ok(answer)
    }

    /// Retry/Skip/Abort decision after `error`; `Ok` means retry
    pub(crate) async fn retry_query(
        &mut self,
        error: SessionError,
        message: &str,
        action: Option<ActionId>,
    ) -> Result<(), SessionError> {
        let error_text = error.to_string();
        let answers = QueryAnswers::RETRY | QueryAnswers::SKIP | QueryAnswers::ABORT;
        let answer = match self.command_error(error, message, answers).await {
            Ok(answer) => answer,
            Err(e) => {
                self.action_log.rollback(action, Some(&e.to_string()));
                return Err(e);
            }
        };
        match FileOperationOutcome::from_answer(answer) {
            FileOperationOutcome::Retry | FileOperationOutcome::SpecialRetry => {
                self.action_log.restart(action);
                Ok(())
            }
            FileOperationOutcome::Skip => {
                let cancelled = self.progress.as_ref().map(|p| p.is_cancelled()).unwrap_or(false);
                if cancelled {
                    self.action_log.rollback(action, Some(&error_text));
                } else {
                    self.action_log.cancel(action);
                }
                Err(SessionError::Skip(compose_message(message, &SessionError::Command(error_text))))
            }
            FileOperationOutcome::Abort => {
                self.action_log.rollback(action, Some(&error_text));
                Err(SessionError::Abort)
            }
        }
    }

    /// Run a backend operation, asking Retry/Skip/Abort on failure
    pub(crate) async fn retry_backend<T, F>(
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
            let result = match self.backend.as_deref_mut() {
                Some(backend) => op(backend).await,
                None => Err(BackendError::NotConnected),
            };
            match result {
                Ok(value) => {
                    self.action_log.commit(action);
                    return Ok(value);
                }
                Err(e) => self.retry_query(SessionError::Backend(e), message, action).await?,
            }
        }
    }

    /// Decision after a failed local operation inside a transfer
    pub(crate) async fn file_operation_loop_query(
        &mut self,
        error: &SessionError,
        message: &str,
        allow_skip: bool,
        special_retry: Option<&str>,
    ) -> Result<FileOperationOutcome, SessionError> {
        if allow_skip && self.progress.as_ref().map(|p| p.skip_to_all).unwrap_or(false) {
            return Ok(FileOperationOutcome::Skip);
        }
        let mut answers = QueryAnswers::RETRY | QueryAnswers::ABORT;
        let mut params = QueryParams {
            allow_continue_on_error: true,
            ..Default::default()
        };
        if allow_skip {
            answers |= QueryAnswers::SKIP | QueryAnswers::ALL;
            params = params.with_alias(QueryAnswers::ALL, "Skip all");
        }
        if let Some(label) = special_retry {
            answers |= QueryAnswers::YES;
            params = params.with_alias(QueryAnswers::YES, label);
        }
        let answer = self
            .query_user(message, &[error.to_string()], answers, &params)
            .await?;
        let outcome = if answer == QueryAnswers::ALL {
            if let Some(progress) = self.progress.as_mut() {
                progress.skip_to_all = true;
            }
            FileOperationOutcome::Skip
        } else {
            FileOperationOutcome::from_answer(answer)
        };
        if outcome == FileOperationOutcome::Abort {
            if let Some(progress) = self.progress.as_mut() {
                progress.set_cancel_at_least(CancelStatus::Cancel);
            }
        }
        Ok(outcome)
    }

    /// Run a local file operation until it succeeds or the user gives up.
    ///
    /// `op` receives `true` when the user picked the special retry.
    pub(crate) async fn file_operation_loop<T, F>(
        &mut self,
        message: &str,
        allow_skip: bool,
        special_retry: Option<&str>,
        mut op: F,
    ) -> Result<T, SessionError>
    where
        T: Send,
        F: FnMut(bool) -> std::io::Result<T> + Send,
    {
        let mut special = false;
        loop {
            let error = match op(special) {
                Ok(value) => return Ok(value),
                Err(e) => SessionError::IoError(e),
            };
            match self
                .file_operation_loop_query(&error, message, allow_skip, special_retry)
                .await?
            {
                FileOperationOutcome::Retry => special = false,
                FileOperationOutcome::SpecialRetry => special = true,
                FileOperationOutcome::Skip | FileOperationOutcome::Abort => {
                    let text = compose_message(message, &error);
                    return Err(if allow_skip {
                        SessionError::Skip(text)
                    } else {
                        SessionError::Command(text)
                    });
                }
            }
        }
    }

    /// Start (or re-point) per-file progress when the running operation is one of `operations`
    pub(crate) async fn start_operation_with_file(
        &mut self,
        file_name: &str,
        operations: &[FileOperation],
    ) -> Result<(), SessionError> {
        let Some(progress) = self.progress.as_mut() else {
            return Ok(());
        };
        if !operations.contains(&progress.operation) {
            return Ok(());
        }
        if progress.is_cancelled() {
            return Err(SessionError::Abort);
        }
        progress.set_file(file_name);
        self.do_progress().await
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{memory_session, ScriptedCallbacks};
    use super::*;
    use crate::backend::{FaultKind, MemoryFs};
    use chrono::Utc;

    #[tokio::test]
    async fn test_open_reads_directory_once() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_file("/home/user/a.txt", b"a", Utc::now());
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        assert_eq!(session.status(), SessionStatus::Opened);
        assert!(session.is_active());
        assert_eq!(fs.lock().read_current_directory_count, 1);
        assert_eq!(fs.lock().read_directory_count, 1);
        assert!(session.files().find_file("a.txt").is_some());
        assert_eq!(ui.change_directories(), vec!["/home/user".to_string()]);
    }

    #[tokio::test]
    async fn test_transaction_defers_reads() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui);
        session.open().await.unwrap();
        let (current_before, listing_before) = {
            let fs = fs.lock();
            (fs.read_current_directory_count, fs.read_directory_count)
        };

        session.begin_transaction();
        session.create_directory("one", None).await.unwrap();
        session.create_directory("two", None).await.unwrap();
        session.change_directory("/home/user/one").await.unwrap();
        session.change_directory("..").await.unwrap();
        assert_eq!(fs.lock().read_current_directory_count, current_before);
        assert_eq!(fs.lock().read_directory_count, listing_before);
        session.end_transaction().await.unwrap();

        assert_eq!(fs.lock().read_current_directory_count, current_before + 1);
        assert_eq!(fs.lock().read_directory_count, listing_before + 1);
        assert!(session.files().find_file("two").is_some());
        assert_eq!(session.transaction_depth(), 0);
    }

    #[tokio::test]
    async fn test_end_transaction_outside_transaction_fails() {
        let fs = MemoryFs::new().shared();
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        assert!(matches!(
            session.end_transaction().await,
            Err(SessionError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_open_failure_queries_reopen_then_gives_up() {
        let fs = MemoryFs::new().shared();
        fs.lock().inject_fault("open", None, FaultKind::ConnectionLost, 10);
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::RETRY, QueryAnswers::ABORT]);
        let mut session = memory_session(&fs, ui.clone());

        let err = session.open().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.status(), SessionStatus::Closed);
        assert_eq!(ui.queries().len(), 2);
    }

    #[tokio::test]
    async fn test_fatal_callback_surfaces_once() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();

        ui.fail_information_with_fatal(true);
        let err = session.do_information("status", false).await.unwrap_err();
        assert!(matches!(err, SessionError::Fatal { .. }));
        assert!(!session.is_active());
        assert_eq!(ui.closed_count(), 1);
        assert_eq!(session.guard_depth, 0);
        assert!(session.guard_error.is_none());
    }

    #[tokio::test]
    async fn test_idle_detects_connection_loss() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();
        fs.lock().inject_fault("idle", None, FaultKind::ConnectionLost, 1);

        let err = session.idle().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.status(), SessionStatus::Closed);
        // idle on a closed session is a no-op
        session.idle().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_error_skip_all_is_sticky() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::ALL]);
        let mut session = memory_session(&fs, ui.clone());
        session.progress = Some(OperationProgress::start(
            FileOperation::Delete,
            OperationSide::Remote,
            2,
            false,
        ));
        let answers = QueryAnswers::RETRY | QueryAnswers::SKIP | QueryAnswers::ABORT;
        let first = session
            .command_error(SessionError::Command("x".into()), "Error", answers)
            .await
            .unwrap();
        let second = session
            .command_error(SessionError::Command("y".into()), "Error", answers)
            .await
            .unwrap();
        assert_eq!(first, QueryAnswers::SKIP);
        assert_eq!(second, QueryAnswers::SKIP);
        assert_eq!(ui.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_exception_on_fail_raises_command_error() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.set_exception_on_fail(true);
        let err = session
            .command_error(SessionError::Command("x".into()), "Error", QueryAnswers::RETRY)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Command(_)));
        assert!(ui.queries().is_empty());
        session.set_exception_on_fail(false);
        assert!(!session.exception_on_fail());
    }

    #[tokio::test]
    async fn test_file_operation_loop_abort_cancels_progress() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        ui.push_answers(&[QueryAnswers::RETRY, QueryAnswers::ABORT]);
        let mut session = memory_session(&fs, ui.clone());
        session.progress = Some(OperationProgress::start(
            FileOperation::Copy,
            OperationSide::Local,
            1,
            false,
        ));
        let mut attempts = 0;
        let result: Result<(), SessionError> = session
            .file_operation_loop("Cannot create local directory", true, None, |_| {
                attempts += 1;
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"))
            })
            .await;
        assert!(matches!(result, Err(SessionError::Skip(_))));
        assert_eq!(attempts, 2);
        assert_eq!(session.progress().unwrap().cancel, CancelStatus::Cancel);
    }
}
