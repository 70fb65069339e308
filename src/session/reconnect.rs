//! Reconnect policy
//!
//! After a fatal error the user is asked whether to reconnect, with an optional
//! automatic answer after `session_reopen_auto_ms` and a cap on the number of
//! attempts per error chain.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{QueryAnswers, QueryParams, Session, SessionError};
use crate::config::Protocol;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReopenParams {
    /// Do not load the directory listing after reconnecting
    pub no_read_directory: bool,
}

/// Session state a reconnect must not change
struct ReopenSnapshot {
    remote_directory: String,
    protocol: Protocol,
    lock_directory: String,
    pending_read_current_directory: bool,
    pending_read_directory: bool,
    auto_read_directory: bool,
    exception_on_fail: u32,
    suspend_transaction: bool,
}

impl Session {
    fn reopen_snapshot(&self) -> ReopenSnapshot {
        ReopenSnapshot {
            remote_directory: self.data.remote_directory.clone(),
            protocol: self.data.protocol,
            lock_directory: self.lock_directory.clone(),
            pending_read_current_directory: self.pending_read_current_directory,
            pending_read_directory: self.pending_read_directory,
            auto_read_directory: self.auto_read_directory,
            exception_on_fail: self.exception_on_fail,
            suspend_transaction: self.suspend_transaction,
        }
    }

    fn restore_reopen_snapshot(&mut self, snapshot: ReopenSnapshot) {
        self.data.remote_directory = snapshot.remote_directory;
        self.data.protocol = snapshot.protocol;
        if !snapshot.lock_directory.is_empty() {
            self.lock_directory = snapshot.lock_directory;
        }
        self.pending_read_current_directory = snapshot.pending_read_current_directory;
        self.pending_read_directory = snapshot.pending_read_directory;
        self.auto_read_directory = snapshot.auto_read_directory;
        self.exception_on_fail = snapshot.exception_on_fail;
        self.suspend_transaction = snapshot.suspend_transaction;
    }

    /// Close and open again, landing in the same directory
    pub async fn reopen(&mut self, params: ReopenParams) -> Result<(), SessionError> {
        info!("Reopening session {}", self.session_name());
        let snapshot = self.reopen_snapshot();

        self.suspend_transaction = true;
        if params.no_read_directory {
            self.auto_read_directory = false;
        }
        let current = self.remote_current_directory();
        if !current.is_empty() {
            self.data.remote_directory = current;
        }
        // a protocol that worked once is not negotiated again
        if self.data.protocol == Protocol::Sftp {
            let active = self.file_system_info().protocol_base_name;
            self.data.protocol = if active.eq_ignore_ascii_case("scp") {
                Protocol::ScpOnly
            } else {
                Protocol::SftpOnly
            };
        }

        let result = async {
            if self.is_active() {
                self.close().await?;
            }
            self.open().await
        }
        .await;
        self.restore_reopen_snapshot(snapshot);
        result
    }

    /// Ask whether to reconnect after `error`; every error chain is asked once
    pub(crate) async fn do_query_reopen(&mut self, error: &mut SessionError) -> Result<bool, SessionError> {
        if error.reopen_queried() {
            return Ok(false);
        }

        let max_retries = self.config.session_reopen_auto_max_retries;
        let result = if self.reopen_retries >= max_retries {
            info!("Reached maximum number of reconnect attempts: {}", max_retries);
            Ok(false)
        } else {
            self.reopen_retries += 1;
            info!("Connection was lost, asking what to do");
            let mut params = QueryParams {
                allow_continue_on_error: true,
                ..Default::default()
            }
            .with_alias(QueryAnswers::RETRY, "Reconnect");
            if self.config.session_reopen_auto_ms > 0 {
                params = params.with_timeout(self.config.session_reopen_auto(), QueryAnswers::RETRY);
            }
            self.query_user(
                &error.to_string(),
                &[],
                QueryAnswers::RETRY | QueryAnswers::ABORT,
                &params,
            )
            .await
            .map(|answer| answer == QueryAnswers::RETRY)
        };
        error.mark_reopen_queried();
        result
    }

    /// Offer to reconnect after a fatal `error` and keep trying while the user
    /// agrees and the reopen timeout allows.
    ///
    /// Returns whether the session is connected again.
    pub async fn query_reopen(
        &mut self,
        error: &mut SessionError,
        params: ReopenParams,
    ) -> Result<bool, SessionError> {
        if let Some(progress) = self.progress.as_mut() {
            progress.suspend();
        }
        let result = self.reopen_while_allowed(error, params).await;
        if let Some(progress) = self.progress.as_mut() {
            progress.resume();
        }
        result
    }

    async fn reopen_while_allowed(
        &mut self,
        error: &mut SessionError,
        params: ReopenParams,
    ) -> Result<bool, SessionError> {
        if !self.do_query_reopen(error).await? {
            return Ok(false);
        }

        let start = Instant::now();
        loop {
            match self.reopen(params).await {
                Ok(()) if self.is_active() => return Ok(true),
                Ok(()) => {}
                Err(e) if self.is_active() => return Err(e),
                Err(mut e) => {
                    warn!("Reconnect failed: {}", e);
                    let expired = self
                        .config
                        .session_reopen_timeout()
                        .is_some_and(|timeout| start.elapsed() >= timeout);
                    if expired || !self.do_query_reopen(&mut e).await? {
                        return Ok(false);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{
        memory_session, memory_session_with, test_config, test_session_data, ScriptedCallbacks,
    };
    use super::*;
    use crate::backend::{FaultKind, MemoryFs};
    use crate::session::SessionStatus;

    #[tokio::test]
    async fn test_reopen_returns_to_current_directory() {
        let fs = MemoryFs::new().shared();
        fs.lock().add_directory("/home/user/docs");
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();
        session.change_directory("docs").await.unwrap();

        session.reopen(ReopenParams::default()).await.unwrap();

        assert!(session.is_active());
        assert_eq!(fs.lock().open_count, 2);
        assert_eq!(session.current_directory().await.unwrap(), "/home/user/docs");
        assert_eq!(session.session_data().protocol, Protocol::Sftp);
        assert!(session.session_data().remote_directory.is_empty());
    }

    #[tokio::test]
    async fn test_reopen_without_listing() {
        let fs = MemoryFs::new().shared();
        let mut session = memory_session(&fs, ScriptedCallbacks::new());
        session.open().await.unwrap();
        let listings = fs.lock().read_directory_count;

        let params = ReopenParams {
            no_read_directory: true,
        };
        session.reopen(params).await.unwrap();
        assert_eq!(fs.lock().read_directory_count, listings);
        assert!(session.auto_read_directory());
    }

    #[tokio::test]
    async fn test_query_reopen_after_connection_loss() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();
        fs.lock().inject_fault("idle", None, FaultKind::ConnectionLost, 1);

        let mut err = session.idle().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.status(), SessionStatus::Closed);

        ui.push_answers(&[QueryAnswers::RETRY]);
        assert!(session.query_reopen(&mut err, ReopenParams::default()).await.unwrap());
        assert!(session.is_active());
        assert!(err.reopen_queried());
        // the same error is never asked about twice
        assert!(!session.query_reopen(&mut err, ReopenParams::default()).await.unwrap());
        assert_eq!(ui.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_declined() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let mut session = memory_session(&fs, ui.clone());
        session.open().await.unwrap();
        session.close().await.unwrap();

        let mut err = SessionError::fatal("connection lost");
        assert!(!session.query_reopen(&mut err, ReopenParams::default()).await.unwrap());
        assert!(!session.is_active());
        assert_eq!(fs.lock().open_count, 1);
    }

    #[tokio::test]
    async fn test_retry_limit() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let config = test_config().with_reopen_policy(0, 1, 0);
        let mut session = memory_session_with(&fs, ui.clone(), test_session_data(), config);

        ui.push_answers(&[QueryAnswers::RETRY]);
        let mut first = SessionError::fatal("lost");
        assert!(session.do_query_reopen(&mut first).await.unwrap());
        let mut second = SessionError::fatal("lost again");
        assert!(!session.do_query_reopen(&mut second).await.unwrap());
        assert_eq!(ui.queries().len(), 1);
        assert!(second.reopen_queried());
    }

    #[tokio::test]
    async fn test_automatic_reconnect_answer() {
        let fs = MemoryFs::new().shared();
        let ui = ScriptedCallbacks::new();
        let config = test_config().with_reopen_policy(10, 3, 0);
        let mut session = memory_session_with(&fs, ui.clone(), test_session_data(), config);
        session.open().await.unwrap();
        session.close().await.unwrap();

        // no scripted answer: the timeout answer applies
        let mut err = SessionError::fatal("lost");
        assert!(session.query_reopen(&mut err, ReopenParams::default()).await.unwrap());
        assert!(session.is_active());
    }
}
