//! Session error types
//!
//! Errors are classified the way the retry loops consume them:
//! - `Skip`: this file is skipped, the batch continues
//! - `Command`: non-fatal, reported through the retry/skip/abort query
//! - `Fatal`: the connection is gone and the session has been closed
//! - `Abort`/`GuardAbort`: the user cancelled, unwinds without reporting

use thiserror::Error;

use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Skipped: {0}")]
    Skip(String),

    #[error("{0}")]
    Command(String),

    #[error("{message}")]
    Fatal {
        message: String,
        /// The user has already been asked whether to reconnect
        reopen_queried: bool,
    },

    #[error("Operation aborted")]
    Abort,

    /// The session was closed because the operation asked for it on completion
    #[error("Session closed on completion")]
    ClosedOnCompletion,

    /// Silent unwind out of a guarded callback, the real error is kept by the guard
    #[error("Aborted by fatal error in callback")]
    GuardAbort,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SessionError {
    pub fn fatal(message: impl Into<String>) -> Self {
        SessionError::Fatal {
            message: message.into(),
            reopen_queried: false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Fatal { .. } => true,
            SessionError::Backend(e) => e.is_fatal(),
            _ => false,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, SessionError::Abort | SessionError::GuardAbort)
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, SessionError::Skip(_))
    }

    pub fn reopen_queried(&self) -> bool {
        matches!(
            self,
            SessionError::Fatal {
                reopen_queried: true,
                ..
            }
        )
    }

    /// Convert into `Fatal`, keeping the message
    pub fn into_fatal(self) -> Self {
        match self {
            fatal @ SessionError::Fatal { .. } => fatal,
            other => SessionError::fatal(other.to_string()),
        }
    }

    pub fn mark_reopen_queried(&mut self) {
        if let SessionError::Fatal { reopen_queried, .. } = self {
            *reopen_queried = true;
        }
    }
}

impl serde::Serialize for SessionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SessionError::fatal("gone").is_fatal());
        assert!(SessionError::Backend(BackendError::NotConnected).is_fatal());
        assert!(!SessionError::Backend(BackendError::FileNotFound("/a".into())).is_fatal());
        assert!(SessionError::GuardAbort.is_abort());
        assert!(!SessionError::GuardAbort.is_fatal());
        assert!(SessionError::Skip("x".into()).is_skip());
    }

    #[test]
    fn test_reopen_queried_flag() {
        let mut err = SessionError::Command("boom".into()).into_fatal();
        assert!(err.is_fatal());
        assert!(!err.reopen_queried());
        err.mark_reopen_queried();
        assert!(err.reopen_queried());
        assert_eq!(serde_json::to_string(&err).unwrap(), "\"boom\"");
    }
}
