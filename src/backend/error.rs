//! Backend error types

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Protocol not supported: {0}")]
    UnsupportedProtocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BackendError {
    /// Errors that leave the connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BackendError::ConnectionLost(_)
                | BackendError::ConnectionFailed(_)
                | BackendError::AuthenticationFailed(_)
                | BackendError::ProtocolError(_)
                | BackendError::NotConnected
        )
    }
}

impl From<SshError> for BackendError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::AuthenticationFailed(msg) => BackendError::AuthenticationFailed(msg),
            e @ (SshError::PromptCancelled(_) | SshError::KeyUnreadable { .. }) => {
                BackendError::AuthenticationFailed(e.to_string())
            }
            e @ (SshError::Resolve { .. }
            | SshError::ConnectTimeout { .. }
            | SshError::HostKeyRejected { .. }) => BackendError::ConnectionFailed(e.to_string()),
            SshError::Disconnected => BackendError::ConnectionLost("Disconnected".to_string()),
            SshError::Io(e) => BackendError::IoError(e),
            e @ (SshError::Refused { .. } | SshError::Protocol(_)) => {
                BackendError::ProtocolError(e.to_string())
            }
        }
    }
}

impl From<russh_sftp::client::error::Error> for BackendError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        map_sftp_error(err.to_string())
    }
}

/// Classify an SFTP status message
pub(crate) fn map_sftp_error(msg: String) -> BackendError {
    if msg.contains("No such file") || msg.contains("not found") {
        BackendError::FileNotFound(msg)
    } else if msg.contains("Permission denied") {
        BackendError::PermissionDenied(msg)
    } else if msg.contains("exists") {
        BackendError::AlreadyExists(msg)
    } else if msg.contains("closed") || msg.contains("Timeout") {
        BackendError::ConnectionLost(msg)
    } else {
        BackendError::OperationFailed(msg)
    }
}

impl serde::Serialize for BackendError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
