//! Failures of the SSH transport

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Cannot resolve {address}: {reason}")]
    Resolve { address: String, reason: String },

    #[error("Connecting to {address} timed out after {seconds}s")]
    ConnectTimeout { address: String, seconds: u64 },

    #[error("Host key of {host} rejected: {reason}")]
    HostKeyRejected { host: String, reason: String },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The user dismissed a password or passphrase prompt
    #[error("{0} prompt cancelled")]
    PromptCancelled(&'static str),

    #[error("Cannot load private key '{path}': {reason}")]
    KeyUnreadable { path: String, reason: String },

    /// Channel, subsystem or exec request turned down by the server
    #[error("Server refused {request}: {reason}")]
    Refused { request: String, reason: String },

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    pub fn refused(request: impl Into<String>, reason: impl ToString) -> Self {
        SshError::Refused {
            request: request.into(),
            reason: reason.to_string(),
        }
    }

    /// Failure of a channel request; a dropped connection stays `Disconnected`
    pub(crate) fn channel(request: &str, error: russh::Error) -> Self {
        match error {
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::refused(request, other),
        }
    }
}

impl serde::Serialize for SshError {
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
    fn test_messages_name_the_target() {
        let err = SshError::ConnectTimeout {
            address: "example.com:22".to_string(),
            seconds: 15,
        };
        assert_eq!(err.to_string(), "Connecting to example.com:22 timed out after 15s");
        assert_eq!(
            SshError::refused("sftp subsystem", "denied").to_string(),
            "Server refused sftp subsystem: denied"
        );
        assert_eq!(
            serde_json::to_string(&SshError::PromptCancelled("Passphrase")).unwrap(),
            "\"Passphrase prompt cancelled\""
        );
    }

    #[test]
    fn test_channel_disconnect_is_not_a_refusal() {
        assert!(matches!(
            SshError::channel("session channel", russh::Error::Disconnect),
            SshError::Disconnected
        ));
    }
}
