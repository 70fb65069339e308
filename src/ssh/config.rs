//! SSH connection target configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Everything needed to establish one SSH connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Expected host key fingerprint (`SHA256:...`).
    /// When absent the user is asked to accept the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key: Option<String>,
}

impl SshConfig {
    /// `host:port` as handed to the resolver
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Does the password have to be asked for
    pub fn prompts_for_password(&self) -> bool {
        matches!(&self.auth, AuthMethod::Password { password } if password.is_empty())
    }
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication. An empty password is prompted for.
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        AuthMethod::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        AuthMethod::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }
}

impl Default for AuthMethod {
    fn default() -> Self {
        AuthMethod::password("")
    }
}

pub(crate) fn default_port() -> u16 {
    22
}

pub(crate) fn default_timeout() -> u64 {
    15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_json() {
        let config: SshConfig = serde_json::from_str(
            r#"{"host":"example.com","username":"alice","auth":{"type":"password","password":""}}"#,
        )
        .unwrap();
        assert_eq!(config.address(), "example.com:22");
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert!(config.host_key.is_none());
        assert!(config.prompts_for_password());

        let keyed = SshConfig {
            auth: AuthMethod::key("~/.ssh/id_ed25519", None),
            ..config
        };
        assert!(!keyed.prompts_for_password());
    }
}
