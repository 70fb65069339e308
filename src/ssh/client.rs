//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use crate::session::{Prompt, PromptKind, QueryAnswers, QueryParams, SessionCallbacks};

/// `SHA256:` fingerprint of a host key, as printed by OpenSSH
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// An authenticated connection
pub struct SshConnection {
    pub controller: HandleController,
    pub host_key_fingerprint: Option<String>,
    /// Password that authenticated the connection, if any
    pub password: Option<String>,
}

/// Connects and authenticates one SSH connection
pub struct SshClient {
    config: SshConfig,
    callbacks: Arc<dyn SessionCallbacks>,
}

impl SshClient {
    pub fn new(config: SshConfig, callbacks: Arc<dyn SessionCallbacks>) -> Self {
        Self { config, callbacks }
    }

    pub async fn connect(self) -> Result<SshConnection, SshError> {
        let addr = self.config.address();
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::Resolve {
                address: addr.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| SshError::Resolve {
                address: addr.clone(),
                reason: "no address found".to_string(),
            })?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let seen_fingerprint = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: self.config.host.clone(),
            port: self.config.port,
            expected: self.config.host_key.clone(),
            callbacks: self.callbacks.clone(),
            seen_fingerprint: seen_fingerprint.clone(),
        };

        let mut handle = tokio::time::timeout(
            self.config.connect_timeout(),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::ConnectTimeout {
            address: addr.clone(),
            seconds: self.config.timeout_secs,
        })??;

        debug!("SSH handshake completed");

        let mut password_used = None;
        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => {
                let password = if self.config.prompts_for_password() {
                    self.prompt_secret(PromptKind::Password, "Password")?
                } else {
                    password.clone()
                };
                let result = handle
                    .authenticate_password(&self.config.username, &password)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
                password_used = Some(password);
                result
            }
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let path = expand_tilde(Path::new(key_path));
                let unreadable = |e: russh::keys::Error| SshError::KeyUnreadable {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                };
                let key = match russh::keys::load_secret_key(&path, passphrase.as_deref()) {
                    Ok(key) => key,
                    Err(e) if passphrase.is_none() => {
                        debug!("Key {} needs a passphrase: {}", path.display(), e);
                        let pass = self.prompt_secret(PromptKind::Passphrase, "Passphrase")?;
                        russh::keys::load_secret_key(&path, Some(pass.as_str())).map_err(unreadable)?
                    }
                    Err(e) => return Err(unreadable(e)),
                };
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", addr);

        let host_key_fingerprint = seen_fingerprint.lock().clone();
        Ok(SshConnection {
            controller: spawn_handle_owner_task(handle, addr),
            host_key_fingerprint,
            password: password_used,
        })
    }

    fn prompt_secret(&self, kind: PromptKind, label: &'static str) -> Result<String, SshError> {
        let prompts = [Prompt {
            text: format!("{}: ", label),
            echo: false,
        }];
        let name = format!("{}@{}", self.config.username, self.config.host);
        let answers = self
            .callbacks
            .prompt_user(kind, &name, "", &prompts)
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
        answers
            .and_then(|mut a| (!a.is_empty()).then(|| a.swap_remove(0)))
            .ok_or(SshError::PromptCancelled(label))
    }
}

/// Expand `~` to the home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

/// Client handler for russh callbacks
///
/// Verifies the host key against the configured fingerprint, or asks the user
/// when none is configured.
pub struct ClientHandler {
    host: String,
    port: u16,
    expected: Option<String>,
    callbacks: Arc<dyn SessionCallbacks>,
    seen_fingerprint: Arc<Mutex<Option<String>>>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);
        *self.seen_fingerprint.lock() = Some(actual.clone());

        match &self.expected {
            Some(expected) if *expected == actual => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Some(expected) => {
                warn!(
                    "Host key mismatch for {}:{}: expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Err(SshError::HostKeyRejected {
                    host: format!("{}:{}", self.host, self.port),
                    reason: format!("expected {}, got {}", expected, actual),
                })
            }
            None => {
                let query = format!(
                    "The server's host key was not found in the configuration. \
                     Fingerprint: {}. Continue connecting to {}:{}?",
                    actual, self.host, self.port
                );
                let answer = self
                    .callbacks
                    .query_user(&query, &[], QueryAnswers::YES | QueryAnswers::NO, &QueryParams::default())
                    .map_err(|e| SshError::HostKeyRejected {
                        host: format!("{}:{}", self.host, self.port),
                        reason: e.to_string(),
                    })?;
                if answer == QueryAnswers::YES {
                    info!("Host key for {}:{} accepted by user", self.host, self.port);
                    Ok(true)
                } else {
                    Err(SshError::HostKeyRejected {
                        host: format!("{}:{}", self.host, self.port),
                        reason: format!("{} not accepted", actual),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::NullCallbacks;

    #[test]
    fn test_dismissed_prompt_cancels() {
        let config = SshConfig {
            host: "example.com".to_string(),
            port: 22,
            username: "alice".to_string(),
            auth: AuthMethod::password(""),
            timeout_secs: 15,
            host_key: None,
        };
        let client = SshClient::new(config, Arc::new(NullCallbacks));
        let err = client
            .prompt_secret(PromptKind::Passphrase, "Passphrase")
            .unwrap_err();
        assert!(matches!(err, SshError::PromptCancelled("Passphrase")));
    }

    #[test]
    fn test_expand_tilde() {
        let plain = expand_tilde(Path::new("/etc/key"));
        assert_eq!(plain, PathBuf::from("/etc/key"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/.ssh/id")), home.join(".ssh/id"));
        }
    }
}
