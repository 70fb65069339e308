//! Per-connection session settings

use serde::{Deserialize, Serialize};

use crate::ssh::{AuthMethod, SshConfig};

/// File protocol spoken by the main connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// SFTP, falling back to SCP when the server has no SFTP subsystem
    Sftp,
    SftpOnly,
    /// SCP, falling back to SFTP
    Scp,
    ScpOnly,
    Ftp,
    WebDav,
}

impl Protocol {
    pub fn is_scp(&self) -> bool {
        matches!(self, Protocol::Scp | Protocol::ScpOnly)
    }

    pub fn is_sftp(&self) -> bool {
        matches!(self, Protocol::Sftp | Protocol::SftpOnly)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Sftp | Protocol::SftpOnly => "SFTP",
            Protocol::Scp | Protocol::ScpOnly => "SCP",
            Protocol::Ftp => "FTP",
            Protocol::WebDav => "WebDAV",
        }
    }
}

/// When to resolve remote user and group names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupMode {
    /// Look up when the protocol supports it; failures are ignored
    #[default]
    Auto,
    /// Always look up and report failures
    On,
    Off,
}

/// SSH tunnel used to reach the real host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    pub enabled: bool,
    pub host_name: String,
    pub port_number: u16,
    pub user_name: String,
    pub auth: AuthMethod,
    /// Expected tunnel host key fingerprint
    pub host_key: Option<String>,
    /// Local listening port, 0 picks a free one from the configured range
    pub local_port_number: u16,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host_name: String::new(),
            port_number: 22,
            user_name: String::new(),
            auth: AuthMethod::default(),
            host_key: None,
            local_port_number: 0,
        }
    }
}

/// Settings of one remote session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionData {
    /// Display name (auto-generated if empty)
    pub name: String,
    pub host_name: String,
    pub port_number: u16,
    pub user_name: String,
    pub auth: AuthMethod,
    /// Expected host key fingerprint (`SHA256:...`)
    pub host_key: Option<String>,
    pub protocol: Protocol,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
    /// Initial remote directory
    pub remote_directory: String,
    /// Keep listings of visited directories
    pub cache_directories: bool,
    /// Remember resolved `cd` targets
    pub cache_directory_changes: bool,
    /// Confine navigation to the initial directory
    pub lock_in_home: bool,
    pub lookup_user_groups: LookupMode,
    /// Move deleted files here instead of deleting them
    pub recycle_bin_path: String,
    pub delete_to_recycle_bin: bool,
    pub tunnel: TunnelSettings,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            name: String::new(),
            host_name: String::new(),
            port_number: 22,
            user_name: String::new(),
            auth: AuthMethod::default(),
            host_key: None,
            protocol: Protocol::Sftp,
            timeout_secs: crate::ssh::config::default_timeout(),
            remote_directory: String::new(),
            cache_directories: true,
            cache_directory_changes: true,
            lock_in_home: false,
            lookup_user_groups: LookupMode::Auto,
            recycle_bin_path: String::new(),
            delete_to_recycle_bin: false,
            tunnel: TunnelSettings::default(),
        }
    }
}

impl SessionData {
    /// Create session data with password authentication
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        user_name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host_name: host.into(),
            port_number: port,
            user_name: user_name.into(),
            auth: AuthMethod::password(password),
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_remote_directory(mut self, dir: impl Into<String>) -> Self {
        self.remote_directory = dir.into();
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelSettings) -> Self {
        self.tunnel = tunnel;
        self
    }

    /// Get display name (or generate from host and user)
    pub fn session_name(&self) -> String {
        if self.name.is_empty() {
            format!("{}@{}", self.user_name, self.host_name)
        } else {
            self.name.clone()
        }
    }

    pub fn password(&self) -> Option<&str> {
        match &self.auth {
            AuthMethod::Password { password } if !password.is_empty() => Some(password),
            _ => None,
        }
    }

    /// Connection target of the main session
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            host: self.host_name.clone(),
            port: self.port_number,
            username: self.user_name.clone(),
            auth: self.auth.clone(),
            timeout_secs: self.timeout_secs,
            host_key: self.host_key.clone(),
        }
    }

    /// Connection target of the tunnel host
    pub fn tunnel_ssh_config(&self) -> SshConfig {
        SshConfig {
            host: self.tunnel.host_name.clone(),
            port: self.tunnel.port_number,
            username: self.tunnel.user_name.clone(),
            auth: self.tunnel.auth.clone(),
            timeout_secs: self.timeout_secs,
            host_key: self.tunnel.host_key.clone(),
        }
    }
}
