//! Configuration Module
//!
//! Engine-wide settings, per-session connection data and transfer parameters.
//! The engine configuration is passed explicitly to every session; there is no
//! process-wide configuration object.

pub mod copy_param;
pub mod session_data;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use copy_param::{CopyParams, FileMask, FileNameCase};
pub use session_data::{LookupMode, Protocol, SessionData, TunnelSettings};

/// Engine-wide behaviour settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Auto-answer "Reconnect" after this many milliseconds (0 = wait for the user)
    pub session_reopen_auto_ms: u64,
    /// Maximum number of automatic reconnect attempts per fatal error
    pub session_reopen_auto_max_retries: u32,
    /// Give up reconnecting after this many milliseconds (0 = no limit)
    pub session_reopen_timeout_ms: u64,
    /// Refresh the listing after every modifying operation
    pub auto_read_directory_after_op: bool,
    /// Ask before overwriting existing files
    pub confirm_overwriting: bool,
    /// Maximum number of remembered directory changes
    pub cache_directory_changes_max_size: usize,
    /// Local port range scanned for the tunnel listener
    pub tunnel_local_port_low: u16,
    pub tunnel_local_port_high: u16,
    /// Keepalive interval of the tunnel connection in seconds
    pub tunnel_keepalive_secs: u64,
    /// Delay between a local change and the synchronization it triggers
    pub monitor_change_delay_ms: u64,
    /// Warn when watching more directories than this (0 = no limit)
    pub monitor_max_directories: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_reopen_auto_ms: 5000,
            session_reopen_auto_max_retries: 5,
            session_reopen_timeout_ms: 0,
            auto_read_directory_after_op: true,
            confirm_overwriting: true,
            cache_directory_changes_max_size: 100,
            tunnel_local_port_low: 50000,
            tunnel_local_port_high: 50099,
            tunnel_keepalive_secs: 30,
            monitor_change_delay_ms: 500,
            monitor_max_directories: 500,
        }
    }
}

impl EngineConfig {
    /// Load from a JSON document, missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Configure reconnect behaviour
    pub fn with_reopen_policy(mut self, auto_ms: u64, max_retries: u32, timeout_ms: u64) -> Self {
        self.session_reopen_auto_ms = auto_ms;
        self.session_reopen_auto_max_retries = max_retries;
        self.session_reopen_timeout_ms = timeout_ms;
        self
    }

    pub fn with_tunnel_port_range(mut self, low: u16, high: u16) -> Self {
        self.tunnel_local_port_low = low;
        self.tunnel_local_port_high = high;
        self
    }

    pub fn session_reopen_auto(&self) -> Duration {
        Duration::from_millis(self.session_reopen_auto_ms)
    }

    pub fn session_reopen_timeout(&self) -> Option<Duration> {
        (self.session_reopen_timeout_ms > 0)
            .then(|| Duration::from_millis(self.session_reopen_timeout_ms))
    }

    pub fn monitor_change_delay(&self) -> Duration {
        Duration::from_millis(self.monitor_change_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{"session_reopen_auto_max_retries": 2}"#)
            .unwrap();
        assert_eq!(config.session_reopen_auto_max_retries, 2);
        assert!(config.confirm_overwriting);
        assert_eq!(config.tunnel_local_port_low, 50000);
        assert_eq!(config.session_reopen_timeout(), None);
    }

    #[test]
    fn test_session_data_defaults() {
        let data: SessionData =
            serde_json::from_str(r#"{"host_name":"example.com","user_name":"alice"}"#).unwrap();
        assert_eq!(data.port_number, 22);
        assert_eq!(data.protocol, Protocol::Sftp);
        assert_eq!(data.session_name(), "alice@example.com");
        assert!(data.password().is_none());
        assert!(!data.tunnel.enabled);
    }
}
