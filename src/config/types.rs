//! Settings types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current settings file format version
pub const CONFIG_VERSION: u32 = 1;

/// Gateway port used when nothing else is configured
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Where the gateway lives relative to this host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Gateway runs on this machine, no tunnel needed
    #[default]
    Local,
    /// Gateway runs on a remote host reached through SSH
    Remote,
}

/// Connection settings consumed once per `ensure()` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Local or remote gateway
    #[serde(default)]
    pub mode: ConnectionMode,

    /// SSH target in `user@host[:port]` form
    #[serde(default)]
    pub target: String,

    /// Optional identity file passed as `-i`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Extra `-o` options appended after the built-in ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_options: Vec<String>,
}

impl ConnectionSettings {
    /// Remote-mode settings for the given SSH target
    pub fn remote(target: impl Into<String>) -> Self {
        Self {
            mode: ConnectionMode::Remote,
            target: target.into(),
            identity: None,
            ssh_options: Vec::new(),
        }
    }

    /// Set identity file
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn is_remote(&self) -> bool {
        self.mode == ConnectionMode::Remote
    }
}

/// Timing knobs for the forwarding process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOptions {
    /// Upper bound for the forwarder to start listening
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Delay between readiness probes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time between SIGTERM and SIGKILL on stop
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl TunnelOptions {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// On-disk settings file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsFile {
    /// Format version
    pub version: u32,

    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Overrides `GATEWAY_PORT` when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_port: Option<u16>,

    #[serde(default)]
    pub tunnel: TunnelOptions,
}

impl Default for SettingsFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            connection: ConnectionSettings::default(),
            gateway_port: None,
            tunnel: TunnelOptions::default(),
        }
    }
}
