//! Settings resolvers
//!
//! The tunnel manager never reads configuration directly. It asks a
//! [`ConnectionSettingsResolver`] for the current mode and SSH target and a
//! [`GatewayEnvironment`] for the port to forward.

use parking_lot::RwLock;

use super::types::{ConnectionSettings, DEFAULT_GATEWAY_PORT};

/// Environment variable overriding the gateway port
pub const GATEWAY_PORT_ENV: &str = "GATEWAY_PORT";

/// Source of connection settings, read once per `ensure()`
pub trait ConnectionSettingsResolver: Send + Sync {
    fn connection_settings(&self) -> ConnectionSettings;
}

/// Source of the gateway port (remote target and preferred local port)
pub trait GatewayEnvironment: Send + Sync {
    fn gateway_port(&self) -> u16;
}

/// In-memory settings that the host application can swap at runtime
#[derive(Debug, Default)]
pub struct StaticSettings {
    inner: RwLock<ConnectionSettings>,
}

impl StaticSettings {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// Replace the settings; takes effect on the next `ensure()`
    pub fn set(&self, settings: ConnectionSettings) {
        *self.inner.write() = settings;
    }
}

impl ConnectionSettingsResolver for StaticSettings {
    fn connection_settings(&self) -> ConnectionSettings {
        self.inner.read().clone()
    }
}

/// Gateway port from `GATEWAY_PORT`, falling back to a configured default
#[derive(Debug, Clone, Copy)]
pub struct EnvGateway {
    fallback: u16,
}

impl EnvGateway {
    pub fn new(fallback: u16) -> Self {
        Self { fallback }
    }

    fn parse(raw: Option<&str>, fallback: u16) -> u16 {
        raw.and_then(|v| v.trim().parse::<u16>().ok())
            .filter(|p| *p > 0)
            .unwrap_or(fallback)
    }
}

impl Default for EnvGateway {
    fn default() -> Self {
        Self::new(DEFAULT_GATEWAY_PORT)
    }
}

impl GatewayEnvironment for EnvGateway {
    fn gateway_port(&self) -> u16 {
        let raw = std::env::var(GATEWAY_PORT_ENV).ok();
        Self::parse(raw.as_deref(), self.fallback)
    }
}

/// Fixed gateway port
#[derive(Debug, Clone, Copy)]
pub struct FixedGateway(pub u16);

impl GatewayEnvironment for FixedGateway {
    fn gateway_port(&self) -> u16 {
        self.0
    }
}
