//! Configuration Module
//!
//! Connection settings, tunnel timing and the resolvers the tunnel manager
//! consults on every call.

pub mod resolver;
pub mod settings;
pub mod types;

pub use resolver::{
    ConnectionSettingsResolver, EnvGateway, FixedGateway, GatewayEnvironment, StaticSettings,
    GATEWAY_PORT_ENV,
};
pub use settings::{default_settings_path, load_settings, SettingsError};
pub use types::{
    ConnectionMode, ConnectionSettings, SettingsFile, TunnelOptions, CONFIG_VERSION,
    DEFAULT_GATEWAY_PORT,
};
