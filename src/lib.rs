//! Gateway Tunnel - keeps an SSH control tunnel to a remote gateway
//!
//! The [`tunnel::TunnelManager`] hands out a loopback port that reaches the
//! remote gateway, spawning `ssh -N -L` only when no usable forwarder is
//! already running.

pub mod config;
pub mod probe;
pub mod tunnel;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConnectionMode, ConnectionSettings, TunnelOptions};
pub use probe::{PortDescriptor, PortProbe, SystemPortProbe};
pub use tunnel::{TunnelError, TunnelManager, TunnelStatus};

/// Initialize logging
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies.
pub fn init_logging(default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
