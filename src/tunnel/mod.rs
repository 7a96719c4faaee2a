//! Control Tunnel Module
//!
//! Establishes, reuses and tears down the SSH local forward that exposes a
//! remote gateway's control port on loopback.

mod error;
mod events;
mod launcher;
pub mod manager;
pub mod session;

pub use error::TunnelError;
pub use events::{TunnelEvent, TunnelEventEmitter};
pub use launcher::{ForwarderLauncher, SshForwarder, SshTarget};
pub use manager::{TunnelManager, TunnelStatus};
pub use session::{ForwardingSession, LaunchContext, SessionState};
