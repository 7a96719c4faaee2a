//! Port Probing
//!
//! Answers two questions about a local TCP port:
//! - can a fresh socket bind it on loopback right now (`port_is_free`)
//! - which process, if any, is listening on it (`describe`)
//!
//! `describe` only feeds the tunnel reuse decision. It reads `/proc` on Linux
//! and shells out to `lsof` on other unix systems; pid → command name goes
//! through `sysinfo`.

#[cfg(all(unix, not(target_os = "linux")))]
mod lsof;
#[cfg(target_os = "linux")]
mod procfs;

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, TcpListener};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An existing listener not owned by this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDescriptor {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Command name of the owning process (e.g. "ssh")
    pub command: String,
}

impl PortDescriptor {
    /// Case-insensitive substring match of `signature` against the command name.
    ///
    /// This is a heuristic: an unrelated binary whose name contains the
    /// signature matches too, and a forwarder started under another name does not.
    pub fn matches_signature(&self, signature: &str) -> bool {
        !signature.is_empty()
            && self
                .command
                .to_lowercase()
                .contains(&signature.to_lowercase())
    }
}

/// OS port inspection used by the tunnel manager
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// True iff a new socket can bind `port` on loopback right now
    fn port_is_free(&self, port: u16) -> bool;

    /// The process currently listening on `port`, if it can be identified
    async fn describe(&self, port: u16) -> Option<PortDescriptor>;
}

/// Probe backed by the real OS tables
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPortProbe;

#[async_trait]
impl PortProbe for SystemPortProbe {
    fn port_is_free(&self, port: u16) -> bool {
        port_is_free(port)
    }

    async fn describe(&self, port: u16) -> Option<PortDescriptor> {
        describe_listener(port).await
    }
}

/// Bind-test `port` on IPv4 and IPv6 loopback, releasing the sockets immediately.
///
/// A host without IPv6 loopback only needs the IPv4 bind to succeed.
pub fn port_is_free(port: u16) -> bool {
    if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_err() {
        return false;
    }

    match TcpListener::bind((Ipv6Addr::LOCALHOST, port)) {
        Ok(_) => true,
        Err(e) => e.kind() != io::ErrorKind::AddrInUse,
    }
}

/// Find an available loopback port by binding to :0, reading the assigned port, then releasing.
///
/// The port may be taken between release and the forwarder's own bind; the
/// readiness wait catches that case.
pub fn find_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(target_os = "linux")]
async fn describe_listener(port: u16) -> Option<PortDescriptor> {
    tokio::task::spawn_blocking(move || {
        let pid = procfs::find_listener_pid(port)?;
        let command = process_name(pid)?;
        Some(PortDescriptor {
            port,
            pid: Some(pid),
            command,
        })
    })
    .await
    .ok()
    .flatten()
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn describe_listener(port: u16) -> Option<PortDescriptor> {
    let owner = lsof::find_listener(port).await?;
    let command = match owner.command {
        Some(command) => command,
        None => {
            let pid = owner.pid;
            tokio::task::spawn_blocking(move || process_name(pid))
                .await
                .ok()
                .flatten()?
        }
    };

    Some(PortDescriptor {
        port,
        pid: Some(owner.pid),
        command,
    })
}

#[cfg(not(unix))]
async fn describe_listener(port: u16) -> Option<PortDescriptor> {
    tracing::debug!("Listener lookup not supported on this platform (port {})", port);
    None
}

#[cfg(unix)]
fn process_name(pid: u32) -> Option<String> {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map(|process| process.name().to_string_lossy().into_owned())
}
