//! Tunnel Manager
//!
//! Sole owner of the control tunnel. Holds at most one forwarding session
//! behind an async mutex, so racing callers never spawn twice: the second
//! caller waits on the lock and then finds the first caller's session.
//!
//! Reuse policy: when nothing is tracked but the desired port is already held
//! by a process whose command name contains the forwarder signature (a
//! leftover from a previous run), that port is handed out as-is. Such a
//! listener is never tracked and never terminated by this manager.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::error::TunnelError;
use super::events::{TunnelEvent, TunnelEventEmitter};
use super::launcher::{ForwarderLauncher, SshForwarder};
use super::session::{ForwardingSession, LaunchContext};
use crate::config::{ConnectionSettingsResolver, GatewayEnvironment, TunnelOptions};
use crate::probe::{PortDescriptor, PortProbe, SystemPortProbe};

/// Snapshot of who provides the control tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ownership", rename_all = "camelCase")]
pub enum TunnelStatus {
    /// No usable tunnel
    Down,
    /// Forwarder spawned and tracked by this manager
    #[serde(rename_all = "camelCase")]
    Owned {
        session_id: String,
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// Forwarder left over from a previous run
    #[serde(rename_all = "camelCase")]
    Adopted {
        port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        command: String,
    },
}

impl TunnelStatus {
    pub fn port(&self) -> Option<u16> {
        match self {
            TunnelStatus::Down => None,
            TunnelStatus::Owned { port, .. } | TunnelStatus::Adopted { port, .. } => Some(*port),
        }
    }
}

enum Running {
    Owned(u16),
    Adopted(PortDescriptor),
}

impl Running {
    fn port(&self) -> u16 {
        match self {
            Running::Owned(port) => *port,
            Running::Adopted(desc) => desc.port,
        }
    }
}

pub struct TunnelManager {
    settings: Arc<dyn ConnectionSettingsResolver>,
    gateway: Arc<dyn GatewayEnvironment>,
    probe: Arc<dyn PortProbe>,
    launcher: Arc<dyn ForwarderLauncher>,
    options: TunnelOptions,
    /// The tracked control session (at most one)
    control: Mutex<Option<ForwardingSession>>,
    /// Leftover listener last announced through `Reused`
    adopted: parking_lot::Mutex<Option<u16>>,
    events: TunnelEventEmitter,
}

impl TunnelManager {
    /// Manager using the OS probe and the `ssh` forwarder
    pub fn new(
        settings: Arc<dyn ConnectionSettingsResolver>,
        gateway: Arc<dyn GatewayEnvironment>,
    ) -> Self {
        Self {
            settings,
            gateway,
            probe: Arc::new(SystemPortProbe),
            launcher: Arc::new(SshForwarder::default()),
            options: TunnelOptions::default(),
            control: Mutex::new(None),
            adopted: parking_lot::Mutex::new(None),
            events: TunnelEventEmitter::new(),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ForwarderLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_options(mut self, options: TunnelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Port of a usable control tunnel, tracked or adopted, without spawning anything
    pub async fn port_if_running(&self) -> Option<u16> {
        let mut control = self.control.lock().await;
        self.running_locked(&mut control).await.map(|r| r.port())
    }

    /// Ensure a control tunnel exists and return its local port.
    ///
    /// Failures leave nothing tracked; calling again retries the whole decision.
    pub async fn ensure(&self) -> Result<u16, TunnelError> {
        let settings = self.settings.connection_settings();
        if !settings.is_remote() {
            return Err(TunnelError::ModeDisabled);
        }

        let mut control = self.control.lock().await;

        match self.running_locked(&mut control).await {
            Some(Running::Owned(port)) => return Ok(port),
            Some(Running::Adopted(desc)) => {
                let first = self.adopted.lock().replace(desc.port) != Some(desc.port);
                if first {
                    info!(
                        "Reusing existing {} listener on port {} (pid {:?})",
                        desc.command, desc.port, desc.pid
                    );
                    self.events.emit(TunnelEvent::Reused {
                        port: desc.port,
                        command: desc.command,
                    });
                } else {
                    debug!("Still reusing {} listener on port {}", desc.command, desc.port);
                }
                return Ok(desc.port);
            }
            None => {}
        }

        let desired = self.gateway.gateway_port();
        info!("Starting control tunnel for gateway port {}", desired);

        let ctx = LaunchContext {
            settings: &settings,
            launcher: self.launcher.as_ref(),
            probe: self.probe.as_ref(),
            options: &self.options,
        };

        let mut session = match ForwardingSession::start(desired, desired, &ctx).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Control tunnel failed to start: {}", e);
                self.events.emit(TunnelEvent::Failed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let Some(port) = session.assigned_local_port() else {
            session.terminate().await;
            return Err(TunnelError::ProcessSpawnFailed(
                "forwarder started without an assigned port".into(),
            ));
        };

        self.events.emit(TunnelEvent::Started {
            session_id: session.id().to_string(),
            local_port: port,
            remote_port: session.remote_port(),
            pid: session.pid(),
        });
        *control = Some(session);
        Ok(port)
    }

    /// Terminate the tracked forwarder, if any. Never fails.
    pub async fn stop_all(&self) {
        let mut control = self.control.lock().await;
        let Some(mut session) = control.take() else {
            debug!("stop_all: no tracked control tunnel");
            return;
        };

        let local_port = session.assigned_local_port();
        session.terminate().await;
        info!("Control tunnel {} stopped", session.id());
        self.events.emit(TunnelEvent::Stopped {
            session_id: session.id().to_string(),
            local_port,
        });
    }

    pub async fn status(&self) -> TunnelStatus {
        let mut control = self.control.lock().await;
        match self.running_locked(&mut control).await {
            Some(Running::Owned(port)) => match control.as_ref() {
                Some(session) => TunnelStatus::Owned {
                    session_id: session.id().to_string(),
                    port,
                    pid: session.pid(),
                },
                None => TunnelStatus::Down,
            },
            Some(Running::Adopted(desc)) => TunnelStatus::Adopted {
                port: desc.port,
                pid: desc.pid,
                command: desc.command,
            },
            None => TunnelStatus::Down,
        }
    }

    async fn running_locked(&self, control: &mut Option<ForwardingSession>) -> Option<Running> {
        let running = self.find_running(control).await;
        if !matches!(running, Some(Running::Adopted(_))) {
            // a leftover showing up again later is announced again
            *self.adopted.lock() = None;
        }
        running
    }

    async fn find_running(&self, control: &mut Option<ForwardingSession>) -> Option<Running> {
        if let Some(port) = self.tracked_port(control) {
            return Some(Running::Owned(port));
        }

        let desired = self.gateway.gateway_port();
        let desc = self.probe.describe(desired).await?;
        if desc.matches_signature(self.launcher.signature()) {
            Some(Running::Adopted(desc))
        } else {
            debug!(
                "Port {} is held by {}, not a forwarder; not reusing",
                desired, desc.command
            );
            None
        }
    }

    /// Assigned port of a live tracked session; a dead one is dropped
    fn tracked_port(&self, control: &mut Option<ForwardingSession>) -> Option<u16> {
        let session = control.as_mut()?;
        if session.is_running() {
            if let Some(port) = session.assigned_local_port() {
                return Some(port);
            }
        }

        if let Some(session) = control.take() {
            warn!("Control tunnel {} is no longer running", session.id());
            self.events.emit(TunnelEvent::Exited {
                session_id: session.id().to_string(),
            });
        }
        None
    }
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("options", &self.options)
            .field("events", &self.events)
            .finish()
    }
}
