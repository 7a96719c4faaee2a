//! Forwarding Session
//!
//! One externally spawned forwarding process bound to a local port.
//!
//! State machine:
//! ```text
//! Created → Starting → Ready(port) → Terminated
//!              └──────→ Failed
//! ```
//! Every exit from `Starting` other than `Ready` runs the same shutdown
//! routine as `terminate()`, and the child is spawned with kill-on-drop, so a
//! failed start never leaves a process behind.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

use super::error::TunnelError;
use super::launcher::ForwarderLauncher;
use crate::config::{ConnectionSettings, TunnelOptions};
use crate::probe::{find_free_port, PortProbe};

/// Upper bound for a single readiness connect attempt
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle state of a forwarding session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SessionState {
    Created,
    Starting,
    #[serde(rename_all = "camelCase")]
    Ready { local_port: u16 },
    Terminated,
    Failed,
}

/// Everything a session needs to launch its forwarder
pub struct LaunchContext<'a> {
    pub settings: &'a ConnectionSettings,
    pub launcher: &'a dyn ForwarderLauncher,
    pub probe: &'a dyn PortProbe,
    pub options: &'a TunnelOptions,
}

pub struct ForwardingSession {
    id: String,
    remote_port: u16,
    preferred_local_port: u16,
    state: SessionState,
    child: Option<Child>,
    stop_grace: Duration,
    /// Last line the forwarder wrote to stderr
    last_stderr: Arc<Mutex<Option<String>>>,
}

impl ForwardingSession {
    /// A session that has not spawned anything yet
    pub fn new(remote_port: u16, preferred_local_port: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_port,
            preferred_local_port,
            state: SessionState::Created,
            child: None,
            stop_grace: TunnelOptions::default().stop_grace(),
            last_stderr: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn a forwarder mapping `preferred_local_port → remote_port` and wait for it to listen.
    ///
    /// `preferred_local_port == 0` picks an ephemeral port. A non-zero port
    /// that is already taken fails with `PortUnavailable` without spawning.
    pub async fn start(
        remote_port: u16,
        preferred_local_port: u16,
        ctx: &LaunchContext<'_>,
    ) -> Result<Self, TunnelError> {
        let mut session = Self::new(remote_port, preferred_local_port);
        session.stop_grace = ctx.options.stop_grace();

        match session.launch(ctx).await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.abort().await;
                Err(e)
            }
        }
    }

    async fn launch(&mut self, ctx: &LaunchContext<'_>) -> Result<(), TunnelError> {
        self.state = SessionState::Starting;

        let local_port = if self.preferred_local_port == 0 {
            find_free_port()?
        } else {
            if !ctx.probe.port_is_free(self.preferred_local_port) {
                let owner = ctx
                    .probe
                    .describe(self.preferred_local_port)
                    .await
                    .map(|desc| desc.command);
                return Err(TunnelError::PortUnavailable {
                    port: self.preferred_local_port,
                    owner,
                });
            }
            self.preferred_local_port
        };

        let mut command = ctx.launcher.command(ctx.settings, local_port, self.remote_port)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| TunnelError::ProcessSpawnFailed(e.to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let id = self.id.clone();
            let last = self.last_stderr.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("Forwarder {} stderr: {}", id, line);
                    *last.lock() = Some(line);
                }
            });
        }

        info!(
            "Spawned forwarder {} (pid {:?}): 127.0.0.1:{} -> remote:{}",
            self.id,
            child.id(),
            local_port,
            self.remote_port
        );
        self.child = Some(child);

        self.wait_until_ready(local_port, ctx.options).await?;

        self.state = SessionState::Ready { local_port };
        info!("Forwarder {} ready on port {}", self.id, local_port);
        Ok(())
    }

    /// Poll until the local port accepts connections, the process exits, or the deadline passes
    async fn wait_until_ready(
        &mut self,
        local_port: u16,
        options: &TunnelOptions,
    ) -> Result<(), TunnelError> {
        let max_wait = options.ready_timeout();
        let deadline = Instant::now() + max_wait;

        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    // let the stderr reader catch up with the final message
                    sleep(Duration::from_millis(50)).await;
                    let detail = self
                        .last_stderr
                        .lock()
                        .clone()
                        .map(|line| format!(": {}", line))
                        .unwrap_or_default();
                    return Err(TunnelError::ProcessSpawnFailed(format!(
                        "forwarder exited early with {}{}",
                        status, detail
                    )));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Forwarder {} not listening on {} after {:?}",
                    self.id, local_port, max_wait
                );
                return Err(TunnelError::ReadinessTimeout {
                    port: local_port,
                    timeout: max_wait,
                });
            }

            let attempt = CONNECT_ATTEMPT_TIMEOUT.min(deadline - now);
            if let Ok(Ok(_stream)) =
                timeout(attempt, TcpStream::connect((Ipv4Addr::LOCALHOST, local_port))).await
            {
                return Ok(());
            }

            sleep(options.poll_interval().min(deadline.saturating_duration_since(Instant::now())))
                .await;
        }
    }

    /// Failure path out of `Starting`
    async fn abort(&mut self) {
        if let Some(mut child) = self.child.take() {
            shutdown_child(&self.id, &mut child, self.stop_grace).await;
        }
        self.state = SessionState::Failed;
    }

    /// Stop the forwarder and release its port. No-op when nothing is running.
    pub async fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            if matches!(self.state, SessionState::Ready { .. }) {
                self.state = SessionState::Terminated;
            }
            return;
        };

        shutdown_child(&self.id, &mut child, self.stop_grace).await;
        self.state = SessionState::Terminated;
        info!("Forwarder {} terminated", self.id);
    }

    /// True iff the owned process has not exited
    ///
    /// A process found dead moves the session to `Terminated`.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!("Forwarder {} exited on its own: {}", self.id, status);
                self.child = None;
                if matches!(self.state, SessionState::Ready { .. }) {
                    self.state = SessionState::Terminated;
                }
                false
            }
            Err(e) => {
                warn!("Failed to poll forwarder {}: {}", self.id, e);
                false
            }
        }
    }

    /// Bound port, only once the forwarder is ready
    pub fn assigned_local_port(&self) -> Option<u16> {
        match self.state {
            SessionState::Ready { local_port } => Some(local_port),
            _ => None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.id())
    }
}

impl std::fmt::Debug for ForwardingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingSession")
            .field("id", &self.id)
            .field("remote_port", &self.remote_port)
            .field("preferred_local_port", &self.preferred_local_port)
            .field("state", &self.state)
            .field("pid", &self.pid())
            .finish()
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the child.
async fn shutdown_child(id: &str, child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("Forwarder {} exited after SIGTERM: {}", id, status);
                    return;
                }
                Ok(Err(e)) => warn!("Failed waiting for forwarder {}: {}", id, e),
                Err(_) => warn!(
                    "Forwarder {} ignored SIGTERM for {:?}, killing",
                    id, grace
                ),
            },
            Err(e) => debug!("SIGTERM to forwarder {} failed: {}", id, e),
        }
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to kill forwarder {}: {}", id, e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::probe::{PortDescriptor, SystemPortProbe};
    use async_trait::async_trait;
    use std::net::TcpListener;
    use std::path::PathBuf;
    use tokio::process::Command;

    /// Runs an arbitrary shell script instead of ssh
    struct ScriptLauncher {
        script: String,
    }

    impl ForwarderLauncher for ScriptLauncher {
        fn signature(&self) -> &str {
            "ssh"
        }

        fn command(
            &self,
            _settings: &ConnectionSettings,
            _local_port: u16,
            _remote_port: u16,
        ) -> Result<Command, TunnelError> {
            let mut command = Command::new("sh");
            command.args(["-c", &self.script]);
            Ok(command)
        }
    }

    /// Reports every port as taken by `node`
    struct BusyProbe;

    #[async_trait]
    impl PortProbe for BusyProbe {
        fn port_is_free(&self, _port: u16) -> bool {
            false
        }

        async fn describe(&self, port: u16) -> Option<PortDescriptor> {
            Some(PortDescriptor {
                port,
                pid: None,
                command: "node".into(),
            })
        }
    }

    fn fast_options() -> TunnelOptions {
        TunnelOptions {
            ready_timeout_ms: 300,
            poll_interval_ms: 20,
            stop_grace_ms: 500,
        }
    }

    fn pid_alive(pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    fn read_pid(path: &PathBuf) -> i32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    async fn wait_for_pid(path: &PathBuf) -> i32 {
        for _ in 0..100 {
            let written = std::fs::read_to_string(path).unwrap_or_default();
            if let Ok(pid) = written.trim().parse() {
                return pid;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    #[tokio::test]
    async fn test_terminate_never_started_is_noop() {
        let mut session = ForwardingSession::new(18789, 18789);
        session.terminate().await;
        session.terminate().await;
        assert_eq!(session.state(), SessionState::Created);
        assert!(!session.is_running());
        assert_eq!(session.assigned_local_port(), None);
    }

    #[tokio::test]
    async fn test_readiness_timeout_kills_process() {
        let temp = tempfile::tempdir().unwrap();
        let pid_file = temp.path().join("pid");
        let launcher = ScriptLauncher {
            script: format!("echo $$ > {}; exec sleep 30", pid_file.display()),
        };
        let settings = ConnectionSettings::remote("gateway.example");
        let options = fast_options();
        let ctx = LaunchContext {
            settings: &settings,
            launcher: &launcher,
            probe: &SystemPortProbe,
            options: &options,
        };

        let err = ForwardingSession::start(18789, 0, &ctx).await.unwrap_err();
        assert!(matches!(err, TunnelError::ReadinessTimeout { .. }), "{err}");

        let pid = read_pid(&pid_file);
        assert!(!pid_alive(pid), "forwarder {pid} survived a failed start");
    }

    #[tokio::test]
    async fn test_early_exit_reports_stderr() {
        let launcher = ScriptLauncher {
            script: "echo 'bind: Address already in use' >&2; exit 255".into(),
        };
        let settings = ConnectionSettings::remote("gateway.example");
        let options = TunnelOptions {
            ready_timeout_ms: 5_000,
            ..fast_options()
        };
        let ctx = LaunchContext {
            settings: &settings,
            launcher: &launcher,
            probe: &SystemPortProbe,
            options: &options,
        };

        match ForwardingSession::start(18789, 0, &ctx).await {
            Err(TunnelError::ProcessSpawnFailed(msg)) => {
                assert!(msg.contains("exited early"), "{msg}");
            }
            other => panic!("expected ProcessSpawnFailed, got {:?}", other.map(|s| s.state())),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_fails_spawn() {
        let launcher = crate::tunnel::SshForwarder::new("/nonexistent/forwarder-binary");
        let settings = ConnectionSettings::remote("gateway.example");
        let options = fast_options();
        let ctx = LaunchContext {
            settings: &settings,
            launcher: &launcher,
            probe: &SystemPortProbe,
            options: &options,
        };

        let err = ForwardingSession::start(18789, 0, &ctx).await.unwrap_err();
        assert!(matches!(err, TunnelError::ProcessSpawnFailed(_)), "{err}");
    }

    #[tokio::test]
    async fn test_taken_port_fails_without_spawning() {
        let temp = tempfile::tempdir().unwrap();
        let marker = temp.path().join("spawned");
        let launcher = ScriptLauncher {
            script: format!("touch {}; exec sleep 30", marker.display()),
        };
        let settings = ConnectionSettings::remote("gateway.example");
        let options = fast_options();
        let ctx = LaunchContext {
            settings: &settings,
            launcher: &launcher,
            probe: &BusyProbe,
            options: &options,
        };

        let err = ForwardingSession::start(18789, 18789, &ctx).await.unwrap_err();
        match err {
            TunnelError::PortUnavailable { port, owner } => {
                assert_eq!(port, 18789);
                assert_eq!(owner.as_deref(), Some("node"));
            }
            other => panic!("expected PortUnavailable, got {other}"),
        }
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_ready_then_terminate() {
        // The test holds the listener so the readiness probe connects to it
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        struct AlwaysFree;

        #[async_trait]
        impl PortProbe for AlwaysFree {
            fn port_is_free(&self, _port: u16) -> bool {
                true
            }

            async fn describe(&self, _port: u16) -> Option<PortDescriptor> {
                None
            }
        }

        let temp = tempfile::tempdir().unwrap();
        let pid_file = temp.path().join("pid");
        let launcher = ScriptLauncher {
            script: format!("echo $$ > {}; exec sleep 30", pid_file.display()),
        };
        let settings = ConnectionSettings::remote("gateway.example");
        let options = fast_options();
        let ctx = LaunchContext {
            settings: &settings,
            launcher: &launcher,
            probe: &AlwaysFree,
            options: &options,
        };

        let mut session = ForwardingSession::start(18789, port, &ctx).await.unwrap();
        assert_eq!(session.assigned_local_port(), Some(port));
        assert!(session.is_running());

        // readiness comes from the test's listener, so the script may still be starting
        let pid = wait_for_pid(&pid_file).await;
        assert_eq!(session.pid(), Some(pid as u32));

        session.terminate().await;
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(!session.is_running());
        assert_eq!(session.assigned_local_port(), None);

        assert!(!pid_alive(pid), "forwarder {pid} survived terminate");

        session.terminate().await;
        assert_eq!(session.state(), SessionState::Terminated);
        drop(listener);
    }
}
