//! Forwarder Launcher
//!
//! Builds the external forwarding command. The default launcher runs
//! `ssh -N -L 127.0.0.1:<local>:127.0.0.1:<remote> user@host`.

use std::path::PathBuf;

use tokio::process::Command;

use super::error::TunnelError;
use crate::config::ConnectionSettings;

/// Builds the forwarding process for a session
pub trait ForwarderLauncher: Send + Sync {
    /// Substring identifying this forwarder in a process table command name
    fn signature(&self) -> &str;

    /// Command forwarding `local_port` on loopback to `remote_port` on the remote host
    fn command(
        &self,
        settings: &ConnectionSettings,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Command, TunnelError>;
}

/// Parsed `user@host[:port]` target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl SshTarget {
    /// Parse `host`, `user@host`, `user@host:port` or `user@[v6addr]:port`
    pub fn parse(raw: &str) -> Result<Self, TunnelError> {
        let raw = raw.trim();
        let invalid = || TunnelError::InvalidTarget(raw.to_string());

        if raw.is_empty() || raw.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let (user, rest) = match raw.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(invalid()),
            None => (None, raw),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match after {
                "" => None,
                _ => {
                    let raw_port = after.strip_prefix(':').ok_or_else(invalid)?;
                    Some(parse_port(raw_port).ok_or_else(invalid)?)
                }
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                // more than one ':' without brackets is a bare IPv6 address
                Some((host, port)) if !host.contains(':') => {
                    (host, Some(parse_port(port).ok_or_else(invalid)?))
                }
                _ => (rest, None),
            }
        };

        // a leading '-' would be read by ssh as an option
        let dashed = |s: &str| s.starts_with('-');
        if host.is_empty() || dashed(host) || user.as_deref().is_some_and(dashed) {
            return Err(invalid());
        }

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }

    /// `user@host` destination argument for ssh
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    raw.parse::<u16>().ok().filter(|p| *p > 0)
}

/// Launches OpenSSH as the forwarding process
#[derive(Debug, Clone)]
pub struct SshForwarder {
    program: PathBuf,
}

impl SshForwarder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments for a local forward; the process stays in the foreground with no remote command
    pub fn args(
        settings: &ConnectionSettings,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Vec<String>, TunnelError> {
        let target = SshTarget::parse(&settings.target)?;

        let mut args: Vec<String> = [
            "BatchMode=yes",
            "ExitOnForwardFailure=yes",
            "StrictHostKeyChecking=accept-new",
            "UpdateHostKeys=yes",
            "ServerAliveInterval=15",
            "ServerAliveCountMax=3",
            "TCPKeepAlive=yes",
        ]
        .iter()
        .flat_map(|opt| ["-o".to_string(), opt.to_string()])
        .collect();

        for opt in &settings.ssh_options {
            args.push("-o".into());
            args.push(opt.clone());
        }

        args.push("-N".into());
        args.push("-L".into());
        args.push(format!("127.0.0.1:{}:127.0.0.1:{}", local_port, remote_port));

        if let Some(port) = target.port {
            args.push("-p".into());
            args.push(port.to_string());
        }

        if let Some(identity) = settings.identity.as_deref().filter(|i| !i.trim().is_empty()) {
            args.push("-i".into());
            args.push(identity.to_string());
        }

        args.push(target.destination());
        Ok(args)
    }
}

impl Default for SshForwarder {
    fn default() -> Self {
        Self::new("ssh")
    }
}

impl ForwarderLauncher for SshForwarder {
    fn signature(&self) -> &str {
        "ssh"
    }

    fn command(
        &self,
        settings: &ConnectionSettings,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Command, TunnelError> {
        let mut command = Command::new(&self.program);
        command.args(Self::args(settings, local_port, remote_port)?);
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets() {
        assert_eq!(
            SshTarget::parse("ops@gateway.example:2222").unwrap(),
            SshTarget {
                user: Some("ops".into()),
                host: "gateway.example".into(),
                port: Some(2222),
            }
        );
        assert_eq!(
            SshTarget::parse("gateway.example").unwrap(),
            SshTarget {
                user: None,
                host: "gateway.example".into(),
                port: None,
            }
        );

        let v6 = SshTarget::parse("ops@[fd00::1]:22").unwrap();
        assert_eq!(v6.host, "fd00::1");
        assert_eq!(v6.port, Some(22));

        let bare_v6 = SshTarget::parse("fd00::1").unwrap();
        assert_eq!(bare_v6.host, "fd00::1");
        assert_eq!(bare_v6.port, None);
    }

    #[test]
    fn test_parse_rejects_bad_targets() {
        for raw in ["", "   ", "@host", "ops@", "-oProxyCommand=x", "ops@host:0", "ops@host:abc", "a b"] {
            assert!(
                matches!(SshTarget::parse(raw), Err(TunnelError::InvalidTarget(_))),
                "expected {:?} to be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_ssh_args() {
        let settings = ConnectionSettings::remote("ops@gateway.example:2222")
            .with_identity("/home/ops/.ssh/id_ed25519");
        let args = SshForwarder::args(&settings, 18789, 18789).unwrap();

        let l = args.iter().position(|a| a == "-L").unwrap();
        assert_eq!(args[l + 1], "127.0.0.1:18789:127.0.0.1:18789");
        assert!(args.contains(&"-N".to_string()));
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert!(args.contains(&"BatchMode=yes".to_string()));

        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "2222");
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/home/ops/.ssh/id_ed25519");

        assert_eq!(args.last().unwrap(), "ops@gateway.example");
    }

    #[test]
    fn test_ssh_args_extra_options_and_no_port() {
        let mut settings = ConnectionSettings::remote("gateway.example");
        settings.ssh_options.push("ConnectTimeout=5".into());
        let args = SshForwarder::args(&settings, 40000, 18789).unwrap();

        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert!(args.contains(&"127.0.0.1:40000:127.0.0.1:18789".to_string()));
        assert!(!args.contains(&"-p".to_string()));
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn test_command_uses_program() {
        let settings = ConnectionSettings::remote("gateway.example");
        let command = SshForwarder::new("/usr/local/bin/ssh")
            .command(&settings, 1, 2)
            .unwrap();
        assert_eq!(command.as_std().get_program(), "/usr/local/bin/ssh");
    }
}
