//! Tunnel Error types

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Remote mode is not enabled")]
    ModeDisabled,

    #[error("Local port {port} is unavailable{}", held_by(.owner))]
    PortUnavailable { port: u16, owner: Option<String> },

    #[error("Failed to start forwarding process: {0}")]
    ProcessSpawnFailed(String),

    #[error("Forwarding process did not listen on port {port} within {timeout:?}")]
    ReadinessTimeout { port: u16, timeout: Duration },

    #[error("Invalid SSH target: {0}")]
    InvalidTarget(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn held_by(owner: &Option<String>) -> String {
    owner
        .as_ref()
        .map(|command| format!(" (held by {})", command))
        .unwrap_or_default()
}

// Host applications forward errors as plain strings
impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_unavailable_message() {
        let err = TunnelError::PortUnavailable {
            port: 18789,
            owner: Some("node".into()),
        };
        assert_eq!(err.to_string(), "Local port 18789 is unavailable (held by node)");

        let err = TunnelError::PortUnavailable {
            port: 18789,
            owner: None,
        };
        assert_eq!(err.to_string(), "Local port 18789 is unavailable");
    }

    #[test]
    fn test_serializes_as_string() {
        let json = serde_json::to_string(&TunnelError::ModeDisabled).unwrap();
        assert_eq!(json, r#""Remote mode is not enabled""#);
    }
}
