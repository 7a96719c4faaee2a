//! Tunnel Event System
//!
//! Lifecycle notifications for the control tunnel, fanned out over a
//! broadcast channel. Emitting with no subscribers is not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    /// A new forwarder is ready
    #[serde(rename_all = "camelCase")]
    Started {
        session_id: String,
        local_port: u16,
        remote_port: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// An existing listener from a previous run was adopted
    #[serde(rename_all = "camelCase")]
    Reused { port: u16, command: String },
    /// The tracked forwarder was stopped on request
    #[serde(rename_all = "camelCase")]
    Stopped {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        local_port: Option<u16>,
    },
    /// The tracked forwarder died on its own and was dropped
    #[serde(rename_all = "camelCase")]
    Exited { session_id: String },
    /// `ensure()` failed
    Failed { error: String },
}

#[derive(Clone)]
pub struct TunnelEventEmitter {
    tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelEventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: TunnelEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("No tunnel event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}

impl Default for TunnelEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TunnelEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEventEmitter")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
