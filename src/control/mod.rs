//! Control-plane messages
//!
//! Browsers talk to the daemon over a WebSocket with JSON messages tagged by
//! `type`. Commands flow in as [`ControlCommand`], state changes flow out as
//! [`ControlEvent`]. Events are broadcast to every connection unless they are
//! addressed to one (`lost_control`, `hello`, `snapshot`).

pub mod server;

use crate::catalog::{InputDescriptor, UnifiedOutput};
use crate::gate::ConnectionId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events kept for slow connections before they start missing some
const EVENT_BUFFER: usize = 256;

/// Command sent by a browser
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    SwitchInput { id: String },
    SyncOutputs { ids: Vec<String> },
    /// Any JSON number or numeric string; clamped to 0-100
    SetVolume { value: serde_json::Value },
    TakeoverControl,
}

/// State change sent to browsers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Hello {
        connection_id: ConnectionId,
    },
    Snapshot {
        inputs: Vec<InputDescriptor>,
        outputs: Vec<UnifiedOutput>,
        current_input: String,
        active_outputs: Vec<String>,
        volume: u8,
        is_owner: bool,
    },
    InputListChanged {
        inputs: Vec<InputDescriptor>,
    },
    OutputListChanged {
        outputs: Vec<UnifiedOutput>,
    },
    InputChanged {
        id: String,
    },
    OutputsChanged {
        ids: Vec<String>,
    },
    VolumeChanged {
        value: u8,
    },
    StatusNotice {
        message: String,
    },
    ErrorNotice {
        message: String,
    },
    OwnerChanged {
        owner: Option<ConnectionId>,
    },
    LostControl,
}

/// An event and who it is for
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// `None` means every connection
    pub to: Option<ConnectionId>,
    pub event: ControlEvent,
}

impl Envelope {
    pub fn is_for(&self, conn: ConnectionId) -> bool {
        self.to.map_or(true, |to| to == conn)
    }
}

/// Everything the control server passes to the daemon
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    Command(ConnectionId, ControlCommand),
}

/// Fan-out of control events to connections
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Envelope>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Send to every connection
    pub fn publish(&self, event: ControlEvent) {
        tracing::trace!("Publishing {:?}", event);
        // No receivers just means nobody is connected
        let _ = self.tx.send(Envelope { to: None, event });
    }

    /// Send to one connection
    pub fn send_to(&self, conn: ConnectionId, event: ControlEvent) {
        let _ = self.tx.send(Envelope {
            to: Some(conn),
            event,
        });
    }

    pub fn status(&self, message: impl Into<String>) {
        self.publish(ControlEvent::StatusNotice {
            message: message.into(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(ControlEvent::ErrorNotice {
            message: message.into(),
        });
    }
}

/// Read a volume from any JSON value a browser might send
pub fn coerce_volume(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        _ => None,
    }
}
