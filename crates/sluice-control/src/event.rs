//! Control plane events
//!
//! Status text, backend output lines and user notices flow from the
//! controllers to any number of observers over a broadcast channel. Nothing
//! in the control plane waits on observers; events published while nobody
//! listens are dropped.

use crate::port::PortConflict;
use crate::state::ControllerState;
use std::fmt;
use tokio::sync::broadcast;

/// Default event channel capacity
const DEFAULT_CAPACITY: usize = 256;

/// Which pipe a backend line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of backend output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Controller name of the emitting process
    pub source: String,
    /// Originating pipe
    pub stream: OutputStream,
    /// Line content without the trailing newline
    pub line: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source, self.line)
    }
}

/// Messages meant for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// No route to the connectivity probe
    NoConnectivity,
    /// Server hostname lookup failed
    ResolutionFailed { host: String },
    /// A fixed local port is taken by another process
    PortInUse { name: String, port: u16 },
    /// A fixed local port lies in an OS excluded range
    PortReserved { name: String, port: u16 },
    /// An executable or runtime component is missing
    MissingRuntime { detail: String },
    /// Anything else
    StartFailed { detail: String },
}

impl From<&PortConflict> for Notice {
    fn from(conflict: &PortConflict) -> Self {
        match conflict {
            PortConflict::InUse { name, port } => Notice::PortInUse {
                name: name.clone(),
                port: *port,
            },
            PortConflict::Reserved { name, port } => Notice::PortReserved {
                name: name.clone(),
                port: *port,
            },
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::NoConnectivity => write!(f, "No internet connection"),
            Notice::ResolutionFailed { host } => {
                write!(f, "Lookup of server hostname {host} failed")
            }
            Notice::PortInUse { name, port } => write!(f, "The {name} ({port}) port is in use."),
            Notice::PortReserved { name, port } => {
                write!(f, "The {name} ({port}) port is reserved by system.")
            }
            Notice::MissingRuntime { detail } => {
                write!(f, "{detail}\n\nMissing File or runtime components")
            }
            Notice::StartFailed { detail } => write!(f, "Start failed: {detail}"),
        }
    }
}

/// Event published by the control plane
#[derive(Debug, Clone)]
pub enum ControlEvent {
    /// Progress text ("Starting Redirector", ...)
    Status(String),
    /// A controller changed state
    StateChanged {
        controller: String,
        state: ControllerState,
    },
    /// Backend output
    Log(LogLine),
    /// Something the user must see
    Notice(Notice),
}

/// Broadcast bus for [`ControlEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControlEvent>,
}

impl EventBus {
    /// Create a bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }

    /// Publish an event
    pub fn publish(&self, event: ControlEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn status(&self, text: impl Into<String>) {
        self.publish(ControlEvent::Status(text.into()));
    }

    pub fn notice(&self, notice: Notice) {
        self.publish(ControlEvent::Notice(notice));
    }

    pub fn state_changed(&self, controller: &str, state: ControllerState) {
        self.publish(ControlEvent::StateChanged {
            controller: controller.to_string(),
            state,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
