//! Events driven through the simulated cluster.

use pathcheck_types::{NodeIndex, Port, TimerId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse category of an event, used for dispatch and liveness scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventCategory {
    Application,
    Network,
    Timer,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCategory::Application => write!(f, "APPLICATION"),
            EventCategory::Network => write!(f, "NETWORK"),
            EventCategory::Timer => write!(f, "TIMER"),
        }
    }
}

/// Application-level lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AppEventKind {
    /// Start the node (or restart it after a crash).
    Init,
    /// Crash the node and reincarnate it.
    Reset,
}

/// Sub-type of a network event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NetEventKind {
    /// The head of a peer's queue toward this node can be consumed.
    Message,
    /// A message this node sent found its destination not listening.
    DestNotReady,
    /// A queued request-to-send can be granted.
    ClearToSend,
    /// All queued data of this node's transport has drained.
    Flushed,
}

/// Payload of a network event.
///
/// `peer` is the other end of the exchange: the sender for `Message`, the
/// unready destination for `DestNotReady`, the destination with room for
/// `ClearToSend`, and the owning node itself for `Flushed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetEvent {
    pub kind: NetEventKind,
    pub peer: NodeIndex,
    pub port: Port,
}

/// What an event does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Application(AppEventKind),
    Network(NetEvent),
    Timer(TimerId),
}

/// One pending step of the simulation, owned by the node that executes it.
///
/// Events are immutable once queued and consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub node: NodeIndex,
    pub kind: EventKind,
    pub description: String,
}

impl Event {
    /// Create an event.
    pub fn new(node: NodeIndex, kind: EventKind, description: impl Into<String>) -> Self {
        Self {
            node,
            kind,
            description: description.into(),
        }
    }

    /// Start-up event for a node.
    pub fn init(node: NodeIndex) -> Self {
        Self::new(node, EventKind::Application(AppEventKind::Init), "APP_EVENT")
    }

    /// Crash event for a node.
    pub fn reset(node: NodeIndex) -> Self {
        Self::new(node, EventKind::Application(AppEventKind::Reset), "NODE_FAILURE")
    }

    /// Network event on `node` concerning `peer`.
    pub fn network(
        node: NodeIndex,
        kind: NetEventKind,
        peer: NodeIndex,
        port: Port,
        description: impl Into<String>,
    ) -> Self {
        Self::new(
            node,
            EventKind::Network(NetEvent { kind, peer, port }),
            description,
        )
    }

    /// Timer-fire event.
    pub fn timer(node: NodeIndex, timer: TimerId, description: impl Into<String>) -> Self {
        Self::new(node, EventKind::Timer(timer), description)
    }

    /// Category of this event.
    pub fn category(&self) -> EventCategory {
        match self.kind {
            EventKind::Application(_) => EventCategory::Application,
            EventKind::Network(_) => EventCategory::Network,
            EventKind::Timer(_) => EventCategory::Timer,
        }
    }

    /// Flat integer encoding; `fields()[0]` discriminates the sub-type.
    pub fn fields(&self) -> Vec<i64> {
        match self.kind {
            EventKind::Application(kind) => vec![kind as i64],
            EventKind::Network(net) => vec![net.kind as i64, net.peer as i64, net.port as i64],
            EventKind::Timer(id) => vec![id.0 as i64],
        }
    }

    /// Name used to look up per-event processing-time distributions.
    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::Application(AppEventKind::Init) => "APPLICATION::INIT",
            EventKind::Application(AppEventKind::Reset) => "APPLICATION::RESET",
            EventKind::Network(NetEvent { kind, .. }) => match kind {
                NetEventKind::Message => "NETWORK::MESSAGE",
                NetEventKind::DestNotReady => "NETWORK::DEST_NOT_READY",
                NetEventKind::ClearToSend => "NETWORK::CTS",
                NetEventKind::Flushed => "NETWORK::FLUSHED",
            },
            EventKind::Timer(_) => "TIMER",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event(node={}, {}, fields={:?}, {})",
            self.node,
            self.category(),
            self.fields(),
            self.description
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_fields_discriminate_subtype() {
        let ev = Event::network(2, NetEventKind::ClearToSend, 1, 5377, "(CTS,dest node,port)");
        assert_eq!(ev.category(), EventCategory::Network);
        assert_eq!(ev.fields(), vec![2, 1, 5377]);
        assert_eq!(ev.name(), "NETWORK::CTS");

        let init = Event::init(0);
        assert_eq!(init.category(), EventCategory::Application);
        assert_eq!(init.fields(), vec![0]);
        assert_eq!(Event::reset(0).fields(), vec![1]);
    }

    #[test]
    fn test_timer_event() {
        let ev = Event::timer(3, TimerId(9), "heartbeat");
        assert_eq!(ev.category(), EventCategory::Timer);
        assert_eq!(ev.fields(), vec![9]);
        assert!(ev.to_string().contains("TIMER"));
    }
}
