//! Domain-specific identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a simulated node.
///
/// Nodes are numbered densely from zero for the lifetime of a run. There is
/// no address or key type: every component addresses peers by index.
pub type NodeIndex = u32;

/// Transport port number.
pub type Port = u16;

/// Per-run unique identifier of a simulated message.
pub type MessageId = u32;

/// Registration identifier of a receive or connection handler.
///
/// Handlers are registered with a transport by the service that owns them and
/// carried on every routed message so the receiving side can find the
/// matching upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(pub i32);

impl HandlerId {
    /// Handler id carried by transport-generated pseudo-messages.
    pub const NONE: Self = HandlerId(-1);
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.0)
    }
}

/// Identifier of a scheduled timer, chosen by the service that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timer({})", self.0)
    }
}
