//! Shared identifier and digest types for the pathcheck simulator.
//!
//! These are leaf types with no knowledge of events or services. Everything
//! above this crate names nodes, ports and handlers through them.

mod hash;
mod identifiers;

pub use hash::StateHash;
pub use identifiers::{HandlerId, MessageId, NodeIndex, Port, TimerId};
