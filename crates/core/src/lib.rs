//! Core types for the pathcheck simulator.
//!
//! This crate defines the vocabulary shared by the engine and the services it
//! drives:
//!
//! - [`Event`]: one discrete step of a simulated cluster
//! - [`NodeService`]: the protocol code under test, one instance per node
//! - [`NodeApi`]: the simulated network, timers and randomness a service sees
//!
//! A service never owns a socket or a thread. Every side effect goes through
//! the `NodeApi` handed to each upcall, which is what lets the engine replay
//! an interleaving exactly.

mod error;
mod event;
mod traits;

pub use error::{ServiceError, ServiceResult, TransportErrorKind};
pub use event::{AppEventKind, Event, EventCategory, EventKind, NetEvent, NetEventKind};
pub use traits::{NodeApi, NodeService};

pub use pathcheck_types::{HandlerId, MessageId, NodeIndex, Port, StateHash, TimerId};
