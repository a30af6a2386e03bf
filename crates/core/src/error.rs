//! Errors raised by services under test.

use pathcheck_types::{NodeIndex, Port};
use std::fmt;

/// Result type of every [`NodeService`](crate::NodeService) upcall.
pub type ServiceResult = Result<(), ServiceError>;

/// Errors a service (or the API it calls) can raise during a simulated step.
///
/// Any error that escapes an upcall aborts the whole run: it indicates a bug
/// in the code under test or a misconfigured test, never a simulated fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// No transport is bound on this node at the given port.
    #[error("no transport bound on port {0}")]
    UnknownPort(Port),

    /// A peer index outside the cluster.
    #[error("node {0} is not part of the simulation")]
    InvalidNode(NodeIndex),

    /// The service read the clock in model-checking mode with clock reads disabled.
    #[error("clock reads are disabled in model-checking mode")]
    ClockDisallowed,

    /// The engine aborted the step; the cause is reported by the engine.
    #[error("simulation aborted: {0}")]
    Aborted(String),

    /// A protocol-level failure reported by the service itself.
    #[error("{0}")]
    Protocol(String),
}

impl ServiceError {
    /// Convenience constructor for service-specific failures.
    pub fn protocol(msg: impl Into<String>) -> Self {
        ServiceError::Protocol(msg.into())
    }
}

/// Kind of error surfaced to a service by a stream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The destination was not listening when a message arrived.
    ConnectError,
    /// The connection was torn down after messages were exchanged.
    ReadError,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::ConnectError => write!(f, "CONNECT_ERROR"),
            TransportErrorKind::ReadError => write!(f, "READ_ERROR"),
        }
    }
}
