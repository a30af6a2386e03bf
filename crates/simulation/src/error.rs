//! Errors raised by the simulation engine.

use pathcheck_core::ServiceError;
use pathcheck_types::{NodeIndex, Port};
use std::path::PathBuf;

/// Errors that abort a simulation run.
///
/// Expected path terminations (duplicate state, out of events, step ceiling)
/// are not errors; they are reported through
/// [`PathEndCause`](crate::PathEndCause).
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// A node index outside the cluster.
    #[error("node {0} is not part of the simulation")]
    InvalidNode(NodeIndex),

    /// No transport is bound at this (node, port).
    #[error("no transport bound on node {node} port {port}")]
    UnknownTransport {
        /// Node the lookup was made for.
        node: NodeIndex,
        /// Port that was looked up.
        port: Port,
    },

    /// A second transport was bound at an occupied (node, port).
    #[error("transport already bound on node {node} port {port}")]
    DuplicateTransport {
        /// Node of the conflicting binding.
        node: NodeIndex,
        /// Port of the conflicting binding.
        port: Port,
    },

    /// No checked service is registered under this name.
    #[error("no test registered as {0:?}")]
    UnknownTest(String),

    /// A choice file could not be parsed.
    #[error("{path}:{line}: {reason}")]
    ChoiceFile {
        /// File being read.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },

    /// A replayed choice was made against a different number of options than
    /// when it was recorded.
    #[error(
        "unexpected/uncontrolled non-determinism at choice {position}: recorded out of {expected}, asked out of {actual}"
    )]
    Nondeterminism {
        /// Index of the choice on the path.
        position: usize,
        /// Number of options when the path was recorded.
        expected: u64,
        /// Number of options now.
        actual: u64,
    },

    /// The link-parameter file is malformed.
    #[error("invalid link parameters: {0}")]
    LinkParams(String),

    /// The latency-distribution file is malformed.
    #[error("invalid latency distribution: {0}")]
    Distribution(String),

    /// Parameter combination that cannot run.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The test queued events while its services were being constructed.
    #[error("{0} events were queued before the simulation started")]
    EventsQueuedBeforeStart(usize),

    /// An internal consistency check failed.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// A service returned an error from an upcall.
    #[error("service on node {node} failed: {source}")]
    ServiceFault {
        /// Node whose service failed.
        node: NodeIndex,
        /// The service's error.
        #[source]
        source: ServiceError,
    },

    /// The run was halted after writing an error path.
    #[error("halted on {kind}: {description} (choices in {path:?})")]
    Halted {
        /// Error type tag, e.g. `PROPERTY_FAILED`.
        kind: String,
        /// Human readable description.
        description: String,
        /// Error path file that reproduces the failure.
        path: Option<PathBuf>,
    },

    /// Filesystem error while reading inputs or writing path files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
