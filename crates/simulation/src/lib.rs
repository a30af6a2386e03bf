//! Deterministic simulator and explicit-state model checker.
//!
//! A whole cluster runs inside one process. Sockets and timers are replaced
//! by simulated services that only queue events; the runner executes those
//! events one at a time, so every interleaving is the product of recorded
//! choices and can be replayed exactly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  SimulationRunner                       │
//! │   paths, properties, duplicate states, statistics       │
//! │                                                         │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │  PendingEventStore (sort key → Event)              │ │
//! │  │  EventSelector: weighted draw | minimum timestamp  │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │ pop                         │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │  Lifecycle: init / reset / upcall dispatch         │ │
//! │  │  SimNetwork: stream and datagram transports        │ │
//! │  │  TimerService                                      │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │ NodeApi                     │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │  NodeService per node → queue new events           │ │
//! │  └────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! In model-checking mode sort keys are weights and the next event is a
//! recorded choice. In timed mode sort keys are simulated microseconds and
//! the earliest event fires next.

mod clock;
mod config;
mod context;
mod error;
mod event_queue;
mod latency;
mod lifecycle;
mod link;
mod monitor;
mod network;
mod properties;
mod random;
mod registry;
mod runner;
mod selector;
mod state_hash;
mod stats;
mod timer;
mod transport;

pub use clock::{NodeClock, TimeStats, SIM_START_TIME};
pub use config::{ChoiceStrategy, SimulationMode, SimulationParams};
pub use context::{Env, NodeContext, SimulationContext};
pub use error::SimulationError;
pub use event_queue::{EventKey, PendingEventStore};
pub use latency::{
    LatencyDistributions, LatencyModel, LinkParams, DEFAULT_BITRATE, DEFAULT_LINK_LATENCY,
    DEFAULT_PROCESSING_TIME,
};
pub use lifecycle::{Lifecycle, NodeHandler, NodeStatus};
pub use link::{check_link_pair, is_consistent_pair, LinkInput, LinkSide, LinkState};
pub use monitor::DivergenceMonitor;
pub use network::SimNetwork;
pub use properties::{
    LivenessProperty, SafetyProperty, SingleDeliveryProperty, SocketStateProperty, SystemView,
};
pub use random::{parse_choices, read_choice_file, Choice, ChoicePath, MAX_RAND_INT};
pub use registry::{CheckedService, FnService, LoadedTest, TestRegistry};
pub use runner::{PathReport, RunSummary, SimulationRunner};
pub use selector::{selector_for, EventSelector, MinimumKeySelector, WeightedRandomSelector};
pub use state_hash::{combined_state_hash, Visit, VisitedStateSet};
pub use stats::{PathCounters, PathEndCause, PathStatistics};
pub use timer::TimerService;
pub use transport::{
    MessageKind, SimTransport, SimulatedMessage, TransportKind, TransportSignal, Upcall,
};
