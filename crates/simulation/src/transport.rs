//! Simulated transports.
//!
//! One [`SimTransport`] is bound per (node, port). It owns one outgoing queue
//! per destination and, for stream transports, the [`LinkState`] of this
//! node's side of every link.
//!
//! ```text
//!   route()                       MESSAGE event fires at dest
//!      │                                   │
//!      ▼                                   ▼
//!  ┌────────────────────┐   take_message() ┌────────────────────┐
//!  │ queue[dest]        │ ───────────────► │ dest transport     │
//!  │  [RE] D D D ...    │                  │  receive()         │
//!  │ state[dest]        │                  │  state[src]        │
//!  └────────────────────┘                  └────────────────────┘
//!          ▲   signals (SOURCE_RESET, BIDI_READ_ERROR, DEST_READY)   │
//!          └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Transports never touch each other directly. Anything that must happen on
//! the peer's side is returned as a [`PeerSignal`] and applied by the
//! network service; anything the node's service must hear is returned as an
//! [`Upcall`] and dispatched by the lifecycle manager once the network has
//! finished mutating.
//!
//! In model-checking mode at most one `MESSAGE` event per (source,
//! destination, port) is pending at any time; it is re-armed whenever the
//! queue head is consumed. In timed mode every queued data message owns an
//! event keyed by its arrival time.

use crate::context::Env;
use crate::link::{LinkInput, LinkSide, LinkState};
use crate::SimulationError;
use pathcheck_core::{Event, EventKind, NetEvent, NetEventKind, TransportErrorKind};
use pathcheck_types::{HandlerId, MessageId, NodeIndex, Port};
use std::collections::{BTreeSet, VecDeque};
use std::fmt::Write as _;
use tracing::{debug, error, info, warn};

/// Model-checking weight of a dest-not-ready notice.
pub const DEST_NOT_READY_WEIGHT: u64 = 2;

/// Model-checking weight of a flushed notification.
pub const FLUSH_WEIGHT: u64 = 40;

/// Queues above this many bytes count as a concurrent flow for bandwidth
/// sharing.
pub const FLOW_THRESHOLD_BYTES: usize = 300;

/// Delivery semantics of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Reliable, ordered, with connection errors.
    #[default]
    Stream,
    /// Unreliable, unordered, connectionless.
    Datagram,
}

/// What a queued message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Data,
    ReadError,
    DestNotReady,
}

/// A message sitting in a transport queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedMessage {
    pub source: NodeIndex,
    pub destination: NodeIndex,
    pub id: MessageId,
    pub send_time: u64,
    /// Key of the delivery event in timed mode; zero in model-checking mode.
    pub arrival_time: u64,
    pub kind: MessageKind,
    pub handler: HandlerId,
    pub payload: String,
}

impl SimulatedMessage {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Latency inputs for a timed-mode send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTiming {
    /// Transmission plus jitter for this message.
    pub latency: u64,
    /// Propagation delay of the link.
    pub fixed_latency: u64,
}

/// A notification addressed to the service on `node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upcall {
    Deliver {
        node: NodeIndex,
        port: Port,
        from: NodeIndex,
        handler: HandlerId,
        payload: String,
    },
    TransportError {
        node: NodeIndex,
        port: Port,
        peer: NodeIndex,
        kind: TransportErrorKind,
    },
    MessageError {
        node: NodeIndex,
        port: Port,
        peer: NodeIndex,
        kind: TransportErrorKind,
        handler: HandlerId,
        payload: String,
    },
    ClearToSend {
        node: NodeIndex,
        port: Port,
        peer: NodeIndex,
        handler: HandlerId,
    },
    Flushed {
        node: NodeIndex,
        port: Port,
        handler: HandlerId,
    },
}

impl Upcall {
    /// Node whose service receives this upcall.
    pub fn node(&self) -> NodeIndex {
        match self {
            Upcall::Deliver { node, .. }
            | Upcall::TransportError { node, .. }
            | Upcall::MessageError { node, .. }
            | Upcall::ClearToSend { node, .. }
            | Upcall::Flushed { node, .. } => *node,
        }
    }
}

/// Out-of-band notification from one side of a link to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportSignal {
    /// The sending node reset while the link was up.
    SourceReset,
    /// A read error hit the link in both directions.
    BidiReadError,
    /// A dest-not-ready notice was consumed; held traffic may flow.
    DestReady,
}

/// A signal the network must apply to `target`'s transport on the same
/// port, with this transport's node as the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSignal {
    pub target: NodeIndex,
    pub signal: TransportSignal,
}

/// Effects of a transport operation that reach beyond the transport.
#[derive(Debug, Default)]
pub struct Effects {
    pub upcalls: Vec<Upcall>,
    pub signals: Vec<PeerSignal>,
}

impl Effects {
    fn signal(&mut self, target: NodeIndex, signal: TransportSignal) {
        self.signals.push(PeerSignal { target, signal });
    }
}

/// This side of the link toward one peer.
#[derive(Debug, Clone, Default)]
struct PeerLink {
    queue: VecDeque<SimulatedMessage>,
    state: LinkState,
    /// Model checking: a `MESSAGE` event for the queue head is pending.
    delivery_queued: bool,
    /// Key of the pending dest-not-ready notice.
    dest_not_ready: Option<u64>,
    rts_requests: VecDeque<HandlerId>,
    /// Key of the pending CTS event.
    cts_event: Option<u64>,
}

impl PeerLink {
    fn queued_bytes(&self) -> usize {
        self.queue.iter().map(SimulatedMessage::size).sum()
    }

    /// The head may be handed to the peer.
    fn is_available(&self) -> bool {
        !self.queue.is_empty() && self.state.can_deliver()
    }
}

/// A simulated transport bound on one (node, port).
#[derive(Debug, Clone)]
pub struct SimTransport {
    node: NodeIndex,
    port: Port,
    kind: TransportKind,
    queue_size: usize,
    listening: bool,
    handlers: BTreeSet<HandlerId>,
    peers: Vec<PeerLink>,
    flush_requests: BTreeSet<HandlerId>,
    flush_event: Option<u64>,
    violations: Vec<String>,
}

fn is_message_event(e: &Event, dest: NodeIndex, src: NodeIndex, port: Port) -> bool {
    e.node == dest
        && matches!(e.kind, EventKind::Network(NetEvent { kind: NetEventKind::Message, peer, port: p })
            if peer == src && p == port)
}

fn is_owned_event(e: &Event, owner: NodeIndex, kind: NetEventKind, peer: NodeIndex, port: Port) -> bool {
    e.node == owner
        && matches!(e.kind, EventKind::Network(NetEvent { kind: k, peer: p, port: q })
            if k == kind && p == peer && q == port)
}

impl SimTransport {
    /// A transport for `node` in a cluster of `node_count` nodes.
    pub fn new(
        node: NodeIndex,
        port: Port,
        kind: TransportKind,
        node_count: u32,
        queue_size: usize,
    ) -> Self {
        Self {
            node,
            port,
            kind,
            queue_size,
            listening: false,
            handlers: BTreeSet::new(),
            peers: vec![PeerLink::default(); node_count as usize],
            flush_requests: BTreeSet::new(),
            flush_event: None,
            violations: Vec::new(),
        }
    }

    pub fn node(&self) -> NodeIndex {
        self.node
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Accept deliveries from now on.
    pub fn start_listening(&mut self) {
        self.listening = true;
    }

    pub fn register_handler(&mut self, handler: HandlerId) {
        self.handlers.insert(handler);
        self.listening = true;
    }

    pub fn has_handler(&self, handler: HandlerId) -> bool {
        self.handlers.contains(&handler)
    }

    /// Protocol violations observed since the last call.
    pub fn take_violations(&mut self) -> Vec<String> {
        std::mem::take(&mut self.violations)
    }

    fn link(&self, peer: NodeIndex) -> Result<&PeerLink, SimulationError> {
        self.peers
            .get(peer as usize)
            .ok_or(SimulationError::InvalidNode(peer))
    }

    fn link_mut(&mut self, peer: NodeIndex) -> Result<&mut PeerLink, SimulationError> {
        self.peers
            .get_mut(peer as usize)
            .ok_or(SimulationError::InvalidNode(peer))
    }

    /// State of this side of the link toward `peer`.
    pub fn link_state(&self, peer: NodeIndex) -> LinkState {
        self.peers
            .get(peer as usize)
            .map(|l| l.state)
            .unwrap_or_default()
    }

    /// This side of the link toward `peer`, for the consistency property.
    pub fn link_side(&self, peer: NodeIndex) -> LinkSide {
        let link = self.peers.get(peer as usize);
        LinkSide {
            state: link.map(|l| l.state).unwrap_or_default(),
            dest_not_ready: link.map(|l| l.dest_not_ready.is_some()).unwrap_or(false),
        }
    }

    /// Messages queued toward `peer`.
    pub fn queue_len(&self, peer: NodeIndex) -> usize {
        self.peers.get(peer as usize).map(|l| l.queue.len()).unwrap_or(0)
    }

    /// Whether a model-checking delivery event toward `peer` is pending.
    pub fn delivery_queued(&self, peer: NodeIndex) -> bool {
        self.peers
            .get(peer as usize)
            .map(|l| l.delivery_queued)
            .unwrap_or(false)
    }

    /// Whether `route` to `dest` would be accepted.
    pub fn can_send(&self, dest: NodeIndex) -> bool {
        self.peers
            .get(dest as usize)
            .map(|l| l.queue.len() < self.queue_size)
            .unwrap_or(false)
    }

    /// Bytes queued across all destinations.
    pub fn queued_bytes(&self) -> usize {
        self.peers.iter().map(PeerLink::queued_bytes).sum()
    }

    /// Destinations whose queue holds more than [`FLOW_THRESHOLD_BYTES`].
    pub fn num_flows(&self) -> usize {
        self.peers
            .iter()
            .filter(|l| l.queued_bytes() > FLOW_THRESHOLD_BYTES)
            .count()
    }

    /// Time the last queued message toward `dest` arrives, if any.
    pub fn last_arrival(&self, dest: NodeIndex) -> Option<u64> {
        self.peers
            .get(dest as usize)
            .and_then(|l| l.queue.back())
            .map(|m| m.arrival_time)
    }

    fn apply(&mut self, peer: NodeIndex, input: LinkInput) {
        let Some(link) = self.peers.get_mut(peer as usize) else {
            return;
        };
        match link.state.transition(input) {
            Some(next) => link.state = next,
            None => {
                let msg = format!(
                    "illegal link input {input:?} on {}->{peer} port {} in state {}",
                    self.node, self.port, link.state
                );
                error!(node = self.node, peer, port = self.port, "{msg}");
                self.violations.push(msg);
            }
        }
    }

    fn message_event(&self, dest: NodeIndex, description: String) -> Event {
        Event::network(dest, NetEventKind::Message, self.node, self.port, description)
    }

    fn describe(msg: &SimulatedMessage) -> String {
        match msg.kind {
            MessageKind::Data => format!(
                "id {} from {} to {} size {}",
                msg.id,
                msg.source,
                msg.destination,
                msg.size()
            ),
            _ => format!(
                "error from {} on {} id {} size {}",
                msg.source,
                msg.destination,
                msg.id,
                msg.size()
            ),
        }
    }

    /// Whether `dest` holds a dest-not-ready notice about this node.
    fn peer_awaits_dest_ready(&self, env: &Env<'_>, dest: NodeIndex) -> bool {
        env.events.any(|key, e| {
            key == DEST_NOT_READY_WEIGHT
                && is_owned_event(e, dest, NetEventKind::DestNotReady, self.node, self.port)
        })
    }

    // ─── Sending ───

    /// Queue `payload` for `dest`.
    ///
    /// Returns `false` when the queue toward `dest` is full; the message is
    /// dropped. `timing` is required in timed mode.
    pub fn route(
        &mut self,
        env: &mut Env<'_>,
        dest: NodeIndex,
        id: MessageId,
        handler: HandlerId,
        payload: &str,
        timing: Option<RouteTiming>,
    ) -> Result<bool, SimulationError> {
        let queue_size = self.queue_size;
        if self.link(dest)?.queue.len() >= queue_size {
            debug!(node = self.node, dest, port = self.port, "queue full, message dropped");
            return Ok(false);
        }
        if self.kind == TransportKind::Datagram
            && env.params.use_udp_errors
            && env.choices.weighted(&[1, 0])? == 1
        {
            debug!(node = self.node, dest, port = self.port, "datagram lost");
            return Ok(true);
        }

        let send_time = env.clock.now(self.node);
        let mut msg = SimulatedMessage {
            source: self.node,
            destination: dest,
            id,
            send_time,
            arrival_time: 0,
            kind: MessageKind::Data,
            handler,
            payload: payload.to_string(),
        };

        match timing {
            Some(timing) if env.is_timed() => {
                let back = self.link(dest)?.queue.back().map(|m| m.arrival_time);
                let start = back
                    .map(|a| send_time.max(a.saturating_sub(timing.fixed_latency)))
                    .unwrap_or(send_time);
                let arrival = env.events.next_free_key(start + timing.latency);
                msg.arrival_time = arrival;
                let link = self.link(dest)?;
                if !link.state.remote_error() && link.dest_not_ready.is_none() {
                    env.events.add(arrival, self.message_event(dest, Self::describe(&msg)));
                }
            }
            _ => {
                let awaits = self.peer_awaits_dest_ready(env, dest);
                let weight = env.params.message_weight;
                let event = self.message_event(dest, Self::describe(&msg));
                let link = self.link_mut(dest)?;
                if !link.delivery_queued
                    && !link.state.remote_error()
                    && link.dest_not_ready.is_none()
                    && !awaits
                {
                    env.events.add(weight, event);
                    link.delivery_queued = true;
                }
            }
        }

        self.link_mut(dest)?.queue.push_back(msg);
        self.remove_flushed_event(env);
        Ok(true)
    }

    /// Make sure a model-checking delivery event exists iff the head of the
    /// queue toward `dest` is deliverable.
    fn rearm(&mut self, env: &mut Env<'_>, dest: NodeIndex) {
        if env.is_timed() {
            return;
        }
        let Some(link) = self.peers.get(dest as usize) else {
            return;
        };
        let available = link.is_available();
        if available && !link.delivery_queued {
            let description = link
                .queue
                .front()
                .map(Self::describe)
                .unwrap_or_default();
            let event = self.message_event(dest, description);
            env.events.add(env.params.message_weight, event);
        }
        if let Some(link) = self.peers.get_mut(dest as usize) {
            link.delivery_queued = available;
        }
    }

    /// Remove the pending delivery events of data messages toward `dest`.
    ///
    /// A queued `READ_ERROR` keeps its event.
    fn remove_message_events(&mut self, env: &mut Env<'_>, dest: NodeIndex) {
        let (node, port) = (self.node, self.port);
        let Some(link) = self.peers.get_mut(dest as usize) else {
            return;
        };
        if env.is_timed() {
            for msg in link.queue.iter().filter(|m| m.kind == MessageKind::Data) {
                env.events.remove_exact(msg.arrival_time, |e| is_message_event(e, dest, node, port));
            }
        } else if link.delivery_queued
            && link.queue.front().map(|m| m.kind) == Some(MessageKind::Data)
        {
            let weight = env.params.message_weight;
            env.events.remove_exact(weight, |e| is_message_event(e, dest, node, port));
            link.delivery_queued = false;
        }
    }

    /// Remove the event of a queued `READ_ERROR` at the head toward `dest`.
    fn remove_head_error_event(&mut self, env: &mut Env<'_>, dest: NodeIndex) {
        let (node, port) = (self.node, self.port);
        let Some(link) = self.peers.get_mut(dest as usize) else {
            return;
        };
        let key = if env.is_timed() {
            link.queue.front().map(|m| m.arrival_time)
        } else if link.delivery_queued {
            Some(env.params.message_weight)
        } else {
            None
        };
        if let Some(key) = key {
            env.events.remove_exact(key, |e| is_message_event(e, dest, node, port));
        }
        link.delivery_queued = false;
    }

    /// Put a `READ_ERROR` at the head of the queue toward `dest`.
    fn queue_error_message(&mut self, env: &mut Env<'_>, dest: NodeIndex) {
        let now = env.clock.now(self.node);
        let mut msg = SimulatedMessage {
            source: self.node,
            destination: dest,
            id: 0,
            send_time: now,
            arrival_time: 0,
            kind: MessageKind::ReadError,
            handler: HandlerId::NONE,
            payload: String::new(),
        };
        let event = self.message_event(dest, Self::describe(&msg));
        if env.is_timed() {
            let key = env.events.next_free_key(now + 1);
            msg.arrival_time = key;
            env.events.add(key, event);
        } else if !self.delivery_queued(dest) {
            env.events.add(env.params.message_weight, event);
            if let Some(link) = self.peers.get_mut(dest as usize) {
                link.delivery_queued = true;
            }
        }
        if let Some(link) = self.peers.get_mut(dest as usize) {
            link.queue.push_front(msg);
        }
    }

    // ─── Delivery ───

    /// Consume the head of the queue toward `dest`; its delivery event has
    /// just been popped.
    pub fn take_message(
        &mut self,
        env: &mut Env<'_>,
        dest: NodeIndex,
    ) -> Result<SimulatedMessage, SimulationError> {
        let reorder = self.kind == TransportKind::Datagram
            && env.params.use_udp_reorder
            && !env.is_timed()
            && !env.choices.is_weighted();
        let len = self.link(dest)?.queue.len();
        let index = if reorder && len > 1 {
            env.choices.uniform(len as u64)? as usize
        } else {
            0
        };

        let (node, port, kind) = (self.node, self.port, self.kind);
        let link = self.link_mut(dest)?;
        link.delivery_queued = false;
        if kind == TransportKind::Stream && !link.is_available() {
            return Err(SimulationError::InvariantViolation(format!(
                "delivery event fired for {node}->{dest} port {port} with nothing deliverable"
            )));
        }
        let msg = link.queue.remove(index).ok_or_else(|| {
            SimulationError::InvariantViolation(format!(
                "delivery event fired for {node}->{dest} port {port} on an empty queue"
            ))
        })?;

        if self.kind == TransportKind::Stream {
            match msg.kind {
                MessageKind::Data => self.apply(dest, LinkInput::Opened),
                MessageKind::ReadError => self.apply(dest, LinkInput::ErrorDequeued),
                MessageKind::DestNotReady => {}
            }
        }
        self.add_flushed_event(env);
        self.add_cts_event(env, dest);
        self.rearm(env, dest);
        Ok(msg)
    }

    /// Handle a message taken from `msg.source`'s queue toward this node.
    ///
    /// `net_error_budget` is true when another injected socket error fits in
    /// the path's budget; the return value says whether one was injected.
    pub fn receive(
        &mut self,
        env: &mut Env<'_>,
        msg: SimulatedMessage,
        net_error_budget: bool,
        effects: &mut Effects,
    ) -> Result<bool, SimulationError> {
        let src = msg.source;
        let mut injected = false;
        match (self.kind, msg.kind) {
            (TransportKind::Datagram, _) | (TransportKind::Stream, MessageKind::Data) => {
                if self.kind == TransportKind::Stream {
                    self.apply(src, LinkInput::Opened);
                    if !self.link_state(src).has_error() && src != self.node && net_error_budget {
                        let weights = [100, env.params.net_error_weight];
                        if env.choices.weighted(&weights)? == 1 {
                            info!(node = self.node, peer = src, port = self.port, "message followed by error");
                            self.signal(env, src, TransportSignal::BidiReadError)?;
                            effects.signal(src, TransportSignal::BidiReadError);
                            injected = true;
                        }
                    }
                }
                if self.handlers.contains(&msg.handler) {
                    effects.upcalls.push(Upcall::Deliver {
                        node: self.node,
                        port: self.port,
                        from: src,
                        handler: msg.handler,
                        payload: msg.payload,
                    });
                } else {
                    warn!(
                        node = self.node,
                        port = self.port,
                        from = src,
                        handler = %msg.handler,
                        "no handler registered, packet dropped"
                    );
                }
            }
            (TransportKind::Stream, MessageKind::ReadError) => {
                self.apply(src, LinkInput::ErrorReceived);
                self.transport_error(env, src, TransportErrorKind::ReadError, effects)?;
            }
            (TransportKind::Stream, MessageKind::DestNotReady) => {
                return Err(SimulationError::InvariantViolation(format!(
                    "dest-not-ready notice queued as a message from {src} to {}",
                    self.node
                )));
            }
        }
        Ok(injected)
    }

    /// Drop queued data toward `dest` after a transport error.
    ///
    /// A queued `READ_ERROR` at the head survives. With `kind` set and
    /// message-error upcalls enabled, every dropped message is reported.
    fn clear_queue(
        &mut self,
        env: &mut Env<'_>,
        dest: NodeIndex,
        kind: Option<TransportErrorKind>,
        effects: &mut Effects,
    ) -> Result<(), SimulationError> {
        if self.link(dest)?.queue.is_empty() {
            return Ok(());
        }
        self.remove_message_events(env, dest);
        let (node, port) = (self.node, self.port);
        let upcall_errors = env.params.upcall_message_errors;
        let link = self.link_mut(dest)?;
        let keep = usize::from(link.queue.front().map(|m| m.kind) != Some(MessageKind::Data));
        for msg in link.queue.drain(keep..) {
            if let (Some(kind), true) = (kind, upcall_errors) {
                effects.upcalls.push(Upcall::MessageError {
                    node,
                    port,
                    peer: dest,
                    kind,
                    handler: msg.handler,
                    payload: msg.payload,
                });
            }
        }
        if link.queue.is_empty() {
            self.rearm(env, dest);
        }
        self.add_flushed_event(env);
        self.add_cts_event(env, dest);
        Ok(())
    }

    fn transport_error(
        &mut self,
        env: &mut Env<'_>,
        peer: NodeIndex,
        kind: TransportErrorKind,
        effects: &mut Effects,
    ) -> Result<(), SimulationError> {
        debug!(node = self.node, peer, port = self.port, %kind, "transport error");
        self.clear_queue(env, peer, Some(kind), effects)?;
        effects.upcalls.push(Upcall::TransportError {
            node: self.node,
            port: self.port,
            peer,
            kind,
        });
        Ok(())
    }

    // ─── Signals ───

    /// Apply a signal sent by `from`'s transport on the same port.
    pub fn signal(
        &mut self,
        env: &mut Env<'_>,
        from: NodeIndex,
        signal: TransportSignal,
    ) -> Result<(), SimulationError> {
        if self.kind == TransportKind::Datagram {
            return Ok(());
        }
        match signal {
            TransportSignal::SourceReset => {
                if self.link_state(from).local_error() {
                    let head = self.link(from)?.queue.front().map(|m| m.kind);
                    if head != Some(MessageKind::ReadError) {
                        self.violations.push(format!(
                            "{}->{from} port {} holds a local error without a queued READ_ERROR",
                            self.node, self.port
                        ));
                    }
                    self.remove_head_error_event(env, from);
                    self.link_mut(from)?.queue.pop_front();
                    self.apply(from, LinkInput::SourceReset);
                    self.rearm(env, from);
                } else {
                    self.remove_message_events(env, from);
                    self.apply(from, LinkInput::SourceReset);
                }
            }
            TransportSignal::BidiReadError => {
                self.remove_message_events(env, from);
                self.rearm(env, from);
                self.queue_error_message(env, from);
                self.apply(from, LinkInput::BidiReadError);
            }
            TransportSignal::DestReady => self.rearm(env, from),
        }
        Ok(())
    }

    // ─── Dest not ready ───

    /// The head of the queue toward `dest` reached a transport that is not
    /// listening. Its delivery event has been consumed. Hold all traffic
    /// toward `dest` and queue a notice back to this node.
    pub fn queue_dest_not_ready(
        &mut self,
        env: &mut Env<'_>,
        dest: NodeIndex,
    ) -> Result<(), SimulationError> {
        if self.kind == TransportKind::Datagram {
            self.link_mut(dest)?.delivery_queued = false;
            self.link_mut(dest)?.queue.pop_front();
            self.rearm(env, dest);
            return Ok(());
        }
        self.link_mut(dest)?.delivery_queued = false;
        self.remove_message_events(env, dest);
        let key = env.control_key(self.node, DEST_NOT_READY_WEIGHT);
        let event = Event::network(
            self.node,
            NetEventKind::DestNotReady,
            dest,
            self.port,
            format!("(dest not ready,{dest},{})", self.port),
        );
        env.events.add(key, event);
        self.link_mut(dest)?.dest_not_ready = Some(key);
        Ok(())
    }

    /// This node's dest-not-ready notice about `dest` fired: fail the
    /// connection and let `dest` release the traffic it holds for us.
    pub fn dest_not_ready_received(
        &mut self,
        env: &mut Env<'_>,
        dest: NodeIndex,
        effects: &mut Effects,
    ) -> Result<(), SimulationError> {
        if self.link_mut(dest)?.dest_not_ready.take().is_none() {
            self.violations.push(format!(
                "dest-not-ready notice fired for {}->{dest} port {} with none pending",
                self.node, self.port
            ));
        }
        self.transport_error(env, dest, TransportErrorKind::ConnectError, effects)?;
        effects.signal(dest, TransportSignal::DestReady);
        Ok(())
    }

    // ─── Flow control ───

    /// Register `handler` to hear when `dest`'s queue has room.
    pub fn request_to_send(
        &mut self,
        env: &mut Env<'_>,
        dest: NodeIndex,
        handler: HandlerId,
    ) -> Result<(), SimulationError> {
        self.link_mut(dest)?.rts_requests.push_back(handler);
        self.add_cts_event(env, dest);
        Ok(())
    }

    fn add_cts_event(&mut self, env: &mut Env<'_>, dest: NodeIndex) {
        let queue_size = self.queue_size;
        let Some(link) = self.peers.get(dest as usize) else {
            return;
        };
        let ready = !link.rts_requests.is_empty() && link.queue.len() < queue_size;
        if !ready || link.cts_event.is_some() {
            return;
        }
        let key = env.control_key(self.node, env.params.message_weight);
        let event = Event::network(
            self.node,
            NetEventKind::ClearToSend,
            dest,
            self.port,
            format!("(CTS,{dest},{})", self.port),
        );
        env.events.add(key, event);
        if let Some(link) = self.peers.get_mut(dest as usize) {
            link.cts_event = Some(key);
        }
    }

    /// The CTS event toward `dest` fired: grant the oldest request.
    pub fn clear_to_send(
        &mut self,
        env: &mut Env<'_>,
        dest: NodeIndex,
        effects: &mut Effects,
    ) -> Result<String, SimulationError> {
        let link = self.link_mut(dest)?;
        link.cts_event = None;
        let Some(handler) = link.rts_requests.pop_front() else {
            return Ok(format!("no request to send to {dest}"));
        };
        effects.upcalls.push(Upcall::ClearToSend {
            node: self.node,
            port: self.port,
            peer: dest,
            handler,
        });
        self.add_cts_event(env, dest);
        Ok(format!("CTS to {dest} for {handler}"))
    }

    /// Register `handler` to hear when every queue has drained.
    pub fn request_flushed(&mut self, env: &mut Env<'_>, handler: HandlerId) {
        self.flush_requests.insert(handler);
        self.add_flushed_event(env);
    }

    fn add_flushed_event(&mut self, env: &mut Env<'_>) {
        let drained = self.peers.iter().all(|l| l.queue.is_empty());
        if self.flush_requests.is_empty() || !drained || self.flush_event.is_some() {
            return;
        }
        let key = env.control_key(self.node, FLUSH_WEIGHT);
        let event = Event::network(
            self.node,
            NetEventKind::Flushed,
            self.node,
            self.port,
            format!("(FLUSHED,{},{})", self.node, self.port),
        );
        env.events.add(key, event);
        self.flush_event = Some(key);
    }

    fn remove_flushed_event(&mut self, env: &mut Env<'_>) {
        if let Some(key) = self.flush_event.take() {
            let (node, port) = (self.node, self.port);
            env.events
                .remove_exact(key, |e| is_owned_event(e, node, NetEventKind::Flushed, node, port));
        }
    }

    /// The flushed event fired: notify every registrant once.
    pub fn flushed(&mut self, effects: &mut Effects) -> String {
        self.flush_event = None;
        let handlers = std::mem::take(&mut self.flush_requests);
        let count = handlers.len();
        for handler in handlers {
            effects.upcalls.push(Upcall::Flushed {
                node: self.node,
                port: self.port,
                handler,
            });
        }
        format!("flushed {count} handlers")
    }

    // ─── Reset ───

    /// The owning node crashed. Drop every queue, resolve every link to a
    /// post-reset state, and return the peers that must hear `SOURCE_RESET`.
    pub fn reset(&mut self, env: &mut Env<'_>) -> Result<Vec<NodeIndex>, SimulationError> {
        let (node, port) = (self.node, self.port);
        self.listening = false;
        self.handlers.clear();
        self.flush_requests.clear();
        self.remove_flushed_event(env);
        for (peer, link) in self.peers.iter_mut().enumerate() {
            link.rts_requests.clear();
            if let Some(key) = link.cts_event.take() {
                let peer = peer as NodeIndex;
                env.events.remove_exact(key, |e| {
                    is_owned_event(e, node, NetEventKind::ClearToSend, peer, port)
                });
            }
        }

        let mut notify = Vec::new();
        let mut scratch = Effects::default();
        for peer in 0..self.peers.len() as NodeIndex {
            if self.kind == TransportKind::Datagram || peer == self.node {
                self.clear_all(env, peer);
                continue;
            }
            if let Some(key) = self.link_mut(peer)?.dest_not_ready.take() {
                env.events.remove_exact(key, |e| {
                    is_owned_event(e, node, NetEventKind::DestNotReady, peer, port)
                });
                self.clear_queue(env, peer, None, &mut scratch)?;
                continue;
            }
            let (next, action) = self.link_state(peer).after_reset();
            self.clear_queue(env, peer, None, &mut scratch)?;
            self.link_mut(peer)?.state = next;
            if action.queue_error {
                self.queue_error_message(env, peer);
            }
            if action.notify_peer {
                notify.push(peer);
            }
        }
        Ok(notify)
    }

    /// Drop every message toward `peer`, errors included.
    fn clear_all(&mut self, env: &mut Env<'_>, peer: NodeIndex) {
        if self.link_state(peer).local_error() {
            self.remove_head_error_event(env, peer);
        } else {
            self.remove_message_events(env, peer);
        }
        if let Some(link) = self.peers.get_mut(peer as usize) {
            link.queue.clear();
            link.delivery_queued = false;
            link.state = LinkState::Closed;
        }
    }

    /// Canonical rendering for state hashing. Message ids and timestamps are
    /// left out so equivalent interleavings render alike.
    pub fn print_state(&self) -> String {
        let mut out = format!(
            "[{:?} {}:{} listening={} handlers={:?}",
            self.kind, self.node, self.port, self.listening, self.handlers
        );
        for (peer, link) in self.peers.iter().enumerate() {
            if link.queue.is_empty()
                && link.state == LinkState::Closed
                && link.dest_not_ready.is_none()
                && link.rts_requests.is_empty()
            {
                continue;
            }
            let _ = write!(
                out,
                " ->{peer}({} dnr={} rts={:?} q=[",
                link.state,
                link.dest_not_ready.is_some(),
                link.rts_requests
            );
            for msg in &link.queue {
                let _ = write!(out, "{:?}:{}:{};", msg.kind, msg.handler, msg.payload);
            }
            out.push_str("])");
        }
        let _ = write!(out, " flush={:?}]", self.flush_requests);
        out
    }
}
