//! Simulated network service.
//!
//! Registry of every transport in the cluster, keyed by (port, node), plus
//! the latency model. The network is the only component that sees both ends
//! of a link: it moves messages from the sender's queue to the receiver's
//! transport and applies the signals one side raises for the other.

use crate::context::Env;
use crate::latency::LatencyModel;
use crate::link::LinkSide;
use crate::transport::{
    Effects, MessageKind, PeerSignal, RouteTiming, SimTransport, TransportKind, TransportSignal,
    Upcall,
};
use crate::{SimulationError, SimulationParams};
use pathcheck_core::{Event, EventKind, NetEvent, NetEventKind};
use pathcheck_types::{HandlerId, MessageId, NodeIndex, Port};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// All simulated transports of the cluster.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    node_count: u32,
    transports: BTreeMap<(Port, NodeIndex), SimTransport>,
    latency: LatencyModel,
    next_message_id: MessageId,
    /// Socket errors injected on the current path.
    net_errors: u64,
    /// Budget of injected socket errors; negative is unbounded.
    net_error_budget: i64,
}

impl SimNetwork {
    pub fn new(node_count: u32, latency: LatencyModel) -> Self {
        Self {
            node_count,
            transports: BTreeMap::new(),
            latency,
            next_message_id: 0,
            net_errors: 0,
            net_error_budget: 0,
        }
    }

    /// Network with the latency model and error budget of `params`.
    pub fn from_params(params: &SimulationParams, node_count: u32) -> Result<Self, SimulationError> {
        let latency = LatencyModel::from_file(params.sim_network_params.as_deref())?;
        Ok(Self::new(node_count, latency).with_net_error_budget(params.sim_num_net_errors))
    }

    pub fn with_net_error_budget(mut self, budget: i64) -> Self {
        self.net_error_budget = budget;
        self
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Socket errors injected on the current path.
    pub fn net_errors(&self) -> u64 {
        self.net_errors
    }

    fn net_error_allowed(&self) -> bool {
        self.net_error_budget < 0 || self.net_errors < self.net_error_budget as u64
    }

    // ─── Registry ───

    /// Bind a transport on (`node`, `port`).
    pub fn bind(
        &mut self,
        node: NodeIndex,
        port: Port,
        kind: TransportKind,
        queue_size: usize,
    ) -> Result<(), SimulationError> {
        if node >= self.node_count {
            return Err(SimulationError::InvalidNode(node));
        }
        if self.transports.contains_key(&(port, node)) {
            return Err(SimulationError::DuplicateTransport { node, port });
        }
        let transport = SimTransport::new(node, port, kind, self.node_count, queue_size);
        self.transports.insert((port, node), transport);
        Ok(())
    }

    /// Bind a transport on `port` for every node.
    pub fn bind_all(
        &mut self,
        port: Port,
        kind: TransportKind,
        queue_size: usize,
    ) -> Result<(), SimulationError> {
        for node in 0..self.node_count {
            self.bind(node, port, kind, queue_size)?;
        }
        Ok(())
    }

    pub fn transport(&self, node: NodeIndex, port: Port) -> Result<&SimTransport, SimulationError> {
        self.transports
            .get(&(port, node))
            .ok_or(SimulationError::UnknownTransport { node, port })
    }

    pub fn transport_mut(
        &mut self,
        node: NodeIndex,
        port: Port,
    ) -> Result<&mut SimTransport, SimulationError> {
        self.transports
            .get_mut(&(port, node))
            .ok_or(SimulationError::UnknownTransport { node, port })
    }

    /// Bound ports and their transport kind.
    pub fn ports(&self) -> Vec<(Port, TransportKind)> {
        let mut ports: Vec<(Port, TransportKind)> = self
            .transports
            .iter()
            .map(|(&(port, _), t)| (port, t.kind()))
            .collect();
        ports.dedup();
        ports
    }

    // ─── Sending ───

    /// Route a message from `node` to `dest` on `port`.
    pub fn route(
        &mut self,
        env: &mut Env<'_>,
        node: NodeIndex,
        port: Port,
        dest: NodeIndex,
        handler: HandlerId,
        payload: &str,
    ) -> Result<bool, SimulationError> {
        if dest >= self.node_count {
            return Err(SimulationError::InvalidNode(dest));
        }
        let timing = if env.is_timed() {
            let flows = self
                .transports
                .iter()
                .filter(|((_, n), _)| *n == node)
                .map(|(_, t)| t.num_flows())
                .sum();
            let fraction = env.choices.fraction();
            Some(RouteTiming {
                latency: self
                    .latency
                    .latency(node, dest, payload.len(), flows, fraction)?,
                fixed_latency: self.latency.fixed_latency(node, dest)?,
            })
        } else {
            None
        };
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        self.transport_mut(node, port)?
            .route(env, dest, id, handler, payload, timing)
    }

    // ─── Event execution ───

    /// Execute a popped network event. Returns the step description and the
    /// upcalls to dispatch.
    pub fn simulate(
        &mut self,
        env: &mut Env<'_>,
        event: &Event,
    ) -> Result<(String, Vec<Upcall>), SimulationError> {
        let EventKind::Network(NetEvent { kind, peer, port }) = event.kind else {
            return Err(SimulationError::InvariantViolation(format!(
                "network asked to execute {event}"
            )));
        };
        let node = event.node;
        let mut effects = Effects::default();
        let description = match kind {
            NetEventKind::Message => {
                let (dest, src) = (node, peer);
                if !self.transport(dest, port)?.is_listening() {
                    self.transport_mut(src, port)?.queue_dest_not_ready(env, dest)?;
                    format!("Connection refused from {src}")
                } else {
                    let msg = self.transport_mut(src, port)?.take_message(env, dest)?;
                    let description = match msg.kind {
                        MessageKind::Data => {
                            format!("message id {} from {src} to {dest} size {}", msg.id, msg.size())
                        }
                        _ => format!("error from {src} on {dest}"),
                    };
                    let allowed = self.net_error_allowed();
                    let injected = self
                        .transport_mut(dest, port)?
                        .receive(env, msg, allowed, &mut effects)?;
                    if injected {
                        self.net_errors += 1;
                    }
                    description
                }
            }
            NetEventKind::DestNotReady => {
                self.transport_mut(node, port)?
                    .dest_not_ready_received(env, peer, &mut effects)?;
                format!("dest not ready {peer} on port {port}")
            }
            NetEventKind::ClearToSend => {
                self.transport_mut(node, port)?
                    .clear_to_send(env, peer, &mut effects)?
            }
            NetEventKind::Flushed => self.transport_mut(node, port)?.flushed(&mut effects),
        };
        self.apply_signals(env, port, node, &effects.signals)?;
        trace!(node, port, upcalls = effects.upcalls.len(), "network event executed");
        Ok((description, effects.upcalls))
    }

    fn apply_signals(
        &mut self,
        env: &mut Env<'_>,
        port: Port,
        source: NodeIndex,
        signals: &[PeerSignal],
    ) -> Result<(), SimulationError> {
        for sig in signals {
            debug!(from = source, to = sig.target, port, signal = ?sig.signal, "signal");
            self.transport_mut(sig.target, port)?
                .signal(env, source, sig.signal)?;
        }
        Ok(())
    }

    /// `node` crashed: reset its transports and tell the affected peers.
    pub fn reset_node(&mut self, env: &mut Env<'_>, node: NodeIndex) -> Result<(), SimulationError> {
        let ports: Vec<Port> = self
            .transports
            .keys()
            .filter(|(_, n)| *n == node)
            .map(|(p, _)| *p)
            .collect();
        for port in ports {
            let notify = self.transport_mut(node, port)?.reset(env)?;
            let signals: Vec<PeerSignal> = notify
                .into_iter()
                .map(|target| PeerSignal {
                    target,
                    signal: TransportSignal::SourceReset,
                })
                .collect();
            self.apply_signals(env, port, node, &signals)?;
        }
        Ok(())
    }

    // ─── Inspection ───

    /// Both sides of every stream link on `port`, as `(i, j, i->j, j->i)`
    /// with `i < j`.
    pub fn link_pairs(&self, port: Port) -> Vec<(NodeIndex, NodeIndex, LinkSide, LinkSide)> {
        let mut pairs = Vec::new();
        for i in 0..self.node_count {
            for j in (i + 1)..self.node_count {
                if let (Ok(a), Ok(b)) = (self.transport(i, port), self.transport(j, port)) {
                    if a.kind() == TransportKind::Stream && b.kind() == TransportKind::Stream {
                        pairs.push((i, j, a.link_side(j), b.link_side(i)));
                    }
                }
            }
        }
        pairs
    }

    /// Protocol violations recorded by any transport since the last call.
    pub fn take_violations(&mut self) -> Vec<String> {
        self.transports
            .values_mut()
            .flat_map(|t| t.take_violations())
            .collect()
    }

    /// Canonical rendering for state hashing.
    pub fn print_state(&self) -> String {
        self.transports
            .values()
            .map(SimTransport::print_state)
            .collect::<Vec<_>>()
            .join("")
    }

    /// Empty every transport for a new path; bindings survive.
    pub fn reset(&mut self) {
        for transport in self.transports.values_mut() {
            *transport = SimTransport::new(
                transport.node(),
                transport.port(),
                transport.kind(),
                self.node_count,
                transport.queue_size(),
            );
        }
        self.next_message_id = 0;
        self.net_errors = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use crate::{ChoicePath, NodeClock, PendingEventStore, SimulationMode};
    use pathcheck_core::TransportErrorKind;

    const PORT: Port = 5377;
    const H: HandlerId = HandlerId(4);

    struct Fixture {
        params: SimulationParams,
        events: PendingEventStore,
        clock: NodeClock,
        choices: ChoicePath,
        net: SimNetwork,
    }

    impl Fixture {
        fn new(params: SimulationParams) -> Self {
            let mut net = SimNetwork::new(3, LatencyModel::new())
                .with_net_error_budget(params.sim_num_net_errors);
            net.bind_all(PORT, TransportKind::Stream, params.queue_size)
                .unwrap();
            Self {
                clock: NodeClock::new(params.mode, 3),
                events: PendingEventStore::new(),
                choices: ChoicePath::random(3),
                net,
                params,
            }
        }

        fn route(&mut self, src: NodeIndex, dest: NodeIndex, payload: &str) -> bool {
            let mut env = Env {
                params: &self.params,
                events: &mut self.events,
                clock: &mut self.clock,
                choices: &mut self.choices,
            };
            self.net.route(&mut env, src, PORT, dest, H, payload).unwrap()
        }

        fn step(&mut self) -> (Event, String, Vec<Upcall>) {
            let (_, event) = self.events.pop_first().unwrap();
            let mut env = Env {
                params: &self.params,
                events: &mut self.events,
                clock: &mut self.clock,
                choices: &mut self.choices,
            };
            let (desc, upcalls) = self.net.simulate(&mut env, &event).unwrap();
            (event, desc, upcalls)
        }

        fn listen(&mut self, node: NodeIndex) {
            self.net.transport_mut(node, PORT).unwrap().register_handler(H);
        }
    }

    #[test]
    fn test_message_round_trip_opens_both_sides() {
        let mut fx = Fixture::new(SimulationParams::model_check());
        fx.listen(0);
        fx.listen(1);
        assert!(fx.route(0, 1, "hi"));
        let (event, desc, upcalls) = fx.step();
        assert_eq!(event.node, 1);
        assert_eq!(desc, "message id 0 from 0 to 1 size 2");
        assert_eq!(upcalls.len(), 1);
        assert_eq!(fx.net.transport(0, PORT).unwrap().link_state(1), LinkState::Open);
        assert_eq!(fx.net.transport(1, PORT).unwrap().link_state(0), LinkState::Open);
    }

    #[test]
    fn test_dest_not_ready_scenario() {
        let mut fx = Fixture::new(SimulationParams::model_check());
        fx.listen(0);
        assert!(fx.route(0, 1, "early"));

        // Node 1 is not listening: the sender gets a notice.
        let (_, desc, upcalls) = fx.step();
        assert_eq!(desc, "Connection refused from 0");
        assert!(upcalls.is_empty());
        let (key, notice) = fx.events.iter().next().map(|(k, e)| (k, e.clone())).unwrap();
        assert_eq!(key, crate::transport::DEST_NOT_READY_WEIGHT);
        assert_eq!(notice.node, 0);
        assert!(fx.net.transport(0, PORT).unwrap().link_side(1).dest_not_ready);

        // Node 1 comes up and sends back; its traffic is held by the notice.
        fx.listen(1);
        assert!(fx.route(1, 0, "reply"));
        assert_eq!(fx.events.len(), 1);

        // The notice fires: the sender sees a connect error, the held reply
        // is released by DEST_READY.
        let (_, _, upcalls) = fx.step();
        assert!(matches!(
            upcalls.as_slice(),
            [Upcall::TransportError { node: 0, peer: 1, kind: TransportErrorKind::ConnectError, .. }]
        ));
        assert!(!fx.net.transport(0, PORT).unwrap().link_side(1).dest_not_ready);
        assert_eq!(fx.net.transport(0, PORT).unwrap().queue_len(1), 0);
        let (event, _, upcalls) = fx.step();
        assert_eq!(event.node, 0);
        assert!(matches!(upcalls.as_slice(), [Upcall::Deliver { from: 1, .. }]));
    }

    #[test]
    fn test_reset_node_signals_open_peers() {
        let mut fx = Fixture::new(SimulationParams::model_check());
        fx.listen(0);
        fx.listen(1);
        fx.route(0, 1, "x");
        fx.step();

        let mut env = Env {
            params: &fx.params,
            events: &mut fx.events,
            clock: &mut fx.clock,
            choices: &mut fx.choices,
        };
        fx.net.reset_node(&mut env, 0).unwrap();
        assert_eq!(fx.net.transport(0, PORT).unwrap().link_state(1), LinkState::ErrorQueued);
        assert_eq!(
            fx.net.transport(1, PORT).unwrap().link_state(0),
            LinkState::ErrorSignalled
        );
        for (i, j, a, b) in fx.net.link_pairs(PORT) {
            assert!(crate::link::check_link_pair(a, b).is_ok(), "{i}-{j}");
        }
        assert!(fx.net.take_violations().is_empty());
    }

    #[test]
    fn test_net_error_budget_is_respected() {
        let mut params = SimulationParams::model_check();
        params.sim_num_net_errors = 1;
        let mut fx = Fixture::new(params);
        fx.listen(0);
        fx.listen(1);
        for _ in 0..20 {
            fx.route(0, 1, "x");
            while !fx.events.is_empty() {
                fx.step();
            }
            fx.route(1, 0, "y");
            while !fx.events.is_empty() {
                fx.step();
            }
        }
        assert!(fx.net.net_errors() <= 1);
        assert!(fx.net.take_violations().is_empty());
    }

    #[test]
    fn test_timed_route_uses_latency_model() {
        let mut params = SimulationParams::timed();
        params.mode = SimulationMode::Timed;
        let mut fx = Fixture::new(params);
        fx.listen(1);
        fx.route(0, 1, &"z".repeat(1500));
        let (key, _) = fx.events.iter().next().unwrap();
        let elapsed = key - crate::SIM_START_TIME;
        // 1500 bytes at 8 Mbit/s plus at least the link latency of jitter.
        assert!(elapsed >= 1500 + 1000, "{elapsed}");
        assert!(elapsed <= 1500 + 60_000_000, "{elapsed}");
    }

    #[test]
    fn test_reset_empties_transports() {
        let mut fx = Fixture::new(SimulationParams::model_check());
        fx.listen(1);
        fx.route(0, 1, "x");
        fx.net.reset();
        assert_eq!(fx.net.transport(0, PORT).unwrap().queue_len(1), 0);
        assert!(!fx.net.transport(1, PORT).unwrap().is_listening());
        assert_eq!(fx.net.ports(), vec![(PORT, TransportKind::Stream)]);
    }
}
