//! Flooding broadcast with flow control.
//!
//! Node 0 holds a value. A node that accepts the value forwards it once to
//! every other node through `route_rts`; a full queue parks the peer until
//! clear-to-send. A peer whose connection fails is parked again and retried.
//! Once nothing is parked the node asks for a flush notification.

use pathcheck_core::{NodeApi, NodeService, ServiceError, ServiceResult, TransportErrorKind};
use pathcheck_simulation::{
    CheckedService, LivenessProperty, LoadedTest, SafetyProperty, SimulationError,
    SimulationParams, SystemView, TransportKind,
};
use pathcheck_types::{HandlerId, NodeIndex, Port, TimerId};
use std::any::Any;
use std::collections::BTreeSet;
use tracing::{debug, info};

const HANDLER: HandlerId = HandlerId(2);

#[derive(Debug, Clone)]
pub struct FloodService {
    port: Port,
    /// The value node 0 starts with.
    initial: Option<u64>,
    accepted: Option<u64>,
    conflicts: u64,
    pending: BTreeSet<NodeIndex>,
    flushed: bool,
}

impl FloodService {
    pub fn new(port: Port, initial: Option<u64>) -> Self {
        Self {
            port,
            initial,
            accepted: None,
            conflicts: 0,
            pending: BTreeSet::new(),
            flushed: false,
        }
    }

    pub fn accepted(&self) -> Option<u64> {
        self.accepted
    }

    /// Copies received that disagreed with the accepted value.
    pub fn conflicts(&self) -> u64 {
        self.conflicts
    }

    /// Every peer has the value queued or delivered and the queues drained.
    pub fn is_done(&self) -> bool {
        self.accepted.is_some() && self.pending.is_empty() && self.flushed
    }

    fn accept(&mut self, api: &mut dyn NodeApi, value: u64) -> ServiceResult {
        info!(node = api.node(), value, "accepted value");
        self.accepted = Some(value);
        let me = api.node();
        self.pending = (0..api.node_count()).filter(|n| *n != me).collect();
        let peers: Vec<NodeIndex> = self.pending.iter().copied().collect();
        for peer in peers {
            self.forward(api, peer)?;
        }
        self.flush_if_idle(api)
    }

    /// Try to hand the value to `peer`. It stays pending when rejected.
    fn forward(&mut self, api: &mut dyn NodeApi, peer: NodeIndex) -> ServiceResult {
        let Some(value) = self.accepted else {
            return Ok(());
        };
        if api.route_rts(self.port, peer, HANDLER, &format!("value {value}"))? {
            self.pending.remove(&peer);
        } else {
            debug!(node = api.node(), peer, "queue full, waiting for clear-to-send");
        }
        Ok(())
    }

    fn flush_if_idle(&mut self, api: &mut dyn NodeApi) -> ServiceResult {
        if self.pending.is_empty() && !self.flushed {
            api.request_flushed(self.port, HANDLER)?;
        }
        Ok(())
    }

    /// The copy for `peer` was lost; send it again.
    fn retry(&mut self, api: &mut dyn NodeApi, peer: NodeIndex) -> ServiceResult {
        if self.accepted.is_none() {
            return Ok(());
        }
        self.flushed = false;
        self.pending.insert(peer);
        self.forward(api, peer)?;
        self.flush_if_idle(api)
    }
}

impl NodeService for FloodService {
    fn name(&self) -> &str {
        "flood"
    }

    fn init(&mut self, api: &mut dyn NodeApi) -> ServiceResult {
        api.register_handler(self.port, HANDLER)?;
        if let Some(value) = self.initial {
            self.accept(api, value)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        *self = Self::new(self.port, self.initial);
    }

    fn deliver(
        &mut self,
        api: &mut dyn NodeApi,
        _port: Port,
        from: NodeIndex,
        _handler: HandlerId,
        payload: &str,
    ) -> ServiceResult {
        let value = payload
            .strip_prefix("value ")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| {
                ServiceError::protocol(format!("unexpected payload {payload:?} from {from}"))
            })?;
        match self.accepted {
            None => self.accept(api, value),
            Some(mine) if mine != value => {
                self.conflicts += 1;
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    fn timer_fired(&mut self, _api: &mut dyn NodeApi, _timer: TimerId) -> ServiceResult {
        Ok(())
    }

    fn transport_error(
        &mut self,
        api: &mut dyn NodeApi,
        _port: Port,
        peer: NodeIndex,
        kind: TransportErrorKind,
    ) -> ServiceResult {
        debug!(node = api.node(), peer, %kind, "flood link failed, retrying");
        self.retry(api, peer)
    }

    fn message_error(
        &mut self,
        api: &mut dyn NodeApi,
        _port: Port,
        peer: NodeIndex,
        _kind: TransportErrorKind,
        _handler: HandlerId,
        _payload: &str,
    ) -> ServiceResult {
        self.retry(api, peer)
    }

    fn clear_to_send(
        &mut self,
        api: &mut dyn NodeApi,
        _port: Port,
        peer: NodeIndex,
        _handler: HandlerId,
    ) -> ServiceResult {
        if self.pending.contains(&peer) {
            self.forward(api, peer)?;
        }
        self.flush_if_idle(api)
    }

    fn flushed(&mut self, _api: &mut dyn NodeApi, _port: Port, _handler: HandlerId) -> ServiceResult {
        self.flushed = self.pending.is_empty();
        Ok(())
    }

    fn state_string(&self) -> String {
        format!(
            "accepted={:?} conflicts={} pending={:?} flushed={}",
            self.accepted, self.conflicts, self.pending, self.flushed
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// No node accepts a value other than the one node 0 started with.
pub struct Agreement(pub u64);

impl SafetyProperty for Agreement {
    fn name(&self) -> &str {
        "agreement"
    }

    fn check(&self, view: &SystemView<'_>) -> Result<(), String> {
        for (node, s) in view.services_of::<FloodService>().enumerate() {
            match s.accepted {
                Some(v) if v != self.0 => {
                    return Err(format!("node {node} accepted {v}, expected {}", self.0))
                }
                _ if s.conflicts > 0 => {
                    return Err(format!("node {node} saw {} conflicting copies", s.conflicts))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Every node accepted the value and drained its queues.
pub struct AllFlushed;

impl LivenessProperty for AllFlushed {
    fn name(&self) -> &str {
        "all flushed"
    }

    fn is_live(&self, view: &SystemView<'_>) -> bool {
        view.services_of::<FloodService>().all(FloodService::is_done)
    }
}

/// The `flood` entry of the registry.
#[derive(Debug, Clone)]
pub struct FloodTest {
    value: u64,
}

impl FloodTest {
    pub fn new(value: u64) -> Self {
        Self { value }
    }
}

impl CheckedService for FloodTest {
    fn name(&self) -> &str {
        "flood"
    }

    fn description(&self) -> &str {
        "node 0 floods a value with request-to-send and flush"
    }

    fn load_test(
        &self,
        node_count: u32,
        params: &SimulationParams,
    ) -> Result<LoadedTest, SimulationError> {
        let services = (0..node_count)
            .map(|node| {
                let initial = (node == 0).then_some(self.value);
                Box::new(FloodService::new(params.base_port, initial)) as Box<dyn NodeService>
            })
            .collect();
        Ok(LoadedTest::new(services)
            .with_binding(params.base_port, TransportKind::Stream)
            .with_safety(Agreement(self.value))
            .with_liveness(AllFlushed))
    }
}
