//! Simulation context and the per-upcall node handle.
//!
//! All state of a run lives in one [`SimulationContext`]. Nothing is global:
//! components receive the pieces they need as explicit borrows, and the node
//! a call is made for is always an explicit parameter.

use crate::network::SimNetwork;
use crate::timer::TimerService;
use crate::transport::TransportKind;
use crate::{
    ChoicePath, NodeClock, PendingEventStore, SimulationError, SimulationMode, SimulationParams,
};
use pathcheck_core::{NodeApi, ServiceError, ServiceResult};
use pathcheck_types::{HandlerId, NodeIndex, Port, TimerId};
use tracing::trace;

/// Mutable borrows shared by every component that queues events.
pub struct Env<'a> {
    pub params: &'a SimulationParams,
    pub events: &'a mut PendingEventStore,
    pub clock: &'a mut NodeClock,
    pub choices: &'a mut ChoicePath,
}

impl Env<'_> {
    pub fn is_timed(&self) -> bool {
        self.params.mode == SimulationMode::Timed
    }

    /// Key of a control event owned by `node`: `weight` when model
    /// checking, the first free instant after the node's clock when timed.
    pub fn control_key(&self, node: NodeIndex, weight: u64) -> u64 {
        if self.is_timed() {
            self.events.next_free_key(self.clock.now(node) + 1)
        } else {
            weight
        }
    }
}

/// Everything one run of the simulator mutates.
pub struct SimulationContext {
    pub params: SimulationParams,
    pub events: PendingEventStore,
    pub clock: NodeClock,
    pub choices: ChoicePath,
    pub network: SimNetwork,
    pub timers: TimerService,
    node_count: u32,
}

impl SimulationContext {
    /// Build a context for `node_count` nodes with one transport per node
    /// for each of `bindings`.
    pub fn new(
        params: SimulationParams,
        node_count: u32,
        bindings: &[(Port, TransportKind)],
    ) -> Result<Self, SimulationError> {
        let choices = ChoicePath::from_params(&params)?;
        let mut network = SimNetwork::from_params(&params, node_count)?;
        for &(port, kind) in bindings {
            network.bind_all(port, kind, params.queue_size)?;
        }
        Ok(Self {
            clock: NodeClock::new(params.mode, node_count),
            events: PendingEventStore::new(),
            timers: TimerService::new(),
            choices,
            network,
            params,
            node_count,
        })
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn env(&mut self) -> Env<'_> {
        Env {
            params: &self.params,
            events: &mut self.events,
            clock: &mut self.clock,
            choices: &mut self.choices,
        }
    }

    /// Split into the shared environment and the two services.
    pub fn parts(&mut self) -> (Env<'_>, &mut SimNetwork, &mut TimerService) {
        (
            Env {
                params: &self.params,
                events: &mut self.events,
                clock: &mut self.clock,
                choices: &mut self.choices,
            },
            &mut self.network,
            &mut self.timers,
        )
    }

    /// A [`NodeApi`] bound to `node`.
    pub fn node_api(&mut self, node: NodeIndex, incarnation: u32) -> NodeContext<'_> {
        let node_count = self.node_count;
        let (env, network, timers) = self.parts();
        NodeContext {
            node,
            incarnation,
            node_count,
            env,
            network,
            timers,
            fault: None,
        }
    }

    /// Drop every pending event, queued message and timer, and rewind the
    /// clocks. The choice path and visited states survive.
    pub fn reset_path(&mut self) {
        self.events.clear();
        self.clock.reset();
        self.network.reset();
        self.timers.reset();
    }
}

/// The [`NodeApi`] handed to a service for one upcall.
///
/// Engine failures inside an API call cannot travel through the service's
/// `ServiceError`, so the first one is kept here and the service sees
/// [`ServiceError::Aborted`]. The caller checks [`take_fault`] after the
/// upcall returns.
///
/// [`take_fault`]: NodeContext::take_fault
pub struct NodeContext<'a> {
    node: NodeIndex,
    incarnation: u32,
    node_count: u32,
    env: Env<'a>,
    network: &'a mut SimNetwork,
    timers: &'a mut TimerService,
    fault: Option<SimulationError>,
}

impl NodeContext<'_> {
    /// The first engine error raised during this upcall, if any.
    pub fn take_fault(&mut self) -> Option<SimulationError> {
        self.fault.take()
    }

    fn abort(&mut self, err: SimulationError) -> ServiceError {
        let msg = err.to_string();
        if self.fault.is_none() {
            self.fault = Some(err);
        }
        ServiceError::Aborted(msg)
    }

    fn check_port(&self, port: Port) -> Result<(), ServiceError> {
        if self.network.transport(self.node, port).is_ok() {
            Ok(())
        } else {
            Err(ServiceError::UnknownPort(port))
        }
    }

    fn check_dest(&self, dest: NodeIndex) -> Result<(), ServiceError> {
        if dest < self.node_count {
            Ok(())
        } else {
            Err(ServiceError::InvalidNode(dest))
        }
    }
}

impl NodeApi for NodeContext<'_> {
    fn node(&self) -> NodeIndex {
        self.node
    }

    fn node_count(&self) -> u32 {
        self.node_count
    }

    fn incarnation(&self) -> u32 {
        self.incarnation
    }

    fn now(&mut self) -> Result<u64, ServiceError> {
        if !self.env.is_timed() && !self.env.params.allow_timeu {
            return Err(ServiceError::ClockDisallowed);
        }
        Ok(self.env.clock.tick(self.node))
    }

    fn register_handler(&mut self, port: Port, handler: HandlerId) -> ServiceResult {
        self.check_port(port)?;
        let node = self.node;
        match self.network.transport_mut(node, port) {
            Ok(transport) => {
                transport.register_handler(handler);
                Ok(())
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    fn route(
        &mut self,
        port: Port,
        dest: NodeIndex,
        handler: HandlerId,
        payload: &str,
    ) -> Result<bool, ServiceError> {
        self.check_port(port)?;
        self.check_dest(dest)?;
        trace!(node = self.node, dest, port, %handler, size = payload.len(), "route");
        let node = self.node;
        match self
            .network
            .route(&mut self.env, node, port, dest, handler, payload)
        {
            Ok(accepted) => Ok(accepted),
            Err(e) => Err(self.abort(e)),
        }
    }

    fn route_rts(
        &mut self,
        port: Port,
        dest: NodeIndex,
        handler: HandlerId,
        payload: &str,
    ) -> Result<bool, ServiceError> {
        let accepted = self.route(port, dest, handler, payload)?;
        if !accepted {
            self.request_to_send(port, dest, handler)?;
        }
        Ok(accepted)
    }

    fn request_to_send(&mut self, port: Port, dest: NodeIndex, handler: HandlerId) -> ServiceResult {
        self.check_port(port)?;
        self.check_dest(dest)?;
        let node = self.node;
        let result = self
            .network
            .transport_mut(node, port)
            .and_then(|t| t.request_to_send(&mut self.env, dest, handler));
        result.map_err(|e| self.abort(e))
    }

    fn request_flushed(&mut self, port: Port, handler: HandlerId) -> ServiceResult {
        self.check_port(port)?;
        let node = self.node;
        let result = self
            .network
            .transport_mut(node, port)
            .map(|t| t.request_flushed(&mut self.env, handler));
        result.map_err(|e| self.abort(e))
    }

    fn can_send(&self, port: Port, dest: NodeIndex) -> bool {
        self.network
            .transport(self.node, port)
            .map(|t| t.can_send(dest))
            .unwrap_or(false)
    }

    fn queued_bytes(&self, port: Port) -> usize {
        self.network
            .transport(self.node, port)
            .map(|t| t.queued_bytes())
            .unwrap_or(0)
    }

    fn schedule(&mut self, timer: TimerId, delay: u64) -> u64 {
        self.timers
            .schedule(&mut self.env, self.node, timer, delay, false)
    }

    fn schedule_at(&mut self, timer: TimerId, time: u64) -> u64 {
        self.timers.schedule(&mut self.env, self.node, timer, time, true)
    }

    fn cancel(&mut self, timer: TimerId) -> bool {
        self.timers.cancel(&mut self.env, self.node, timer)
    }

    fn rand_int(&mut self, max: u64) -> Result<u64, ServiceError> {
        match self.env.choices.uniform(max) {
            Ok(value) => Ok(value),
            Err(e) => Err(self.abort(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORT: Port = 5377;

    fn context(params: SimulationParams) -> SimulationContext {
        SimulationContext::new(params, 2, &[(PORT, TransportKind::Stream)]).unwrap()
    }

    #[test]
    fn test_clock_reads_tick_from_zero_when_model_checking() {
        let mut ctx = context(SimulationParams::model_check());
        let mut api = ctx.node_api(0, 0);
        assert_eq!(api.now().unwrap(), 0);
        assert_eq!(api.now().unwrap(), 1);
    }

    #[test]
    fn test_clock_reads_can_be_disabled() {
        let mut params = SimulationParams::model_check();
        params.allow_timeu = false;
        let mut ctx = context(params);
        let mut api = ctx.node_api(0, 0);
        assert_eq!(api.now(), Err(ServiceError::ClockDisallowed));
    }

    #[test]
    fn test_unknown_port_and_node_are_service_errors() {
        let mut ctx = context(SimulationParams::model_check());
        let mut api = ctx.node_api(0, 0);
        assert_eq!(
            api.route(1, 1, HandlerId(0), "x"),
            Err(ServiceError::UnknownPort(1))
        );
        assert_eq!(
            api.route(PORT, 5, HandlerId(0), "x"),
            Err(ServiceError::InvalidNode(5))
        );
        assert!(api.take_fault().is_none());
    }

    #[test]
    fn test_route_rts_registers_request_when_full() {
        let mut params = SimulationParams::model_check();
        params.queue_size = 1;
        let mut ctx = context(params);
        let mut api = ctx.node_api(0, 0);
        assert!(api.route_rts(PORT, 1, HandlerId(3), "a").unwrap());
        assert!(!api.can_send(PORT, 1));
        assert!(!api.route_rts(PORT, 1, HandlerId(3), "b").unwrap());
        assert_eq!(api.queued_bytes(PORT), 1);
        drop(api);
        // One delivery event; the CTS waits for room.
        assert_eq!(ctx.events.len(), 1);
    }

    #[test]
    fn test_reset_path_clears_everything() {
        let mut ctx = context(SimulationParams::model_check());
        {
            let mut api = ctx.node_api(0, 0);
            api.route(PORT, 1, HandlerId(0), "x").unwrap();
            api.schedule(TimerId(1), 10);
            api.now().unwrap();
        }
        assert_eq!(ctx.events.len(), 2);
        ctx.reset_path();
        assert!(ctx.events.is_empty());
        assert_eq!(ctx.clock.now(0), 0);
        assert_eq!(ctx.network.transport(0, PORT).unwrap().queue_len(1), 0);
    }
}
