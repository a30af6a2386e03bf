//! Per-node lifecycle: start-up, injected crashes and reincarnation.
//!
//! ```text
//!   NotStarted ──init──► Running ──reset──► Crashed ──init──► Running ...
//! ```
//!
//! The lifecycle manager owns the service instances and is the only
//! component that calls into them. Every upcall gets a fresh
//! [`NodeContext`](crate::NodeContext) bound to the node it is made for.

use crate::transport::Upcall;
use crate::{SimulationContext, SimulationError};
use pathcheck_core::{AppEventKind, Event, EventKind, NodeApi, NodeService, ServiceResult};
use pathcheck_types::NodeIndex;
use tracing::{debug, info};

/// Where a node is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    NotStarted,
    Running,
    Crashed,
}

/// Lifecycle record of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandler {
    pub node: NodeIndex,
    /// Crashes survived on this path.
    pub incarnation: u32,
    pub started: bool,
}

impl NodeHandler {
    pub fn new(node: NodeIndex) -> Self {
        Self {
            node,
            incarnation: 0,
            started: false,
        }
    }

    pub fn status(&self) -> NodeStatus {
        match (self.started, self.incarnation) {
            (true, _) => NodeStatus::Running,
            (false, 0) => NodeStatus::NotStarted,
            (false, _) => NodeStatus::Crashed,
        }
    }
}

fn is_reset_event(e: &Event) -> bool {
    e.kind == EventKind::Application(AppEventKind::Reset)
}

/// Owner of every node's service and lifecycle record.
pub struct Lifecycle {
    handlers: Vec<NodeHandler>,
    services: Vec<Box<dyn NodeService>>,
    /// Crashes executed on this path.
    crashes: u64,
}

impl Lifecycle {
    /// One handler per service, node indices in order.
    pub fn new(services: Vec<Box<dyn NodeService>>) -> Self {
        let handlers = (0..services.len() as NodeIndex).map(NodeHandler::new).collect();
        Self {
            handlers,
            services,
            crashes: 0,
        }
    }

    pub fn node_count(&self) -> u32 {
        self.services.len() as u32
    }

    pub fn handler(&self, node: NodeIndex) -> Option<&NodeHandler> {
        self.handlers.get(node as usize)
    }

    pub fn services(&self) -> &[Box<dyn NodeService>] {
        &self.services
    }

    /// Crashes executed on this path.
    pub fn crashes(&self) -> u64 {
        self.crashes
    }

    /// Canonical state of `node`'s service for hashing.
    pub fn state_string(&self, node: NodeIndex) -> String {
        match (self.handlers.get(node as usize), self.services.get(node as usize)) {
            (Some(h), Some(s)) => format!(
                "[{}#{} inc={} started={} {}]",
                s.name(),
                node,
                h.incarnation,
                h.started,
                s.state_string()
            ),
            _ => String::new(),
        }
    }

    fn handler_mut(&mut self, node: NodeIndex) -> Result<&mut NodeHandler, SimulationError> {
        self.handlers
            .get_mut(node as usize)
            .ok_or(SimulationError::InvalidNode(node))
    }

    /// Run one upcall on `node`'s service.
    fn call<F>(&mut self, ctx: &mut SimulationContext, node: NodeIndex, f: F) -> Result<(), SimulationError>
    where
        F: FnOnce(&mut dyn NodeService, &mut dyn NodeApi) -> ServiceResult,
    {
        let incarnation = self.handler_mut(node)?.incarnation;
        let service = self
            .services
            .get_mut(node as usize)
            .ok_or(SimulationError::InvalidNode(node))?;
        let mut api = ctx.node_api(node, incarnation);
        let result = f(service.as_mut(), &mut api);
        if let Some(fault) = api.take_fault() {
            return Err(fault);
        }
        result.map_err(|source| SimulationError::ServiceFault { node, source })
    }

    // ─── Start-up ───

    /// Start pre-initialized nodes now and queue a start-up event for the
    /// rest.
    pub fn init_nodes(&mut self, ctx: &mut SimulationContext) -> Result<(), SimulationError> {
        let preinit = ctx.params.nodes_to_preinitialize.clone();
        let all = preinit.first().map(|n| *n < 0).unwrap_or(false);
        for node in 0..self.node_count() {
            if all || preinit.contains(&(node as i64)) {
                debug!(node, "pre-initializing");
                self.start(ctx, node)?;
            } else {
                Self::queue_init(ctx, node, 0);
            }
        }
        Ok(())
    }

    fn queue_init(ctx: &mut SimulationContext, node: NodeIndex, offset: u64) {
        let key = if ctx.params.mode == crate::SimulationMode::Timed {
            ctx.events.next_free_key(ctx.clock.now(node) + offset)
        } else {
            ctx.params.application_event_weight
        };
        ctx.events.add(key, Event::init(node));
    }

    fn start(&mut self, ctx: &mut SimulationContext, node: NodeIndex) -> Result<(), SimulationError> {
        self.call(ctx, node, |s, api| s.init(api))?;
        self.handler_mut(node)?.started = true;
        self.maybe_queue_failure(ctx, node);
        Ok(())
    }

    // ─── Failures ───

    fn failure_budget_left(&self, ctx: &SimulationContext) -> bool {
        let budget = ctx.params.sim_num_failures;
        budget < 0 || self.crashes < budget as u64
    }

    /// Queue a crash of `node` if it may fail and the budget allows.
    fn maybe_queue_failure(&mut self, ctx: &mut SimulationContext, node: NodeIndex) {
        let eligible =
            ctx.params.sim_fail_nodes.is_empty() || ctx.params.sim_fail_nodes.contains(&node);
        if !eligible || !self.failure_budget_left(ctx) {
            return;
        }
        if ctx.events.any(|_, e| e.node == node && is_reset_event(e)) {
            return;
        }
        let key = if ctx.params.mode == crate::SimulationMode::Timed {
            ctx.events
                .next_free_key(ctx.clock.now(node) + ctx.params.failure_delay)
        } else {
            ctx.params.event_failure_weight
        };
        debug!(node, key, "queueing node failure");
        ctx.events.add(key, Event::reset(node));
    }

    /// Crash `node` and bring up its next incarnation.
    fn reincarnate(&mut self, ctx: &mut SimulationContext, node: NodeIndex) -> Result<(), SimulationError> {
        {
            let (mut env, network, timers) = ctx.parts();
            network.reset_node(&mut env, node)?;
            timers.cancel_all(&mut env, node);
        }
        self.services
            .get_mut(node as usize)
            .ok_or(SimulationError::InvalidNode(node))?
            .reset();
        let handler = self.handler_mut(node)?;
        handler.incarnation += 1;
        handler.started = false;
        let incarnation = handler.incarnation;
        self.crashes += 1;
        info!(node, incarnation, crashes = self.crashes, "node reset");

        Self::queue_init(ctx, node, 1);
        if !self.failure_budget_left(ctx) {
            let purged = ctx.events.remove_all(is_reset_event);
            if purged > 0 {
                debug!(purged, "failure budget spent, purging queued failures");
            }
        }
        Ok(())
    }

    // ─── Event execution ───

    /// Execute a popped event and return its step description.
    pub fn simulate(&mut self, ctx: &mut SimulationContext, event: &Event) -> Result<String, SimulationError> {
        let node = event.node;
        match event.kind {
            EventKind::Application(AppEventKind::Init) => {
                let handler = *self.handler_mut(node)?;
                if handler.started {
                    return Err(SimulationError::InvariantViolation(format!(
                        "init event for running node {node}"
                    )));
                }
                self.start(ctx, node)?;
                Ok(format!("init node {node} incarnation {}", handler.incarnation))
            }
            EventKind::Application(AppEventKind::Reset) => {
                if !self.handler_mut(node)?.started {
                    return Err(SimulationError::InvariantViolation(format!(
                        "reset event for node {node} which is not running"
                    )));
                }
                self.reincarnate(ctx, node)?;
                Ok(format!("reset node {node}"))
            }
            EventKind::Timer(timer) => {
                ctx.timers.fired(node, timer);
                self.call(ctx, node, |s, api| s.timer_fired(api, timer))?;
                Ok(format!("{timer} fired on {node}"))
            }
            EventKind::Network(_) => {
                let (description, upcalls) = {
                    let (mut env, network, _) = ctx.parts();
                    network.simulate(&mut env, event)?
                };
                self.dispatch(ctx, upcalls)?;
                Ok(description)
            }
        }
    }

    /// Hand transport upcalls to their services, in order.
    pub fn dispatch(&mut self, ctx: &mut SimulationContext, upcalls: Vec<Upcall>) -> Result<(), SimulationError> {
        for upcall in upcalls {
            let node = upcall.node();
            if !self.handler_mut(node)?.started {
                debug!(node, ?upcall, "upcall to a stopped node dropped");
                continue;
            }
            match upcall {
                Upcall::Deliver {
                    port,
                    from,
                    handler,
                    payload,
                    ..
                } => self.call(ctx, node, |s, api| s.deliver(api, port, from, handler, &payload))?,
                Upcall::TransportError { port, peer, kind, .. } => {
                    self.call(ctx, node, |s, api| s.transport_error(api, port, peer, kind))?
                }
                Upcall::MessageError {
                    port,
                    peer,
                    kind,
                    handler,
                    payload,
                    ..
                } => self.call(ctx, node, |s, api| {
                    s.message_error(api, port, peer, kind, handler, &payload)
                })?,
                Upcall::ClearToSend {
                    port, peer, handler, ..
                } => self.call(ctx, node, |s, api| s.clear_to_send(api, port, peer, handler))?,
                Upcall::Flushed { port, handler, .. } => {
                    self.call(ctx, node, |s, api| s.flushed(api, port, handler))?
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;
    use crate::SimulationParams;
    use pathcheck_core::ServiceError;
    use pathcheck_types::{HandlerId, Port, TimerId};
    use std::any::Any;

    const PORT: Port = 5377;

    #[derive(Default)]
    struct Counter {
        inits: u32,
        resets: u32,
        fail_init: bool,
    }

    impl NodeService for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn init(&mut self, api: &mut dyn NodeApi) -> ServiceResult {
            if self.fail_init {
                return Err(ServiceError::protocol("boom"));
            }
            self.inits += 1;
            api.register_handler(PORT, HandlerId(0))?;
            api.schedule(TimerId(1), 100);
            Ok(())
        }

        fn reset(&mut self) {
            self.resets += 1;
        }

        fn deliver(&mut self, _: &mut dyn NodeApi, _: Port, _: NodeIndex, _: HandlerId, _: &str) -> ServiceResult {
            Ok(())
        }

        fn timer_fired(&mut self, _: &mut dyn NodeApi, _: TimerId) -> ServiceResult {
            Ok(())
        }

        fn state_string(&self) -> String {
            format!("inits={}", self.inits)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn setup(params: SimulationParams, nodes: u32) -> (SimulationContext, Lifecycle) {
        let ctx = SimulationContext::new(params, nodes, &[(PORT, TransportKind::Stream)]).unwrap();
        let services = (0..nodes)
            .map(|_| Box::new(Counter::default()) as Box<dyn NodeService>)
            .collect();
        (ctx, Lifecycle::new(services))
    }

    fn counter(lc: &Lifecycle, node: usize) -> &Counter {
        lc.services()[node].as_any().downcast_ref::<Counter>().unwrap()
    }

    #[test]
    fn test_init_events_and_preinitialization() {
        let params = SimulationParams::model_check().with_preinitialized(vec![1]);
        let (mut ctx, mut lc) = setup(params, 3);
        lc.init_nodes(&mut ctx).unwrap();
        assert_eq!(lc.handler(1).unwrap().status(), NodeStatus::Running);
        assert_eq!(lc.handler(0).unwrap().status(), NodeStatus::NotStarted);
        let inits = ctx
            .events
            .iter()
            .filter(|(k, e)| *k == 40 && e.kind == EventKind::Application(AppEventKind::Init))
            .count();
        assert_eq!(inits, 2);
        assert!(ctx.network.transport(1, PORT).unwrap().is_listening());
    }

    #[test]
    fn test_reset_reincarnates_and_respects_budget() {
        let params = SimulationParams::model_check()
            .with_preinitialized(vec![-1])
            .with_failures(1, vec![]);
        let (mut ctx, mut lc) = setup(params, 2);
        lc.init_nodes(&mut ctx).unwrap();
        let resets = ctx.events.iter().filter(|(_, e)| is_reset_event(e)).count();
        assert_eq!(resets, 2);

        let reset = Event::reset(0);
        ctx.events.remove_first(|e| *e == reset);
        lc.simulate(&mut ctx, &reset).unwrap();
        assert_eq!(lc.handler(0).unwrap().incarnation, 1);
        assert_eq!(lc.handler(0).unwrap().status(), NodeStatus::Crashed);
        assert_eq!(counter(&lc, 0).resets, 1);
        assert_eq!(lc.crashes(), 1);

        // Budget spent: node 1's crash is purged, node 0's timers are gone.
        assert!(!ctx.events.any(|_, e| is_reset_event(e)));
        assert!(!ctx.timers.is_pending(0, TimerId(1)));
        assert!(ctx.timers.is_pending(1, TimerId(1)));

        // Restart does not queue another crash.
        let init = Event::init(0);
        ctx.events.remove_first(|e| *e == init);
        lc.simulate(&mut ctx, &init).unwrap();
        assert_eq!(counter(&lc, 0).inits, 2);
        assert!(!ctx.events.any(|_, e| is_reset_event(e)));
    }

    #[test]
    fn test_reset_of_stopped_node_is_rejected() {
        let (mut ctx, mut lc) = setup(SimulationParams::model_check(), 1);
        let err = lc.simulate(&mut ctx, &Event::reset(0)).unwrap_err();
        assert!(matches!(err, SimulationError::InvariantViolation(_)));
    }

    #[test]
    fn test_service_error_becomes_fault() {
        let mut ctx =
            SimulationContext::new(SimulationParams::model_check(), 1, &[(PORT, TransportKind::Stream)])
                .unwrap();
        let failing: Box<dyn NodeService> = Box::new(Counter {
            fail_init: true,
            ..Counter::default()
        });
        let mut lc = Lifecycle::new(vec![failing]);
        let err = lc.simulate(&mut ctx, &Event::init(0)).unwrap_err();
        assert!(matches!(err, SimulationError::ServiceFault { node: 0, .. }));
    }
}
