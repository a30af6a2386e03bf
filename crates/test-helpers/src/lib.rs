//! Scripted services for pathcheck integration tests.
//!
//! A [`ScriptedService`] runs a fixed list of [`Action`]s at start-up, on
//! delivery and when a timer fires, and records every upcall it receives as
//! an [`Observed`] entry. Tests assert on those records through the
//! property views or the run summary.

use pathcheck_core::{
    NodeApi, NodeService, ServiceError, ServiceResult, TransportErrorKind,
};
use pathcheck_simulation::{
    CheckedService, LivenessProperty, LoadedTest, SafetyProperty, SimulationError,
    SimulationParams, SystemView, TransportKind,
};
use pathcheck_types::{HandlerId, NodeIndex, Port, TimerId};
use std::any::Any;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::trace;

/// Port every scripted service binds.
pub const TEST_PORT: Port = 5377;

/// Handler every scripted service registers and sends with.
pub const TEST_HANDLER: HandlerId = HandlerId(1);

/// One step of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// `route` a payload to `dest`.
    Send { dest: NodeIndex, payload: String },
    /// `route_rts` a payload to `dest`.
    SendRts { dest: NodeIndex, payload: String },
    Schedule { timer: TimerId, delay: u64 },
    Cancel(TimerId),
    RequestFlushed,
    /// `rand_int(max)`, recording the value.
    Choose(u64),
    /// Read the clock, recording the value.
    ReadClock,
    /// Fail the upcall.
    Fail(String),
    /// Never return from the upcall.
    Hang,
}

impl Action {
    pub fn send(dest: NodeIndex, payload: impl Into<String>) -> Self {
        Action::Send {
            dest,
            payload: payload.into(),
        }
    }

    pub fn send_rts(dest: NodeIndex, payload: impl Into<String>) -> Self {
        Action::SendRts {
            dest,
            payload: payload.into(),
        }
    }

    pub fn schedule(timer: u64, delay: u64) -> Self {
        Action::Schedule {
            timer: TimerId(timer),
            delay,
        }
    }
}

/// An upcall or API result seen by a scripted service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Delivered { from: NodeIndex, payload: String },
    Timer(TimerId),
    TransportError { peer: NodeIndex, kind: TransportErrorKind },
    MessageError { peer: NodeIndex, payload: String },
    ClearToSend { peer: NodeIndex },
    Flushed,
    Rejected { dest: NodeIndex },
    Chose(u64),
    Clock(u64),
}

/// What a scripted service does.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub on_init: Vec<Action>,
    pub on_deliver: Vec<Action>,
    pub on_timer: Vec<Action>,
    pub on_clear_to_send: Vec<Action>,
    /// Deliveries that trigger `on_deliver`; later ones are only recorded.
    pub replies: usize,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_init(mut self, action: Action) -> Self {
        self.on_init.push(action);
        self
    }

    /// Run `action` on each of the first `replies` deliveries.
    pub fn on_deliver(mut self, action: Action, replies: usize) -> Self {
        self.on_deliver.push(action);
        self.replies = replies;
        self
    }

    pub fn on_timer(mut self, action: Action) -> Self {
        self.on_timer.push(action);
        self
    }

    pub fn on_clear_to_send(mut self, action: Action) -> Self {
        self.on_clear_to_send.push(action);
        self
    }
}

/// A service that plays a [`Script`].
#[derive(Debug, Clone)]
pub struct ScriptedService {
    script: Script,
    observed: Vec<Observed>,
    deliveries: usize,
}

impl ScriptedService {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            observed: Vec::new(),
            deliveries: 0,
        }
    }

    pub fn observed(&self) -> &[Observed] {
        &self.observed
    }

    pub fn deliveries(&self) -> usize {
        self.deliveries
    }

    fn play(&mut self, api: &mut dyn NodeApi, actions: &[Action]) -> ServiceResult {
        for action in actions {
            trace!(node = api.node(), ?action, "script action");
            match action {
                Action::Send { dest, payload } => {
                    if !api.route(TEST_PORT, *dest, TEST_HANDLER, payload)? {
                        self.observed.push(Observed::Rejected { dest: *dest });
                    }
                }
                Action::SendRts { dest, payload } => {
                    if !api.route_rts(TEST_PORT, *dest, TEST_HANDLER, payload)? {
                        self.observed.push(Observed::Rejected { dest: *dest });
                    }
                }
                Action::Schedule { timer, delay } => {
                    api.schedule(*timer, *delay);
                }
                Action::Cancel(timer) => {
                    api.cancel(*timer);
                }
                Action::RequestFlushed => api.request_flushed(TEST_PORT, TEST_HANDLER)?,
                Action::Choose(max) => {
                    let value = api.rand_int(*max)?;
                    self.observed.push(Observed::Chose(value));
                }
                Action::ReadClock => {
                    let now = api.now()?;
                    self.observed.push(Observed::Clock(now));
                }
                Action::Fail(reason) => return Err(ServiceError::protocol(reason.clone())),
                Action::Hang => loop {
                    thread::sleep(Duration::from_millis(50));
                },
            }
        }
        Ok(())
    }
}

impl NodeService for ScriptedService {
    fn name(&self) -> &str {
        "scripted"
    }

    fn init(&mut self, api: &mut dyn NodeApi) -> ServiceResult {
        api.register_handler(TEST_PORT, TEST_HANDLER)?;
        let actions = self.script.on_init.clone();
        self.play(api, &actions)
    }

    fn reset(&mut self) {
        self.observed.clear();
        self.deliveries = 0;
    }

    fn deliver(
        &mut self,
        api: &mut dyn NodeApi,
        _port: Port,
        from: NodeIndex,
        _handler: HandlerId,
        payload: &str,
    ) -> ServiceResult {
        self.deliveries += 1;
        self.observed.push(Observed::Delivered {
            from,
            payload: payload.to_string(),
        });
        if self.deliveries <= self.script.replies {
            let actions = self.script.on_deliver.clone();
            self.play(api, &actions)?;
        }
        Ok(())
    }

    fn timer_fired(&mut self, api: &mut dyn NodeApi, timer: TimerId) -> ServiceResult {
        self.observed.push(Observed::Timer(timer));
        let actions = self.script.on_timer.clone();
        self.play(api, &actions)
    }

    fn transport_error(
        &mut self,
        _api: &mut dyn NodeApi,
        _port: Port,
        peer: NodeIndex,
        kind: TransportErrorKind,
    ) -> ServiceResult {
        self.observed.push(Observed::TransportError { peer, kind });
        Ok(())
    }

    fn message_error(
        &mut self,
        _api: &mut dyn NodeApi,
        _port: Port,
        peer: NodeIndex,
        _kind: TransportErrorKind,
        _handler: HandlerId,
        payload: &str,
    ) -> ServiceResult {
        self.observed.push(Observed::MessageError {
            peer,
            payload: payload.to_string(),
        });
        Ok(())
    }

    fn clear_to_send(
        &mut self,
        api: &mut dyn NodeApi,
        _port: Port,
        peer: NodeIndex,
        _handler: HandlerId,
    ) -> ServiceResult {
        self.observed.push(Observed::ClearToSend { peer });
        let actions = self.script.on_clear_to_send.clone();
        self.play(api, &actions)
    }

    fn flushed(&mut self, _api: &mut dyn NodeApi, _port: Port, _handler: HandlerId) -> ServiceResult {
        self.observed.push(Observed::Flushed);
        Ok(())
    }

    fn state_string(&self) -> String {
        format!("{:?}", self.observed)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─── Properties ───

fn total_deliveries(view: &SystemView<'_>) -> usize {
    view.services_of::<ScriptedService>()
        .map(ScriptedService::deliveries)
        .sum()
}

/// Live once the cluster has delivered at least this many messages.
#[derive(Debug, Clone, Copy)]
pub struct DeliveriesAtLeast(pub usize);

impl LivenessProperty for DeliveriesAtLeast {
    fn name(&self) -> &str {
        "deliveries at least"
    }

    fn is_live(&self, view: &SystemView<'_>) -> bool {
        total_deliveries(view) >= self.0
    }
}

/// Violated once the cluster has delivered more than this many messages.
#[derive(Debug, Clone, Copy)]
pub struct DeliveriesAtMost(pub usize);

impl SafetyProperty for DeliveriesAtMost {
    fn name(&self) -> &str {
        "deliveries at most"
    }

    fn check(&self, view: &SystemView<'_>) -> Result<(), String> {
        let total = total_deliveries(view);
        if total > self.0 {
            Err(format!("{total} deliveries, at most {} allowed", self.0))
        } else {
            Ok(())
        }
    }
}

// ─── Test provider ───

type ScriptFn = dyn Fn(NodeIndex, u32) -> Script + Send + Sync;

/// A [`CheckedService`] of scripted services, one script per node.
#[derive(Clone)]
pub struct ScriptedTest {
    name: String,
    kind: TransportKind,
    scripts: Arc<ScriptFn>,
    at_least: Option<usize>,
    at_most: Option<usize>,
}

impl ScriptedTest {
    /// `scripts(node, node_count)` gives each node's script.
    pub fn new<F>(name: impl Into<String>, scripts: F) -> Self
    where
        F: Fn(NodeIndex, u32) -> Script + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kind: TransportKind::Stream,
            scripts: Arc::new(scripts),
            at_least: None,
            at_most: None,
        }
    }

    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Paths are live once `count` messages were delivered.
    pub fn live_after(mut self, count: usize) -> Self {
        self.at_least = Some(count);
        self
    }

    /// More than `count` deliveries is a safety violation.
    pub fn at_most(mut self, count: usize) -> Self {
        self.at_most = Some(count);
        self
    }

    pub fn into_arc(self) -> Arc<dyn CheckedService> {
        Arc::new(self)
    }
}

impl CheckedService for ScriptedTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted services"
    }

    fn load_test(
        &self,
        node_count: u32,
        _params: &SimulationParams,
    ) -> Result<LoadedTest, SimulationError> {
        let services = (0..node_count)
            .map(|node| {
                Box::new(ScriptedService::new((self.scripts)(node, node_count)))
                    as Box<dyn NodeService>
            })
            .collect();
        let mut test = LoadedTest::new(services).with_binding(TEST_PORT, self.kind);
        if let Some(count) = self.at_least {
            test = test.with_liveness(DeliveriesAtLeast(count));
        }
        if let Some(count) = self.at_most {
            test = test.with_safety(DeliveriesAtMost(count));
        }
        Ok(test)
    }
}

/// Node 0 sends `count` messages to node 1 at start-up.
pub fn one_way(count: usize) -> ScriptedTest {
    ScriptedTest::new("one-way", move |node, _| {
        let mut script = Script::new();
        if node == 0 {
            for i in 0..count {
                script = script.on_init(Action::send(1, format!("m{i}")));
            }
        }
        script
    })
    .live_after(count)
}

/// Node 0 pings node 1, which answers each of the first `rounds` pings.
pub fn ping_pong(rounds: usize) -> ScriptedTest {
    ScriptedTest::new("ping-pong", move |node, _| match node {
        0 => Script::new()
            .on_init(Action::send(1, "ping"))
            .on_deliver(Action::send(1, "ping"), rounds.saturating_sub(1)),
        1 => Script::new().on_deliver(Action::send(0, "pong"), rounds),
        _ => Script::new(),
    })
    .live_after(2 * rounds)
}

/// Every node greets every other node at start-up. With `choose`, each
/// node also draws `rand_int(3)` on its first delivery.
pub fn gossip(nodes: u32, choose: bool) -> ScriptedTest {
    ScriptedTest::new("gossip", move |node, count| {
        let mut script = Script::new();
        for dest in (0..count).filter(|d| *d != node) {
            script = script.on_init(Action::send(dest, format!("hello from {node}")));
        }
        if choose {
            script = script.on_deliver(Action::Choose(3), 1);
        }
        script
    })
    .live_after((nodes * nodes.saturating_sub(1)) as usize)
}
