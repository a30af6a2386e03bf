//! Ring ping: node `i` pings node `i + 1` on a timer until it hears a pong.

use pathcheck_core::{NodeApi, NodeService, ServiceError, ServiceResult, TransportErrorKind};
use pathcheck_simulation::{
    LivenessProperty, LoadedTest, SafetyProperty, SimulationError, SimulationParams, SystemView,
    TransportKind,
};
use pathcheck_types::{HandlerId, NodeIndex, Port, TimerId};
use std::any::Any;
use tracing::{debug, trace};

const HANDLER: HandlerId = HandlerId(1);
const PING_TIMER: TimerId = TimerId(1);

/// Microseconds between pings.
pub const PING_INTERVAL: u64 = 1_000_000;

#[derive(Debug, Clone)]
pub struct PingService {
    port: Port,
    sent: u64,
    pongs: u64,
    answered: u64,
}

impl PingService {
    pub fn new(port: Port) -> Self {
        Self {
            port,
            sent: 0,
            pongs: 0,
            answered: 0,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn pongs(&self) -> u64 {
        self.pongs
    }

    fn successor(api: &dyn NodeApi) -> NodeIndex {
        (api.node() + 1) % api.node_count()
    }
}

impl NodeService for PingService {
    fn name(&self) -> &str {
        "ping"
    }

    fn init(&mut self, api: &mut dyn NodeApi) -> ServiceResult {
        api.register_handler(self.port, HANDLER)?;
        api.schedule(PING_TIMER, PING_INTERVAL);
        Ok(())
    }

    fn reset(&mut self) {
        *self = Self::new(self.port);
    }

    fn deliver(
        &mut self,
        api: &mut dyn NodeApi,
        port: Port,
        from: NodeIndex,
        handler: HandlerId,
        payload: &str,
    ) -> ServiceResult {
        match payload.split_once(' ') {
            Some(("ping", seq)) => {
                self.answered += 1;
                api.route(port, from, handler, &format!("pong {seq}"))?;
            }
            Some(("pong", _)) => {
                self.pongs += 1;
                if self.pongs == 1 {
                    api.cancel(PING_TIMER);
                }
            }
            _ => {
                return Err(ServiceError::protocol(format!(
                    "unexpected payload {payload:?} from {from}"
                )))
            }
        }
        Ok(())
    }

    fn timer_fired(&mut self, api: &mut dyn NodeApi, timer: TimerId) -> ServiceResult {
        if timer != PING_TIMER || self.pongs > 0 {
            return Ok(());
        }
        let dest = Self::successor(api);
        if api.route(self.port, dest, HANDLER, &format!("ping {}", self.sent))? {
            self.sent += 1;
        } else {
            trace!(node = api.node(), dest, "ping queue full");
        }
        api.schedule(PING_TIMER, PING_INTERVAL);
        Ok(())
    }

    fn transport_error(
        &mut self,
        api: &mut dyn NodeApi,
        _port: Port,
        peer: NodeIndex,
        kind: TransportErrorKind,
    ) -> ServiceResult {
        debug!(node = api.node(), peer, %kind, "ping link failed");
        Ok(())
    }

    fn state_string(&self) -> String {
        format!(
            "sent={} pongs={} answered={}",
            self.sent, self.pongs, self.answered
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// No node hears more pongs than it sent pings.
pub struct PongsMatchPings;

impl SafetyProperty for PongsMatchPings {
    fn name(&self) -> &str {
        "pongs match pings"
    }

    fn check(&self, view: &SystemView<'_>) -> Result<(), String> {
        for node in 0..view.node_count() {
            if let Some(s) = view.service::<PingService>(node) {
                if s.pongs > s.sent {
                    return Err(format!(
                        "node {node} got {} pongs for {} pings",
                        s.pongs, s.sent
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Every node has heard at least one pong.
pub struct EveryNodeAnswered;

impl LivenessProperty for EveryNodeAnswered {
    fn name(&self) -> &str {
        "every node answered"
    }

    fn is_live(&self, view: &SystemView<'_>) -> bool {
        view.services_of::<PingService>().all(|s| s.pongs > 0)
    }
}

/// Build the ping test on the default port.
pub fn load_ping(node_count: u32, params: &SimulationParams) -> Result<LoadedTest, SimulationError> {
    if node_count < 2 {
        return Err(SimulationError::InvalidParams(
            "ping needs at least two nodes".into(),
        ));
    }
    let services = (0..node_count)
        .map(|_| Box::new(PingService::new(params.base_port)) as Box<dyn NodeService>)
        .collect();
    Ok(LoadedTest::new(services)
        .with_binding(params.base_port, TransportKind::Stream)
        .with_safety(PongsMatchPings)
        .with_liveness(EveryNodeAnswered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathcheck_simulation::{ChoiceStrategy, SimulationRunner};
    use std::sync::Arc;

    fn run(params: SimulationParams, nodes: u32) -> pathcheck_simulation::RunSummary {
        let dir = tempfile::tempdir().unwrap();
        let params = params
            .with_divergence_monitor(false)
            .with_output_path(format!("{}/", dir.path().display()));
        let test = Arc::new(pathcheck_simulation::FnService::new("ping", load_ping));
        SimulationRunner::new(params, test, nodes).unwrap().run().unwrap()
    }

    #[test]
    fn test_random_walks_reach_liveness() {
        let params = SimulationParams::model_check()
            .with_strategy(ChoiceStrategy::Random)
            .with_preinitialized(vec![-1])
            .with_max_paths(20);
        let summary = run(params, 3);
        assert_eq!(summary.totals.live_paths, 20);
    }

    #[test]
    fn test_timed_ring() {
        let params = SimulationParams::timed().with_max_paths(5);
        let summary = run(params, 4);
        assert_eq!(summary.totals.live_paths, 5);
        let last = summary.last_path.unwrap();
        assert!(last.time.min >= PING_INTERVAL);
    }

    #[test]
    fn test_single_node_rejected() {
        assert!(matches!(
            load_ping(1, &SimulationParams::default()),
            Err(SimulationError::InvalidParams(_))
        ));
    }
}
