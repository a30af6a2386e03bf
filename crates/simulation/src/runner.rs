//! The path driver.
//!
//! One run explores paths until the path budget is spent or the choice
//! path reports no further paths. Every path:
//!
//! ```text
//!   reload services ─► init nodes ─► ┌─► pop event ─► simulate ─► check ─┐
//!                                    └──────────── continue ◄────────────┘
//!                                                     │
//!        DUPLICATE_STATE | STOPPING_CONDITION | NO_MORE_EVENTS | TOO_MANY_STEPS
//!                                                     │
//!                      record statistics ─► reset context ─► next path
//! ```
//!
//! Failures that must be reproducible (safety violations, service faults,
//! divergence, dead-path overflow, too-long paths, step-ceiling errors)
//! write the path's choices to an error path file before the run halts.

use crate::lifecycle::Lifecycle;
use crate::monitor::DivergenceMonitor;
use crate::properties::{LivenessProperty, SafetyProperty, SystemView};
use crate::registry::{self, CheckedService, TestRegistry};
use crate::selector::{selector_for, EventSelector};
use crate::state_hash::{combined_state_hash, Visit, VisitedStateSet};
use crate::stats::{PathCounters, PathEndCause, PathStatistics};
use crate::transport::TransportKind;
use crate::{
    Choice, LatencyDistributions, SimulationContext, SimulationError, SimulationMode,
    SimulationParams, TimeStats, DEFAULT_PROCESSING_TIME,
};
use pathcheck_core::Event;
use pathcheck_types::{Port, StateHash};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How one path ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathReport {
    pub cause: PathEndCause,
    pub steps: u64,
    pub live: bool,
    /// Combined state hash after the last step.
    pub state_hash: StateHash,
    /// Node clocks at the end of the path, relative to their start.
    pub time: TimeStats,
    /// Every choice made on the path.
    pub choices: Vec<Choice>,
    /// Step descriptions, when tracing is enabled.
    pub trace: Vec<String>,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub totals: PathCounters,
    /// Distinct states in the visited set.
    pub visited_states: usize,
    pub dead_paths: u64,
    pub error_paths: Vec<PathBuf>,
    pub outlier_paths: Vec<PathBuf>,
    pub prefix_paths: Vec<PathBuf>,
    pub last_path: Option<PathReport>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.totals)?;
        write!(
            f,
            "visited={} dead={} error_paths={} outliers={}",
            self.visited_states,
            self.dead_paths,
            self.error_paths.len(),
            self.outlier_paths.len()
        )
    }
}

/// Drives one test through many paths.
pub struct SimulationRunner {
    ctx: SimulationContext,
    selector: Box<dyn EventSelector>,
    test: Arc<dyn CheckedService>,
    bindings: Vec<(Port, TransportKind)>,
    lifecycle: Lifecycle,
    safety: Vec<Box<dyn SafetyProperty>>,
    liveness: Vec<Box<dyn LivenessProperty>>,
    visited: VisitedStateSet,
    stats: PathStatistics,
    distributions: LatencyDistributions,
    monitor: Option<DivergenceMonitor>,
    record_trace: bool,
    trace: Vec<String>,
    dead_paths: u64,
    error_paths: Vec<PathBuf>,
    outlier_paths: Vec<PathBuf>,
    prefix_paths: Vec<PathBuf>,
    last_path: Option<PathReport>,
}

impl SimulationRunner {
    /// Prepare a run of `test` on `node_count` nodes.
    pub fn new(
        params: SimulationParams,
        test: Arc<dyn CheckedService>,
        node_count: u32,
    ) -> Result<Self, SimulationError> {
        if node_count == 0 {
            return Err(SimulationError::InvalidParams(
                "at least one node is required".into(),
            ));
        }
        let params = params.effective()?;
        let loaded = registry::load(test.as_ref(), node_count, &params)?;
        let distributions =
            LatencyDistributions::from_file(params.latency_distribution_file.as_deref())?;
        let ctx = SimulationContext::new(params, node_count, &loaded.bindings)?;
        let stats = PathStatistics::new(ctx.choices.phase())?;
        Ok(Self {
            selector: selector_for(ctx.params.mode),
            bindings: loaded.bindings,
            lifecycle: Lifecycle::new(loaded.services),
            safety: loaded.safety,
            liveness: loaded.liveness,
            visited: VisitedStateSet::new(),
            stats,
            distributions,
            monitor: None,
            record_trace: false,
            trace: Vec::new(),
            dead_paths: 0,
            error_paths: Vec::new(),
            outlier_paths: Vec::new(),
            prefix_paths: Vec::new(),
            last_path: None,
            test,
            ctx,
        })
    }

    /// Prepare a run of the test registered as `name`.
    pub fn from_registry(
        params: SimulationParams,
        registry: &TestRegistry,
        name: &str,
        node_count: u32,
    ) -> Result<Self, SimulationError> {
        Self::new(params, registry.get(name)?, node_count)
    }

    /// Keep the step descriptions of the last path in its report.
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.record_trace = enabled;
        self
    }

    pub fn params(&self) -> &SimulationParams {
        &self.ctx.params
    }

    pub fn stats(&self) -> &PathStatistics {
        &self.stats
    }

    /// Explore paths until the budget or the search is exhausted.
    pub fn run(&mut self) -> Result<RunSummary, SimulationError> {
        info!(
            test = self.test.name(),
            nodes = self.ctx.node_count(),
            mode = ?self.ctx.params.mode,
            strategy = ?self.ctx.params.choice_strategy,
            seed = self.ctx.params.seed,
            selector = self.selector.name(),
            "Starting simulation"
        );
        if self.ctx.params.run_divergence_monitor {
            let period = self.ctx.params.divergence_period();
            self.monitor = Some(if self.ctx.params.divergence_assert {
                let name = format!("error{}divergence.path", self.ctx.params.error_path_file_tag);
                DivergenceMonitor::start_fatal(period, self.output_file(&name))
            } else {
                DivergenceMonitor::start(period)
            });
        }
        let result = self.explore();
        self.monitor = None;
        result?;
        info!("{}", self.stats.phase_summary());
        info!("{}", self.stats.total_summary());
        Ok(self.summary())
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            totals: self.stats.total().clone(),
            visited_states: self.visited.len(),
            dead_paths: self.dead_paths,
            error_paths: self.error_paths.clone(),
            outlier_paths: self.outlier_paths.clone(),
            prefix_paths: self.prefix_paths.clone(),
            last_path: self.last_path.clone(),
        }
    }

    fn explore(&mut self) -> Result<(), SimulationError> {
        loop {
            if self.ctx.choices.begin_path() {
                let summary = self.stats.begin_phase(self.ctx.choices.phase());
                info!(phase = self.stats.phase_label(), "{summary}");
            }
            let report = self.run_path()?;
            self.stats.record_path(report.cause, report.steps, report.live);
            let paths = self.stats.total().paths;
            if paths & self.ctx.params.search_print_mask == 0 {
                info!(
                    path = paths,
                    cause = %report.cause,
                    steps = report.steps,
                    live = report.live,
                    "{}",
                    self.stats.total_summary()
                );
            }
            let live = report.live;
            self.last_path = Some(report);
            self.ctx.reset_path();
            if paths >= self.ctx.params.max_paths || !self.ctx.choices.has_next(live) {
                return Ok(());
            }
        }
    }

    // ─── One path ───

    fn start_path(&mut self) -> Result<(), SimulationError> {
        let loaded = registry::load(self.test.as_ref(), self.ctx.node_count(), &self.ctx.params)?;
        if loaded.bindings != self.bindings {
            return Err(SimulationError::InvariantViolation(format!(
                "test {} changed its transport bindings between paths",
                self.test.name()
            )));
        }
        self.lifecycle = Lifecycle::new(loaded.services);
        self.safety = loaded.safety;
        self.liveness = loaded.liveness;
        self.trace.clear();

        if !self.ctx.events.is_empty() {
            return Err(SimulationError::EventsQueuedBeforeStart(self.ctx.events.len()));
        }
        self.lifecycle.init_nodes(&mut self.ctx)?;

        if self.ctx.params.use_state_hashes && self.ctx.choices.test_search_depth() > -2 {
            let hash = self.state_hash();
            self.visited.record(hash, &self.ctx.choices.search_path());
        }
        Ok(())
    }

    fn run_path(&mut self) -> Result<PathReport, SimulationError> {
        self.start_path()?;
        let mut steps = 0u64;
        let mut live = false;

        let cause = loop {
            if steps >= self.ctx.params.max_steps {
                if self.ctx.params.max_steps_error && !live {
                    return Err(self.halt("MAX_STEPS", format!("path not live after {steps} steps"))?);
                }
                break PathEndCause::TooManySteps;
            }

            let next = {
                let ctx = &mut self.ctx;
                self.selector
                    .pop_next(&mut ctx.events, &mut ctx.clock, &mut ctx.choices)?
            };
            let Some((key, event)) = next else {
                if let Some(violation) = self.check_safety() {
                    self.safety_violation(steps, violation)?;
                    live = false;
                    break PathEndCause::StoppingCondition;
                }
                live = self.check_liveness();
                if !live {
                    self.dead_path(steps)?;
                }
                break PathEndCause::NoMoreEvents;
            };
            steps += 1;
            self.step(steps, key, &event)?;

            if let Some(violation) = self.check_safety() {
                self.safety_violation(steps, violation)?;
                live = false;
                break PathEndCause::StoppingCondition;
            }

            let search_depth = self.ctx.choices.test_search_depth();
            if self.ctx.params.use_state_hashes && (-1..=0).contains(&search_depth) {
                let hash = self.state_hash();
                match self.visited.visit(hash, &self.ctx.choices.search_path()) {
                    Visit::New => self.stats.mark_unique_state(),
                    Visit::Duplicate => {
                        debug!(step = steps, %hash, "Duplicate state, abandoning path");
                        break PathEndCause::DuplicateState;
                    }
                    Visit::Shorter | Visit::Revisit => {}
                }
            }

            if search_depth >= 0 || self.ctx.params.test_properties_early {
                live = self.check_liveness();
            }
            let too_long = self.path_too_long()?;
            if self.ctx.choices.path_is_done()
                && (!self.ctx.params.use_random_walks || live || too_long)
            {
                break PathEndCause::StoppingCondition;
            }
        };

        self.finish_path(cause, live)?;
        Ok(PathReport {
            cause,
            steps,
            live,
            state_hash: self.state_hash(),
            time: self.ctx.clock.stats(),
            choices: self.ctx.choices.choices(),
            trace: std::mem::take(&mut self.trace),
        })
    }

    /// Write the error path of a violated safety property; an error when
    /// the run halts on violations.
    fn safety_violation(&mut self, step: u64, violation: String) -> Result<(), SimulationError> {
        let path = self.write_error_path("PROPERTY_FAILED", &violation)?;
        error!(step, %violation, ?path, "Safety property violated");
        if self.ctx.params.halt_on_safety_violation {
            return Err(SimulationError::Halted {
                kind: "PROPERTY_FAILED".into(),
                description: violation,
                path: Some(path),
            });
        }
        Ok(())
    }

    /// Execute one popped event.
    fn step(&mut self, step: u64, key: u64, event: &Event) -> Result<(), SimulationError> {
        if let Some(monitor) = &self.monitor {
            monitor.checkpoint(step, || self.ctx.choices.snapshot());
        }
        let description = match self.lifecycle.simulate(&mut self.ctx, event) {
            Ok(description) => description,
            Err(err) => {
                let kind = match err {
                    SimulationError::ServiceFault { .. } => "SERVICE_FAULT",
                    SimulationError::Nondeterminism { .. } => "NONDETERMINISM",
                    _ => "SIMULATION_ERROR",
                };
                let path = self.write_error_path(kind, &err.to_string())?;
                error!(step, node = event.node, error = %err, ?path, "Simulation step failed");
                return Err(err);
            }
        };
        debug!(
            step,
            node = event.node,
            event = %event.category(),
            key,
            time = self.ctx.clock.now(event.node),
            "{description}"
        );
        if self.record_trace {
            self.trace.push(format!("{} {}", event.node, description));
        }

        if self.ctx.params.mode == SimulationMode::Timed {
            let processing = if self.distributions.is_empty() {
                DEFAULT_PROCESSING_TIME
            } else {
                let fraction = self.ctx.choices.fraction();
                self.distributions.evaluate(event.name(), fraction)
            };
            self.ctx.clock.add(event.node, processing);
        }

        let diverged = match &self.monitor {
            Some(monitor) => {
                monitor.signal();
                monitor.take_divergence()
            }
            None => false,
        };
        if diverged {
            let path = self.write_error_path(
                "DIVERGENCE",
                &format!("step {step} exceeded the divergence timeout"),
            )?;
            warn!(step, ?path, "Divergence recorded, continuing");
        }
        Ok(())
    }

    fn dead_path(&mut self, steps: u64) -> Result<(), SimulationError> {
        self.dead_paths += 1;
        warn!(
            steps,
            dead_paths = self.dead_paths,
            "Path ran out of events without becoming live"
        );
        if self.dead_paths >= self.ctx.params.max_dead_paths {
            return Err(self.halt(
                "NO_MORE_STEPS",
                format!("{} paths ran out of events without becoming live", self.dead_paths),
            )?);
        }
        Ok(())
    }

    /// Outlier and prefix files once a path has ended.
    fn finish_path(&mut self, cause: PathEndCause, live: bool) -> Result<(), SimulationError> {
        if self.ctx.params.mode == SimulationMode::Timed && cause != PathEndCause::DuplicateState {
            let avg = self.ctx.clock.stats().avg;
            let min = self.ctx.params.min_path_outlier_duration;
            let max = self.ctx.params.max_path_outlier_duration;
            if min > 0 && avg < min {
                let name = format!("minoutlier{}-{avg}.path", self.outlier_paths.len());
                let path = self.write_named(&name, &format!("MIN_OUTLIER::average time {avg}"))?;
                info!(avg, ?path, "Short outlier path");
                self.outlier_paths.push(path);
            } else if max > 0 && avg > max {
                let name = format!("maxoutlier{}-{avg}.path", self.outlier_paths.len());
                let path = self.write_named(&name, &format!("MAX_OUTLIER::average time {avg}"))?;
                info!(avg, ?path, "Long outlier path");
                self.outlier_paths.push(path);
            }
        }
        if self.ctx.params.print_search_prefix && live {
            let name = format!("prefix{}.path", self.prefix_paths.len());
            let path = self.write_named(&name, self.ctx.choices.phase())?;
            self.prefix_paths.push(path);
        }
        Ok(())
    }

    /// Whether the average node time passed the long-outlier bound. A hard
    /// error when `MAX_TIME_ERROR` is set.
    fn path_too_long(&mut self) -> Result<bool, SimulationError> {
        let max = self.ctx.params.max_path_outlier_duration;
        if self.ctx.params.mode != SimulationMode::Timed || max == 0 {
            return Ok(false);
        }
        let avg = self.ctx.clock.stats().avg;
        if avg <= max {
            return Ok(false);
        }
        if self.ctx.params.max_time_error {
            return Err(self.halt(
                "PATH_TOO_LONG",
                format!("average node time {avg} exceeds {max}"),
            )?);
        }
        Ok(true)
    }

    // ─── Checks ───

    fn check_safety(&mut self) -> Option<String> {
        if let Some(violation) = self.ctx.network.take_violations().into_iter().next() {
            return Some(format!("transport: {violation}"));
        }
        let view = SystemView {
            services: self.lifecycle.services(),
            network: &self.ctx.network,
            events: &self.ctx.events,
        };
        self.safety
            .iter()
            .find_map(|p| p.check(&view).err().map(|e| format!("{}: {e}", p.name())))
    }

    fn check_liveness(&self) -> bool {
        let view = SystemView {
            services: self.lifecycle.services(),
            network: &self.ctx.network,
            events: &self.ctx.events,
        };
        self.liveness.iter().all(|p| p.is_live(&view))
    }

    /// Hash of every node's state, the network and the timers.
    fn state_hash(&self) -> StateHash {
        let mut parts: Vec<String> = (0..self.ctx.node_count())
            .map(|node| self.lifecycle.state_string(node))
            .collect();
        parts.push(self.ctx.network.print_state());
        parts.push(self.ctx.timers.print_state());
        combined_state_hash(parts.iter().map(String::as_str))
    }

    // ─── Path files ───

    fn output_file(&self, name: &str) -> PathBuf {
        PathBuf::from(format!("{}{name}", self.ctx.params.output_path))
    }

    fn write_named(&self, name: &str, comment: &str) -> Result<PathBuf, SimulationError> {
        let path = self.output_file(name);
        if let Some(monitor) = &self.monitor {
            monitor.pause();
        }
        let result = self.ctx.choices.write_path(&path, comment);
        if let Some(monitor) = &self.monitor {
            monitor.resume();
        }
        result.map(|_| path)
    }

    fn write_error_path(&mut self, kind: &str, description: &str) -> Result<PathBuf, SimulationError> {
        let name = format!(
            "error{}{}.path",
            self.ctx.params.error_path_file_tag,
            self.error_paths.len()
        );
        let path = self.write_named(&name, &format!("{kind}::{description}"))?;
        self.error_paths.push(path.clone());
        Ok(path)
    }

    /// Write an error path and build the error that halts the run.
    fn halt(&mut self, kind: &str, description: String) -> Result<SimulationError, SimulationError> {
        let path = self.write_error_path(kind, &description)?;
        error!(kind, %description, ?path, "Halting run");
        Ok(SimulationError::Halted {
            kind: kind.to_string(),
            description,
            path: Some(path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FnService, LoadedTest};
    use pathcheck_core::{NodeApi, NodeService, ServiceResult};
    use pathcheck_types::{HandlerId, NodeIndex, TimerId};
    use std::any::Any;
    use tracing_test::traced_test;

    const PORT: Port = 5377;

    /// Node 0 pings node 1 once; node 1 counts.
    #[derive(Default)]
    struct Once {
        received: u32,
    }

    impl NodeService for Once {
        fn name(&self) -> &str {
            "once"
        }
        fn init(&mut self, api: &mut dyn NodeApi) -> ServiceResult {
            api.register_handler(PORT, HandlerId(0))?;
            if api.node() == 0 {
                api.route(PORT, 1, HandlerId(0), "ping")?;
            }
            Ok(())
        }
        fn reset(&mut self) {
            self.received = 0;
        }
        fn deliver(&mut self, _: &mut dyn NodeApi, _: Port, _: NodeIndex, _: HandlerId, _: &str) -> ServiceResult {
            self.received += 1;
            Ok(())
        }
        fn timer_fired(&mut self, _: &mut dyn NodeApi, _: TimerId) -> ServiceResult {
            Ok(())
        }
        fn state_string(&self) -> String {
            format!("received={}", self.received)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn once_test() -> Arc<dyn CheckedService> {
        Arc::new(FnService::new("once", |n, _| {
            let services = (0..n).map(|_| Box::new(Once::default()) as Box<dyn NodeService>).collect();
            Ok(LoadedTest::new(services).with_binding(PORT, TransportKind::Stream))
        }))
    }

    /// Listens and never sends.
    struct Silent;

    impl NodeService for Silent {
        fn name(&self) -> &str {
            "silent"
        }
        fn init(&mut self, api: &mut dyn NodeApi) -> ServiceResult {
            api.register_handler(PORT, HandlerId(0))
        }
        fn reset(&mut self) {}
        fn deliver(&mut self, _: &mut dyn NodeApi, _: Port, _: NodeIndex, _: HandlerId, _: &str) -> ServiceResult {
            Ok(())
        }
        fn timer_fired(&mut self, _: &mut dyn NodeApi, _: TimerId) -> ServiceResult {
            Ok(())
        }
        fn state_string(&self) -> String {
            String::new()
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Violated whenever nothing is pending.
    struct NeverQuiet;

    impl SafetyProperty for NeverQuiet {
        fn name(&self) -> &str {
            "never quiet"
        }
        fn check(&self, view: &SystemView<'_>) -> Result<(), String> {
            if view.events.is_empty() {
                Err("no events pending".into())
            } else {
                Ok(())
            }
        }
    }

    fn silent_test() -> Arc<dyn CheckedService> {
        Arc::new(FnService::new("silent", |n, _| {
            let services = (0..n).map(|_| Box::new(Silent) as Box<dyn NodeService>).collect();
            Ok(LoadedTest::new(services)
                .with_binding(PORT, TransportKind::Stream)
                .with_safety(NeverQuiet))
        }))
    }

    fn params(dir: &tempfile::TempDir) -> SimulationParams {
        SimulationParams::model_check()
            .with_divergence_monitor(false)
            .with_output_path(format!("{}/", dir.path().display()))
    }

    #[test]
    fn test_search_explores_every_interleaving() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = SimulationRunner::new(params(&dir).with_max_paths(100), once_test(), 2).unwrap();
        let summary = runner.run().unwrap();
        // Paths are shorter than the search depth, so each runs dry.
        assert!(summary.totals.paths >= 2);
        assert_eq!(
            summary.totals.ended(PathEndCause::NoMoreEvents),
            summary.totals.paths
        );
        assert!(summary.error_paths.is_empty());
    }

    #[test]
    fn test_forced_path_is_explored_once() {
        let dir = tempfile::tempdir().unwrap();
        let params = params(&dir).with_preinitialized(vec![-1]);
        let mut runner = SimulationRunner::new(params, once_test(), 2)
            .unwrap()
            .with_trace(true);
        let summary = runner.run().unwrap();
        assert_eq!(summary.totals.paths, 1);
        let last = summary.last_path.unwrap();
        assert_eq!(last.steps, 1);
        assert!(last.choices.is_empty());
        assert_eq!(last.trace.len(), 1);
        assert!(last.trace[0].starts_with("1 message id"), "{:?}", last.trace);
    }

    #[test]
    fn test_random_walk_respects_path_budget() {
        let dir = tempfile::tempdir().unwrap();
        let params = params(&dir)
            .with_strategy(crate::ChoiceStrategy::Random)
            .with_max_paths(7);
        let mut runner = SimulationRunner::new(params, once_test(), 3).unwrap();
        let summary = runner.run().unwrap();
        assert_eq!(summary.totals.paths, 7);
        assert_eq!(summary.totals.live_paths, 7);
    }

    #[traced_test]
    #[test]
    fn test_run_logs_start_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let params = params(&dir).with_preinitialized(vec![-1]);
        SimulationRunner::new(params, once_test(), 2).unwrap().run().unwrap();
        assert!(logs_contain("Starting simulation"));
        assert!(logs_contain("once"));
    }

    #[test]
    fn test_safety_checked_when_events_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let params = params(&dir).with_preinitialized(vec![-1]);
        let err = SimulationRunner::new(params, silent_test(), 2)
            .unwrap()
            .run()
            .unwrap_err();
        match err {
            SimulationError::Halted { kind, description, path } => {
                assert_eq!(kind, "PROPERTY_FAILED");
                assert_eq!(description, "never quiet: no events pending");
                assert!(path.unwrap().ends_with("error0.path"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let mut params = self::params(&dir).with_preinitialized(vec![-1]);
        params.halt_on_safety_violation = false;
        let summary = SimulationRunner::new(params, silent_test(), 2)
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(summary.totals.ended(PathEndCause::StoppingCondition), 1);
        assert_eq!(summary.dead_paths, 0);
        assert_eq!(summary.error_paths.len(), 1);
        assert!(!summary.last_path.unwrap().live);
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SimulationRunner::new(params(&dir), once_test(), 0),
            Err(SimulationError::InvalidParams(_))
        ));
    }
}
