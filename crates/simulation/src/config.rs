//! Parameters of a simulation run.
//!
//! Every knob the engine reads lives in [`SimulationParams`]. The struct
//! deserializes from a flat table of SCREAMING_SNAKE_CASE keys, so a params
//! file reads like:
//!
//! ```toml
//! MODE = "timed"
//! SIM_NUM_FAILURES = 1
//! MAX_PATHS = 200
//! ```

use crate::SimulationError;
use pathcheck_types::{NodeIndex, Port};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How the next event is chosen and what the sort key of an event means.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimulationMode {
    /// Weighted random selection; keys are weights.
    #[default]
    ModelCheck,
    /// Smallest-timestamp selection; keys are simulated microseconds.
    Timed,
}

/// Where the values of nondeterministic choices come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChoiceStrategy {
    /// Every choice drawn from the seeded RNG.
    Random,
    /// Iterative-deepening enumeration of the first choices, random after.
    #[default]
    Search,
    /// Choices read back from a recorded path file.
    Replay,
}

/// Configuration for a simulation run.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SimulationParams {
    /// Event selection mode.
    pub mode: SimulationMode,

    /// Source of nondeterministic choices.
    pub choice_strategy: ChoiceStrategy,

    /// Choice file read by the replay strategy.
    pub replay_file: Option<PathBuf>,

    /// Seed of the choice RNG.
    pub seed: u64,

    /// Weighted ("gusto") event selection instead of uniform.
    pub use_gusto: bool,

    // ─── Event weights (model checking) ───
    /// Weight of message-available events.
    pub message_weight: u64,

    /// Weight of node start-up events.
    pub application_event_weight: u64,

    /// Weight of node crash events.
    pub event_failure_weight: u64,

    /// Weight of timer events.
    pub timer_weight: u64,

    // ─── Fault injection ───
    /// Crashes injected per path; negative means unbounded.
    pub sim_num_failures: i64,

    /// Nodes allowed to crash; empty means all.
    pub sim_fail_nodes: Vec<NodeIndex>,

    /// Nodes started before the first step; a negative first entry means all.
    pub nodes_to_preinitialize: Vec<i64>,

    /// Timed mode: delay between a node starting and its injected crash.
    pub failure_delay: u64,

    /// Weight of the "error" branch when a delivery may be followed by a
    /// socket error (the "no error" branch weighs 100).
    pub net_error_weight: u64,

    /// Socket errors injected per path; negative means unbounded.
    pub sim_num_net_errors: i64,

    /// Datagram transports may drop messages.
    pub use_udp_errors: bool,

    /// Datagram transports deliver a randomly chosen queued message.
    pub use_udp_reorder: bool,

    // ─── Transport ───
    /// Per-destination queue capacity of every transport.
    pub queue_size: usize,

    /// Upcall `message_error` for each queued message a transport error drops.
    pub upcall_message_errors: bool,

    /// Port of the default transport binding.
    #[serde(rename = "MACE_PORT")]
    pub base_port: Port,

    /// Link-parameter file (bandwidth and latency per group pair).
    pub sim_network_params: Option<PathBuf>,

    /// Empirical per-event processing time distributions.
    pub latency_distribution_file: Option<PathBuf>,

    /// Allow services to read the clock.
    pub allow_timeu: bool,

    // ─── Exploration budget ───
    /// Maximum number of paths.
    pub max_paths: u64,

    /// Maximum number of steps per path.
    #[serde(alias = "max_num_steps")]
    pub max_steps: u64,

    /// Hitting the step ceiling on a non-live path is an error.
    pub max_steps_error: bool,

    /// Non-live paths that run out of events before the run halts.
    pub max_dead_paths: u64,

    /// Keep walking randomly after the search prefix until the path is live.
    pub use_random_walks: bool,

    /// Evaluate properties while still inside the search prefix.
    pub test_properties_early: bool,

    /// Enable the duplicate-state detector.
    pub use_state_hashes: bool,

    /// Iterative-deepening increment.
    pub search_depth: usize,

    /// Iterative deepening stops past this depth.
    pub max_search_depth: usize,

    /// Samples taken at a choice point with more than 1000 options.
    pub num_random_samples: u64,

    /// A safety violation halts the whole run instead of only the path.
    pub halt_on_safety_violation: bool,

    // ─── Timed mode ───
    /// Average node time below which a path is written as an outlier (0 = off).
    pub min_path_outlier_duration: u64,

    /// Average node time above which a path is too long (0 = off).
    pub max_path_outlier_duration: u64,

    /// A too-long path is an error rather than an outlier file.
    pub max_time_error: bool,

    // ─── Output ───
    /// Write each live path's choices to `prefix{n}.path`.
    pub print_search_prefix: bool,

    /// Directory (or prefix) of written path files.
    pub output_path: String,

    /// Tag inserted in error path file names.
    pub error_path_file_tag: String,

    /// Paths between progress lines, as a mask.
    pub search_print_mask: u64,

    // ─── Divergence monitor ───
    /// Start the divergence monitor thread.
    pub run_divergence_monitor: bool,

    /// Monitor period, in seconds.
    pub divergence_timeout: u64,

    /// A divergence halts the run.
    pub divergence_assert: bool,
}

impl SimulationParams {
    /// Parameters for a model-checking run with defaults.
    pub fn model_check() -> Self {
        Self::default()
    }

    /// Parameters for a timed run with defaults.
    pub fn timed() -> Self {
        Self {
            mode: SimulationMode::Timed,
            choice_strategy: ChoiceStrategy::Random,
            ..Self::default()
        }
    }

    /// Set the event selection mode.
    pub fn with_mode(mut self, mode: SimulationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the choice strategy.
    pub fn with_strategy(mut self, strategy: ChoiceStrategy) -> Self {
        self.choice_strategy = strategy;
        self
    }

    /// Replay the choices recorded in `path`.
    pub fn with_replay_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.choice_strategy = ChoiceStrategy::Replay;
        self.replay_file = Some(path.into());
        self
    }

    /// Set the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the path ceiling.
    pub fn with_max_paths(mut self, max_paths: u64) -> Self {
        self.max_paths = max_paths;
        self
    }

    /// Set the per-path step ceiling.
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set the crash budget and the nodes eligible to crash.
    pub fn with_failures(mut self, count: i64, nodes: Vec<NodeIndex>) -> Self {
        self.sim_num_failures = count;
        self.sim_fail_nodes = nodes;
        self
    }

    /// Set the socket-error budget and the weight of the error branch.
    pub fn with_net_errors(mut self, count: i64, weight: u64) -> Self {
        self.sim_num_net_errors = count;
        self.net_error_weight = weight;
        self
    }

    /// Enable or disable the duplicate-state detector.
    pub fn with_state_hashes(mut self, enabled: bool) -> Self {
        self.use_state_hashes = enabled;
        self
    }

    /// Set the iterative-deepening increment and bound.
    pub fn with_search_depth(mut self, increment: usize, max: usize) -> Self {
        self.search_depth = increment;
        self.max_search_depth = max;
        self
    }

    /// Enable or disable the divergence monitor.
    pub fn with_divergence_monitor(mut self, enabled: bool) -> Self {
        self.run_divergence_monitor = enabled;
        self
    }

    /// Set the prefix of written path files.
    pub fn with_output_path(mut self, output: impl Into<String>) -> Self {
        self.output_path = output.into();
        self
    }

    /// Set the node start-up list.
    pub fn with_preinitialized(mut self, nodes: Vec<i64>) -> Self {
        self.nodes_to_preinitialize = nodes;
        self
    }

    /// Whether the run replays a recorded path.
    pub fn is_replay(&self) -> bool {
        self.choice_strategy == ChoiceStrategy::Replay
    }

    /// Monitor period.
    pub fn divergence_period(&self) -> Duration {
        Duration::from_secs(self.divergence_timeout.max(1))
    }

    /// Apply the overrides replay implies and reject unusable combinations.
    pub fn effective(mut self) -> Result<Self, SimulationError> {
        if self.search_depth == 0 {
            return Err(SimulationError::InvalidParams(
                "SEARCH_DEPTH must be positive".into(),
            ));
        }
        if self.is_replay() {
            if self.replay_file.is_none() {
                return Err(SimulationError::InvalidParams(
                    "replay requires REPLAY_FILE".into(),
                ));
            }
            self.use_state_hashes = false;
            self.max_steps_error = true;
            self.run_divergence_monitor = false;
            self.halt_on_safety_violation = true;
            self.max_paths = 1;
        }
        Ok(self)
    }
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            mode: SimulationMode::ModelCheck,
            choice_strategy: ChoiceStrategy::Search,
            replay_file: None,
            seed: 0,
            use_gusto: false,
            message_weight: 8,
            application_event_weight: 40,
            event_failure_weight: 0,
            timer_weight: 8,
            sim_num_failures: 0,
            sim_fail_nodes: Vec::new(),
            nodes_to_preinitialize: Vec::new(),
            failure_delay: 1_000_000,
            net_error_weight: 0,
            sim_num_net_errors: 0,
            use_udp_errors: false,
            use_udp_reorder: true,
            queue_size: 20,
            upcall_message_errors: false,
            base_port: 5377,
            sim_network_params: None,
            latency_distribution_file: None,
            allow_timeu: true,
            max_paths: u64::MAX,
            max_steps: 80_000,
            max_steps_error: false,
            max_dead_paths: 1,
            use_random_walks: true,
            test_properties_early: true,
            use_state_hashes: false,
            search_depth: 5,
            max_search_depth: usize::MAX,
            num_random_samples: 10,
            halt_on_safety_violation: true,
            min_path_outlier_duration: 0,
            max_path_outlier_duration: 0,
            max_time_error: true,
            print_search_prefix: false,
            output_path: String::new(),
            error_path_file_tag: String::new(),
            search_print_mask: 0xfff,
            run_divergence_monitor: true,
            divergence_timeout: 5,
            divergence_assert: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = SimulationParams::default();
        assert_eq!(params.message_weight, 8);
        assert_eq!(params.application_event_weight, 40);
        assert_eq!(params.event_failure_weight, 0);
        assert_eq!(params.sim_num_failures, 0);
        assert_eq!(params.max_dead_paths, 1);
        assert!(params.use_random_walks);
        assert!(params.test_properties_early);
        assert!(params.allow_timeu);
        assert!(!params.use_state_hashes);
        assert_eq!(params.base_port, 5377);
    }

    #[test]
    fn test_deserialize_screaming_keys() {
        let params: SimulationParams = toml::from_str(
            r#"
            MODE = "timed"
            MESSAGE_WEIGHT = 3
            SIM_NUM_FAILURES = -1
            SIM_FAIL_NODES = [1, 2]
            max_num_steps = 500
            MACE_PORT = 6000
            "#,
        )
        .unwrap();
        assert_eq!(params.mode, SimulationMode::Timed);
        assert_eq!(params.message_weight, 3);
        assert_eq!(params.sim_num_failures, -1);
        assert_eq!(params.sim_fail_nodes, vec![1, 2]);
        assert_eq!(params.max_steps, 500);
        assert_eq!(params.base_port, 6000);
        // Untouched keys keep their defaults.
        assert_eq!(params.queue_size, 20);
    }

    #[test]
    fn test_replay_overrides() {
        let params = SimulationParams::default()
            .with_state_hashes(true)
            .with_replay_file("error0.path")
            .effective()
            .unwrap();
        assert!(!params.use_state_hashes);
        assert!(params.max_steps_error);
        assert!(!params.run_divergence_monitor);
        assert_eq!(params.max_paths, 1);
    }

    #[test]
    fn test_replay_requires_file() {
        let params = SimulationParams::default().with_strategy(ChoiceStrategy::Replay);
        assert!(matches!(
            params.effective(),
            Err(SimulationError::InvalidParams(_))
        ));
    }
}
