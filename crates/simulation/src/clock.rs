//! Per-node logical clocks.

use crate::SimulationMode;
use pathcheck_types::NodeIndex;

/// Simulated epoch of timed runs, in microseconds.
pub const SIM_START_TIME: u64 = 1_026_583_200_000_000;

/// Logical time of every node, in microseconds.
///
/// Timed runs start every node at [`SIM_START_TIME`]; model-checking runs
/// start at zero and only advance when a service reads the clock. A node's
/// clock never moves backwards.
#[derive(Debug, Clone)]
pub struct NodeClock {
    start: u64,
    times: Vec<u64>,
}

/// Summary of node clocks relative to the start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeStats {
    pub min: u64,
    pub max: u64,
    pub avg: u64,
}

impl NodeClock {
    /// Clocks for `node_count` nodes in the given mode.
    pub fn new(mode: SimulationMode, node_count: u32) -> Self {
        let start = match mode {
            SimulationMode::Timed => SIM_START_TIME,
            SimulationMode::ModelCheck => 0,
        };
        Self {
            start,
            times: vec![start; node_count as usize],
        }
    }

    /// Current time of `node`.
    pub fn now(&self, node: NodeIndex) -> u64 {
        self.times.get(node as usize).copied().unwrap_or(self.start)
    }

    /// Read and advance `node`'s clock by one microsecond, so successive
    /// reads are strictly increasing.
    pub fn tick(&mut self, node: NodeIndex) -> u64 {
        match self.times.get_mut(node as usize) {
            Some(t) => {
                let now = *t;
                *t += 1;
                now
            }
            None => self.start,
        }
    }

    /// Move `node`'s clock forward to `time` if it is behind.
    pub fn advance_to(&mut self, node: NodeIndex, time: u64) {
        if let Some(t) = self.times.get_mut(node as usize) {
            if *t < time {
                *t = time;
            }
        }
    }

    /// Add `delta` microseconds to `node`'s clock.
    pub fn add(&mut self, node: NodeIndex, delta: u64) {
        if let Some(t) = self.times.get_mut(node as usize) {
            *t = t.saturating_add(delta);
        }
    }

    /// Return every node to the start time.
    pub fn reset(&mut self) {
        for t in &mut self.times {
            *t = self.start;
        }
    }

    /// Elapsed time statistics across nodes.
    pub fn stats(&self) -> TimeStats {
        if self.times.is_empty() {
            return TimeStats::default();
        }
        let elapsed = self.times.iter().map(|t| t - self.start);
        let min = elapsed.clone().min().unwrap_or(0);
        let max = elapsed.clone().max().unwrap_or(0);
        let avg = elapsed.sum::<u64>() / self.times.len() as u64;
        TimeStats { min, max, avg }
    }

    /// Canonical rendering for state dumps.
    pub fn print_state(&self) -> String {
        let stats = self.stats();
        format!(
            "[clock avg: {} min: {} max: {}]",
            stats.avg, stats.min, stats.max
        )
    }
}
