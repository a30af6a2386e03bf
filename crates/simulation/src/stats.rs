//! Path statistics, per phase and cumulative.

use crate::SimulationError;
use hdrhistogram::Histogram;
use std::fmt;

/// Why a path stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathEndCause {
    /// The step reached an already visited state.
    DuplicateState,
    /// A stopping condition held (search done, live, path too long).
    StoppingCondition,
    /// No selectable event remained.
    NoMoreEvents,
    /// The step ceiling was reached.
    TooManySteps,
}

impl PathEndCause {
    pub const ALL: [PathEndCause; 4] = [
        PathEndCause::DuplicateState,
        PathEndCause::StoppingCondition,
        PathEndCause::NoMoreEvents,
        PathEndCause::TooManySteps,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Short label used in summaries.
    pub fn label(self) -> &'static str {
        match self {
            PathEndCause::DuplicateState => "DUP",
            PathEndCause::StoppingCondition => "SC",
            PathEndCause::NoMoreEvents => "OOE",
            PathEndCause::TooManySteps => "TMS",
        }
    }
}

impl fmt::Display for PathEndCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathEndCause::DuplicateState => write!(f, "DUPLICATE_STATE"),
            PathEndCause::StoppingCondition => write!(f, "STOPPING_CONDITION"),
            PathEndCause::NoMoreEvents => write!(f, "NO_MORE_EVENTS"),
            PathEndCause::TooManySteps => write!(f, "TOO_MANY_STEPS"),
        }
    }
}

/// Counters over a set of paths.
#[derive(Debug, Clone)]
pub struct PathCounters {
    pub paths: u64,
    pub live_paths: u64,
    pub unique_states: u64,
    ends: [u64; 4],
    steps: Vec<Histogram<u64>>,
}

impl PathCounters {
    fn new() -> Result<Self, SimulationError> {
        let steps = PathEndCause::ALL
            .iter()
            .map(|_| Histogram::<u64>::new(3))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SimulationError::InvariantViolation(format!("step histogram: {e}")))?;
        Ok(Self {
            paths: 0,
            live_paths: 0,
            unique_states: 0,
            ends: [0; 4],
            steps,
        })
    }

    fn reset(&mut self) {
        self.paths = 0;
        self.live_paths = 0;
        self.unique_states = 0;
        self.ends = [0; 4];
        for h in &mut self.steps {
            h.reset();
        }
    }

    fn record(&mut self, cause: PathEndCause, steps: u64, live: bool) {
        self.paths += 1;
        if live {
            self.live_paths += 1;
        }
        self.ends[cause.index()] += 1;
        self.steps[cause.index()].saturating_record(steps);
    }

    /// Paths that ended for `cause`.
    pub fn ended(&self, cause: PathEndCause) -> u64 {
        self.ends[cause.index()]
    }

    /// Mean and maximum step count of paths that ended for `cause`.
    pub fn steps(&self, cause: PathEndCause) -> (f64, u64) {
        let h = &self.steps[cause.index()];
        if h.is_empty() {
            (0.0, 0)
        } else {
            (h.mean(), h.max())
        }
    }
}

impl fmt::Display for PathCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "paths={} live={} unique={}",
            self.paths, self.live_paths, self.unique_states
        )?;
        for cause in PathEndCause::ALL {
            let (mean, max) = self.steps(cause);
            write!(
                f,
                " {}={} (steps avg {:.1} max {})",
                cause.label(),
                self.ended(cause),
                mean,
                max
            )?;
        }
        Ok(())
    }
}

/// Statistics of the current phase and of the whole run.
#[derive(Debug, Clone)]
pub struct PathStatistics {
    phase_label: String,
    phase: PathCounters,
    total: PathCounters,
}

impl PathStatistics {
    pub fn new(phase_label: impl Into<String>) -> Result<Self, SimulationError> {
        Ok(Self {
            phase_label: phase_label.into(),
            phase: PathCounters::new()?,
            total: PathCounters::new()?,
        })
    }

    pub fn mark_unique_state(&mut self) {
        self.phase.unique_states += 1;
        self.total.unique_states += 1;
    }

    pub fn record_path(&mut self, cause: PathEndCause, steps: u64, live: bool) {
        self.phase.record(cause, steps, live);
        self.total.record(cause, steps, live);
    }

    /// Close the current phase and return its summary line.
    pub fn begin_phase(&mut self, label: impl Into<String>) -> String {
        let summary = self.phase_summary();
        self.phase.reset();
        self.phase_label = label.into();
        summary
    }

    pub fn phase(&self) -> &PathCounters {
        &self.phase
    }

    pub fn total(&self) -> &PathCounters {
        &self.total
    }

    pub fn phase_label(&self) -> &str {
        &self.phase_label
    }

    pub fn phase_summary(&self) -> String {
        format!("phase {}: {}", self.phase_label, self.phase)
    }

    pub fn total_summary(&self) -> String {
        format!("cumulative: {}", self.total)
    }
}
