//! Simulated timer service.

use crate::context::Env;
use pathcheck_core::{Event, EventKind};
use pathcheck_types::{NodeIndex, TimerId};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use tracing::{debug, error};

/// Timers pending in the event store, per node.
///
/// Scheduling an already pending timer replaces it.
#[derive(Debug, Clone, Default)]
pub struct TimerService {
    pending: BTreeSet<(NodeIndex, TimerId)>,
}

fn is_timer(e: &Event, node: NodeIndex, timer: TimerId) -> bool {
    e.node == node && e.kind == EventKind::Timer(timer)
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `timer` for `node` and return its firing time.
    ///
    /// Timed mode fires at `now + delay` (or at `delay` itself when
    /// `absolute`), moved up to the first free instant. Model checking keys
    /// the event by the timer weight and returns the nominal time.
    pub fn schedule(
        &mut self,
        env: &mut Env<'_>,
        node: NodeIndex,
        timer: TimerId,
        delay: u64,
        absolute: bool,
    ) -> u64 {
        if self.pending.contains(&(node, timer)) {
            debug!(node, %timer, "rescheduling pending timer");
            env.events.remove_first(|e| is_timer(e, node, timer));
        }
        let now = env.clock.now(node);
        let nominal = if absolute { delay } else { now.saturating_add(delay) };
        let (key, fires_at) = if env.is_timed() {
            let key = env.events.next_free_key(nominal.max(now));
            (key, key)
        } else {
            (env.params.timer_weight, nominal)
        };
        env.events
            .add(key, Event::timer(node, timer, format!("{timer} on {node}")));
        self.pending.insert((node, timer));
        fires_at
    }

    /// Remove a pending timer. Unknown timers are logged, not fatal.
    pub fn cancel(&mut self, env: &mut Env<'_>, node: NodeIndex, timer: TimerId) -> bool {
        self.pending.remove(&(node, timer));
        if env.events.remove_first(|e| is_timer(e, node, timer)).is_some() {
            true
        } else {
            error!(node, %timer, "cancel of a timer that is not pending");
            false
        }
    }

    /// The timer's event was popped.
    pub fn fired(&mut self, node: NodeIndex, timer: TimerId) {
        self.pending.remove(&(node, timer));
    }

    /// Drop every timer of `node`.
    pub fn cancel_all(&mut self, env: &mut Env<'_>, node: NodeIndex) -> usize {
        self.pending.retain(|(n, _)| *n != node);
        env.events
            .remove_all(|e| e.node == node && matches!(e.kind, EventKind::Timer(_)))
    }

    pub fn is_pending(&self, node: NodeIndex, timer: TimerId) -> bool {
        self.pending.contains(&(node, timer))
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Canonical rendering for state hashing.
    pub fn print_state(&self) -> String {
        let mut out = String::from("[timers");
        for (node, timer) in &self.pending {
            let _ = write!(out, " {node}:{}", timer.0);
        }
        out.push(']');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChoicePath, NodeClock, PendingEventStore, SimulationParams, SIM_START_TIME};
    use tracing_test::traced_test;

    fn parts(params: &SimulationParams) -> (PendingEventStore, NodeClock, ChoicePath) {
        (
            PendingEventStore::new(),
            NodeClock::new(params.mode, 2),
            ChoicePath::random(1),
        )
    }

    #[test]
    fn test_timed_schedule_probes_collisions() {
        let params = SimulationParams::timed();
        let (mut events, mut clock, mut choices) = parts(&params);
        let mut env = Env {
            params: &params,
            events: &mut events,
            clock: &mut clock,
            choices: &mut choices,
        };
        let mut timers = TimerService::new();
        let a = timers.schedule(&mut env, 0, TimerId(1), 100, false);
        let b = timers.schedule(&mut env, 1, TimerId(1), 100, false);
        let c = timers.schedule(&mut env, 1, TimerId(2), SIM_START_TIME + 100, true);
        assert_eq!(a, SIM_START_TIME + 100);
        assert_eq!(b, SIM_START_TIME + 101);
        assert_eq!(c, SIM_START_TIME + 102);
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_model_check_schedule_uses_timer_weight() {
        let params = SimulationParams::model_check();
        let (mut events, mut clock, mut choices) = parts(&params);
        let mut env = Env {
            params: &params,
            events: &mut events,
            clock: &mut clock,
            choices: &mut choices,
        };
        let mut timers = TimerService::new();
        timers.schedule(&mut env, 0, TimerId(1), 5_000, false);
        timers.schedule(&mut env, 0, TimerId(1), 9_000, false);
        assert!(timers.is_pending(0, TimerId(1)));
        let keys: Vec<u64> = events.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![8]);
    }

    #[traced_test]
    #[test]
    fn test_cancel_unknown_timer_is_logged() {
        let params = SimulationParams::model_check();
        let (mut events, mut clock, mut choices) = parts(&params);
        let mut env = Env {
            params: &params,
            events: &mut events,
            clock: &mut clock,
            choices: &mut choices,
        };
        let mut timers = TimerService::new();
        timers.schedule(&mut env, 0, TimerId(1), 10, false);
        assert!(timers.cancel(&mut env, 0, TimerId(1)));
        assert!(!timers.cancel(&mut env, 0, TimerId(1)));
        assert!(logs_contain("cancel of a timer that is not pending"));
        assert!(events.is_empty());
    }

    #[test]
    fn test_cancel_all_only_touches_one_node() {
        let params = SimulationParams::model_check();
        let (mut events, mut clock, mut choices) = parts(&params);
        let mut env = Env {
            params: &params,
            events: &mut events,
            clock: &mut clock,
            choices: &mut choices,
        };
        let mut timers = TimerService::new();
        timers.schedule(&mut env, 0, TimerId(1), 10, false);
        timers.schedule(&mut env, 0, TimerId(2), 10, false);
        timers.schedule(&mut env, 1, TimerId(1), 10, false);
        assert_eq!(timers.cancel_all(&mut env, 0), 2);
        assert_eq!(timers.print_state(), "[timers 1:1]");
        assert_eq!(events.len(), 1);
    }
}
