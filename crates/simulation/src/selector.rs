//! Event selection policies.
//!
//! Both policies work on the same [`PendingEventStore`]; only how the next
//! entry is picked differs between model checking and timed simulation.

use crate::{ChoicePath, NodeClock, PendingEventStore, SimulationError, SimulationMode};
use pathcheck_core::Event;

/// Picks and removes the next event to execute.
pub trait EventSelector: Send {
    /// Remove the next event, or `None` when nothing can fire.
    ///
    /// # Returns
    ///
    /// The event's sort key and the event itself.
    fn pop_next(
        &mut self,
        events: &mut PendingEventStore,
        clock: &mut NodeClock,
        choices: &mut ChoicePath,
    ) -> Result<Option<(u64, Event)>, SimulationError>;

    /// Name for logs.
    fn name(&self) -> &'static str;
}

/// Model-checking policy: a choice weighted by sort key.
///
/// With weighted choices enabled the draw falls in `[0, total_weight)` and the
/// event whose band contains it is taken. Otherwise every pending event is
/// equally likely, so a search enumerates all of them.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRandomSelector;

impl EventSelector for WeightedRandomSelector {
    fn pop_next(
        &mut self,
        events: &mut PendingEventStore,
        _clock: &mut NodeClock,
        choices: &mut ChoicePath,
    ) -> Result<Option<(u64, Event)>, SimulationError> {
        if !events.has_events() {
            return Ok(None);
        }
        if choices.is_weighted() {
            let draw = choices.uniform(events.total_weight())?;
            Ok(events.pop_weighted(draw))
        } else {
            let index = choices.uniform(events.len() as u64)?;
            Ok(events.remove_nth(index as usize))
        }
    }

    fn name(&self) -> &'static str {
        "weighted-random"
    }
}

/// Timed policy: the event with the smallest timestamp.
///
/// The executing node's clock is advanced to the event time if behind, so no
/// later scheduling call from that node can produce an earlier timestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinimumKeySelector;

impl EventSelector for MinimumKeySelector {
    fn pop_next(
        &mut self,
        events: &mut PendingEventStore,
        clock: &mut NodeClock,
        _choices: &mut ChoicePath,
    ) -> Result<Option<(u64, Event)>, SimulationError> {
        let next = events.pop_first();
        if let Some((time, event)) = &next {
            clock.advance_to(event.node, *time);
        }
        Ok(next)
    }

    fn name(&self) -> &'static str {
        "minimum-key"
    }
}

/// The selector matching `mode`.
pub fn selector_for(mode: SimulationMode) -> Box<dyn EventSelector> {
    match mode {
        SimulationMode::ModelCheck => Box::new(WeightedRandomSelector),
        SimulationMode::Timed => Box::new(MinimumKeySelector),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Choice, SIM_START_TIME};
    use pathcheck_types::TimerId;

    fn timer(node: u32, id: u64) -> Event {
        Event::timer(node, TimerId(id), "t")
    }

    #[test]
    fn test_weighted_selector_uses_draw() {
        let mut events = PendingEventStore::new();
        events.add(2, timer(0, 1));
        events.add(8, timer(1, 2));
        let mut clock = NodeClock::new(SimulationMode::ModelCheck, 2);
        let mut choices =
            ChoicePath::replay(0, vec![Choice { out_of: 10, value: 5 }]).with_weighted(true);

        let (weight, event) = WeightedRandomSelector
            .pop_next(&mut events, &mut clock, &mut choices)
            .unwrap()
            .unwrap();
        assert_eq!(weight, 8);
        assert_eq!(event.node, 1);
    }

    #[test]
    fn test_uniform_selector_can_pick_zero_weight() {
        let mut events = PendingEventStore::new();
        events.add(0, Event::reset(0));
        events.add(8, timer(1, 2));
        let mut clock = NodeClock::new(SimulationMode::ModelCheck, 2);
        let mut choices = ChoicePath::replay(0, vec![Choice { out_of: 2, value: 0 }]);

        let (weight, event) = WeightedRandomSelector
            .pop_next(&mut events, &mut clock, &mut choices)
            .unwrap()
            .unwrap();
        assert_eq!(weight, 0);
        assert_eq!(event.node, 0);
    }

    #[test]
    fn test_weighted_selector_ignores_only_zero_weights() {
        let mut events = PendingEventStore::new();
        events.add(0, Event::reset(0));
        let mut clock = NodeClock::new(SimulationMode::ModelCheck, 1);
        let mut choices = ChoicePath::random(0);
        assert!(WeightedRandomSelector
            .pop_next(&mut events, &mut clock, &mut choices)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_minimum_key_advances_clock() {
        let mut events = PendingEventStore::new();
        events.add(SIM_START_TIME + 900, timer(1, 2));
        events.add(SIM_START_TIME + 300, timer(0, 1));
        let mut clock = NodeClock::new(SimulationMode::Timed, 2);
        let mut choices = ChoicePath::random(0);

        let (time, event) = MinimumKeySelector
            .pop_next(&mut events, &mut clock, &mut choices)
            .unwrap()
            .unwrap();
        assert_eq!(time, SIM_START_TIME + 300);
        assert_eq!(event.node, 0);
        assert_eq!(clock.now(0), SIM_START_TIME + 300);
        assert_eq!(clock.now(1), SIM_START_TIME);
    }
}
