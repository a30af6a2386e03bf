//! Ordered store of pending events.

use pathcheck_core::{Event, EventCategory};
use std::collections::BTreeMap;

/// Key of a stored event: the sort key (weight or time) plus an insertion
/// sequence number that keeps ties in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventKey {
    pub key: u64,
    seq: u64,
}

/// Pending events ordered by sort key.
///
/// In model-checking mode the sort key is a weight and many events may share
/// it. In timed mode it is a simulated timestamp, kept unique by probing with
/// [`next_free_key`](Self::next_free_key) before inserting.
///
/// The sum of all keys is maintained incrementally for weighted selection.
#[derive(Debug, Default, Clone)]
pub struct PendingEventStore {
    events: BTreeMap<EventKey, Event>,
    next_seq: u64,
    total_weight: u64,
}

impl PendingEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `event` under `key`.
    pub fn add(&mut self, key: u64, event: Event) -> EventKey {
        let ek = EventKey {
            key,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.total_weight = self.total_weight.saturating_add(key);
        self.events.insert(ek, event);
        ek
    }

    /// Whether any event is stored under `key`.
    pub fn contains_key(&self, key: u64) -> bool {
        self.range_of(key).next().is_some()
    }

    /// Smallest unoccupied key not below `candidate`.
    pub fn next_free_key(&self, candidate: u64) -> u64 {
        let mut key = candidate;
        while self.contains_key(key) {
            key += 1;
        }
        key
    }

    fn range_of(&self, key: u64) -> impl Iterator<Item = (&EventKey, &Event)> {
        self.events.range(
            EventKey { key, seq: 0 }..=EventKey {
                key,
                seq: u64::MAX,
            },
        )
    }

    fn take(&mut self, ek: EventKey) -> Option<(u64, Event)> {
        let event = self.events.remove(&ek)?;
        self.total_weight -= ek.key;
        Some((ek.key, event))
    }

    /// Remove the first event under `key` matching `pred`.
    pub fn remove_exact(&mut self, key: u64, pred: impl Fn(&Event) -> bool) -> Option<Event> {
        let ek = self
            .range_of(key)
            .find(|(_, e)| pred(e))
            .map(|(ek, _)| *ek)?;
        self.take(ek).map(|(_, e)| e)
    }

    /// Remove the first event (in key order) matching `pred`.
    pub fn remove_first(&mut self, pred: impl Fn(&Event) -> bool) -> Option<(u64, Event)> {
        let ek = self
            .events
            .iter()
            .find(|(_, e)| pred(e))
            .map(|(ek, _)| *ek)?;
        self.take(ek)
    }

    /// Remove every event matching `pred`; returns how many were removed.
    pub fn remove_all(&mut self, pred: impl Fn(&Event) -> bool) -> usize {
        let keys: Vec<EventKey> = self
            .events
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(ek, _)| *ek)
            .collect();
        for ek in &keys {
            self.take(*ek);
        }
        keys.len()
    }

    /// Remove the event with the smallest key.
    pub fn pop_first(&mut self) -> Option<(u64, Event)> {
        let ek = *self.events.keys().next()?;
        self.take(ek)
    }

    /// Remove the event whose weight band contains `draw`.
    ///
    /// Bands are laid out in key order: the first event covers
    /// `[0, w0)`, the second `[w0, w0 + w1)`, and so on. Zero-weight events
    /// cover nothing and are never chosen.
    pub fn pop_weighted(&mut self, draw: u64) -> Option<(u64, Event)> {
        let mut remaining = draw;
        let ek = *self.events.keys().find(|ek| {
            if remaining < ek.key {
                true
            } else {
                remaining -= ek.key;
                false
            }
        })?;
        self.take(ek)
    }

    /// Remove the `index`-th event in key order.
    pub fn remove_nth(&mut self, index: usize) -> Option<(u64, Event)> {
        let ek = *self.events.keys().nth(index)?;
        self.take(ek)
    }

    /// Whether an event with a non-zero key is pending.
    ///
    /// Zero-weight events alone never keep a path running.
    pub fn has_events(&self) -> bool {
        self.events
            .keys()
            .next_back()
            .map(|ek| ek.key > 0)
            .unwrap_or(false)
    }

    /// Whether any event of `category` is pending. Linear scan.
    pub fn has_events_of(&self, category: EventCategory) -> bool {
        self.events.values().any(|e| e.category() == category)
    }

    /// Whether any pending event matches `pred`. Linear scan.
    pub fn any(&self, pred: impl Fn(u64, &Event) -> bool) -> bool {
        self.events.iter().any(|(ek, e)| pred(ek.key, e))
    }

    /// Sum of all keys.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.total_weight = 0;
    }

    /// Events in key order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Event)> {
        self.events.iter().map(|(ek, e)| (ek.key, e))
    }
}
